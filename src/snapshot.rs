//! Bencode snapshots of a node's routing table and storage tiers, for warm
//! restarts across process boundaries.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::debug;

use crate::bucket_list::BucketList;
use crate::common::{self, BucketRange, Contact, Id};
use crate::config::Config;
use crate::dht::{Dht, Inner};
use crate::kbucket::KBucket;
use crate::protocol::Protocol;
use crate::storage::{MemoryStore, Storage, StoreValue};
use crate::Result;

/// A complete, serializable picture of one node: id, bucket structure,
/// contact endpoints and all three storage tiers.
///
/// Protocol handles do not serialize; each contact persists the endpoint
/// string of its handle, and [Snapshot::restore] resolves endpoints back
/// into live handles through a caller-supplied factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    id: ByteBuf,
    endpoint: String,
    buckets: Vec<BucketSnapshot>,
    originator: Vec<EntrySnapshot>,
    republish: Vec<EntrySnapshot>,
    cache: Vec<EntrySnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketSnapshot {
    prefix: ByteBuf,
    bits: usize,
    refreshed_ago_secs: u64,
    contacts: Vec<ContactSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContactSnapshot {
    id: ByteBuf,
    endpoint: String,
    seen_ago_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntrySnapshot {
    key: ByteBuf,
    value: ByteBuf,
    age_secs: u64,
    expiration_secs: u64,
}

impl Snapshot {
    // === Getters ===

    pub fn id(&self) -> Result<Id> {
        Id::from_bytes(&self.id)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    // === Public Methods ===

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Snapshot> {
        Ok(serde_bencode::from_bytes(bytes)?)
    }

    // === Private Methods ===

    pub(crate) fn capture(inner: &Inner) -> Snapshot {
        let our_contact = inner.our_contact();

        let buckets = common::lock(&inner.bucket_list)
            .buckets()
            .iter()
            .map(|bucket| BucketSnapshot {
                prefix: ByteBuf::from(bucket.range().low().to_vec()),
                bits: bucket.range().bits(),
                refreshed_ago_secs: bucket.last_refreshed().elapsed().as_secs(),
                contacts: bucket
                    .iter()
                    .map(|contact| ContactSnapshot {
                        id: ByteBuf::from(contact.id.to_vec()),
                        endpoint: contact.protocol().endpoint(),
                        seen_ago_secs: contact.last_seen().elapsed().as_secs(),
                    })
                    .collect(),
            })
            .collect();

        Snapshot {
            id: ByteBuf::from(our_contact.id.to_vec()),
            endpoint: our_contact.protocol().endpoint(),
            buckets,
            originator: capture_tier(&inner.originator),
            republish: capture_tier(&inner.republish),
            cache: capture_tier(&inner.cache),
        }
    }

    pub(crate) fn restore<F>(&self, factory: F, config: Config) -> Result<Dht>
    where
        F: Fn(&str) -> Result<Arc<dyn Protocol>>,
    {
        let our_id = self.id()?;
        let our_contact = Contact::new(our_id, factory(&self.endpoint)?);

        let mut buckets = Vec::with_capacity(self.buckets.len());

        for bucket_snapshot in &self.buckets {
            let range =
                BucketRange::from_prefix(Id::from_bytes(&bucket_snapshot.prefix)?, bucket_snapshot.bits);
            let mut bucket = KBucket::new(range).with_size(config.k);

            for contact_snapshot in &bucket_snapshot.contacts {
                let contact = Contact::new(
                    Id::from_bytes(&contact_snapshot.id)?,
                    factory(&contact_snapshot.endpoint)?,
                )
                .with_last_seen(instant_ago(contact_snapshot.seen_ago_secs));

                bucket.push(contact);
            }

            bucket.set_last_refreshed(instant_ago(bucket_snapshot.refreshed_ago_secs));
            buckets.push(bucket);
        }

        let bucket_list = BucketList::from_buckets(our_id, buckets, config.k, config.b);

        let dht = Dht::from_parts(
            our_contact,
            bucket_list,
            config,
            restore_tier(&self.originator)?,
            restore_tier(&self.republish)?,
            restore_tier(&self.cache)?,
        );

        debug!(id = %our_id, table_size = dht.routing_table_size(), "Restored node from snapshot");

        Ok(dht)
    }
}

fn capture_tier(store: &Arc<dyn Storage>) -> Vec<EntrySnapshot> {
    store
        .entries()
        .into_iter()
        .map(|(key, entry)| EntrySnapshot {
            key: ByteBuf::from(key.to_vec()),
            value: ByteBuf::from(entry.value.to_vec()),
            age_secs: entry.age().as_secs(),
            expiration_secs: entry.expiration_secs,
        })
        .collect()
}

fn restore_tier(entries: &[EntrySnapshot]) -> Result<Arc<dyn Storage>> {
    let store = MemoryStore::new();

    for entry in entries {
        store.set(
            Id::from_bytes(&entry.key)?,
            StoreValue {
                value: Bytes::copy_from_slice(&entry.value),
                republished: SystemTime::now() - Duration::from_secs(entry.age_secs),
                expiration_secs: entry.expiration_secs,
            },
        );
    }

    Ok(Arc::new(store))
}

fn instant_ago(secs: u64) -> Instant {
    let now = Instant::now();

    now.checked_sub(Duration::from_secs(secs)).unwrap_or(now)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bencode_roundtrip() {
        let snapshot = Snapshot {
            id: ByteBuf::from(Id::random().to_vec()),
            endpoint: "virtual:test".to_string(),
            buckets: vec![BucketSnapshot {
                prefix: ByteBuf::from(vec![0_u8; 20]),
                bits: 0,
                refreshed_ago_secs: 12,
                contacts: vec![ContactSnapshot {
                    id: ByteBuf::from(Id::random().to_vec()),
                    endpoint: "virtual:peer".to_string(),
                    seen_ago_secs: 3,
                }],
            }],
            originator: vec![EntrySnapshot {
                key: ByteBuf::from(Id::random().to_vec()),
                value: ByteBuf::from(b"hello".to_vec()),
                age_secs: 60,
                expiration_secs: 86400,
            }],
            republish: vec![],
            cache: vec![],
        };

        let bytes = snapshot.to_bytes().unwrap();
        let decoded = Snapshot::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.id, snapshot.id);
        assert_eq!(decoded.endpoint, snapshot.endpoint);
        assert_eq!(decoded.buckets.len(), 1);
        assert_eq!(decoded.buckets[0].contacts.len(), 1);
        assert_eq!(decoded.originator[0].value.as_ref(), b"hello");
    }

    #[test]
    fn corrupt_bytes_are_an_error() {
        assert!(Snapshot::from_bytes(b"not bencode at all").is_err());
    }
}
