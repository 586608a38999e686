//! Key/value storage tiers with per-entry republish timestamps and expiration.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::common::{self, Id};

#[derive(Debug, Clone)]
/// A stored value with its replication bookkeeping.
pub struct StoreValue {
    pub value: Bytes,
    /// Last time this entry was written or re-pushed to the network.
    pub republished: SystemTime,
    /// Seconds after `republished` at which this entry expires.
    pub expiration_secs: u64,
}

impl StoreValue {
    pub fn new(value: Bytes, expiration_secs: u64) -> Self {
        StoreValue {
            value,
            republished: SystemTime::now(),
            expiration_secs,
        }
    }

    /// Age of the entry since it was last republished.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.republished)
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        self.age().as_secs() >= self.expiration_secs
    }
}

/// A key/value store one tier of the DHT persists entries in.
///
/// The engine never assumes more than a concurrent key→entry map: reads by
/// the background timers run alongside RPC-triggered writes, and no
/// cross-key transactions exist.
pub trait Storage: Send + Sync + Debug {
    fn get(&self, key: &Id) -> Option<StoreValue>;

    fn set(&self, key: Id, entry: StoreValue);

    fn contains(&self, key: &Id) -> bool;

    fn remove(&self, key: &Id);

    /// Reset the republish timestamp of an entry to now.
    fn touch(&self, key: &Id);

    fn keys(&self) -> Vec<Id>;

    fn entries(&self) -> Vec<(Id, StoreValue)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
/// In-memory [Storage] backend used for all tiers unless a persistent
/// collaborator is supplied.
pub struct MemoryStore {
    entries: RwLock<HashMap<Id, StoreValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Storage for MemoryStore {
    fn get(&self, key: &Id) -> Option<StoreValue> {
        common::read(&self.entries).get(key).cloned()
    }

    fn set(&self, key: Id, entry: StoreValue) {
        common::write(&self.entries).insert(key, entry);
    }

    fn contains(&self, key: &Id) -> bool {
        common::read(&self.entries).contains_key(key)
    }

    fn remove(&self, key: &Id) {
        common::write(&self.entries).remove(key);
    }

    fn touch(&self, key: &Id) {
        if let Some(entry) = common::write(&self.entries).get_mut(key) {
            entry.republished = SystemTime::now();
        }
    }

    fn keys(&self) -> Vec<Id> {
        common::read(&self.entries).keys().copied().collect()
    }

    fn entries(&self) -> Vec<(Id, StoreValue)> {
        common::read(&self.entries)
            .iter()
            .map(|(key, entry)| (*key, entry.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        common::read(&self.entries).len()
    }
}
