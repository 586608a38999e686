//! Dht node: the façade owning the routing table, storage tiers, router and
//! background maintenance.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::bucket_list::{Admission, BucketList};
use crate::common::{self, Contact, Id};
use crate::config::Config;
use crate::node::Node;
use crate::protocol::{Protocol, RpcError};
use crate::router::{Lookup, LookupResult, ParallelRouter, Router, RpcCall};
use crate::snapshot::Snapshot;
use crate::storage::{MemoryStore, Storage, StoreValue};
use crate::{Error, Result};

/// Shared state of one running peer. The Dht façade, its [Node] server view
/// and the routers all operate on this.
pub(crate) struct Inner {
    pub(crate) config: Config,
    our_contact: Contact,
    pub(crate) bucket_list: Mutex<BucketList>,
    /// Values this node authored.
    pub(crate) originator: Arc<dyn Storage>,
    /// Values this node replicates on behalf of other nodes.
    pub(crate) republish: Arc<dyn Storage>,
    /// Opportunistically cached values with distance-decayed expirations.
    pub(crate) cache: Arc<dyn Storage>,
    /// Replacement candidates for full buckets, most recently queued last.
    pending: Mutex<Vec<Contact>>,
    /// Consecutive failed interactions per contact, shared by the generic
    /// error path and the split-avoidance ping path.
    eviction_counts: Mutex<HashMap<Id, u32>>,
    /// Wired by the owning Dht right after construction.
    router: Mutex<Option<Box<dyn Lookup>>>,
}

impl Inner {
    // === Getters ===

    pub(crate) fn id(&self) -> Id {
        self.our_contact.id
    }

    pub(crate) fn our_contact(&self) -> Contact {
        self.our_contact.clone()
    }

    // === Contact admission ===

    /// Admit a contact, driving the liveness ping and pending-contact
    /// bookkeeping when its bucket is full and unsplittable.
    pub(crate) fn add_contact(&self, contact: Contact) -> Result<()> {
        let admission = common::lock(&self.bucket_list).add_contact(contact.clone())?;

        match admission {
            Admission::Added | Admission::Replaced => {
                // A successful interaction resets the failure streak.
                common::lock(&self.eviction_counts).remove(&contact.id);
            }
            Admission::Full { least_recent } => {
                trace!(
                    contact = %contact.id,
                    bucket_head = %least_recent.id,
                    "Bucket full, pinging least recently seen contact"
                );

                // The new contact waits as a replacement candidate either way.
                self.push_pending(contact);

                match least_recent.protocol().ping(&self.our_contact) {
                    Ok(()) => {
                        common::lock(&self.eviction_counts).remove(&least_recent.id);
                    }
                    Err(rpc_error) => self.handle_error(&rpc_error, &least_recent),
                }
            }
        }

        Ok(())
    }

    /// Learn the sender of an inbound RPC. When `seed` is set and the
    /// contact is new, push it every stored key it is now closest to.
    pub(crate) fn learn_sender(&self, sender: &Contact, seed: bool) -> Result<()> {
        let is_new = !common::lock(&self.bucket_list).contains(&sender.id);

        self.add_contact(sender.clone())?;

        if seed && is_new {
            self.seed_new_contact(sender);
        }

        Ok(())
    }

    /// Feed a remote-call failure into the eviction policy: any non-trivial
    /// error counts against the contact, and reaching the eviction limit
    /// replaces it from the pending-contacts list.
    pub(crate) fn handle_error(&self, rpc_error: &RpcError, contact: &Contact) {
        if !rpc_error.has_error() {
            return;
        }

        let failures = {
            let mut counts = common::lock(&self.eviction_counts);
            let count = counts.entry(contact.id).or_insert(0);
            *count += 1;
            *count
        };

        debug!(contact = %contact.id, failures, %rpc_error, "Rpc failure");

        if failures >= self.config.eviction_limit {
            self.evict_and_replace(contact);
        }
    }

    // === Lookups ===

    pub(crate) fn lookup(&self, key: Id, call: RpcCall) -> Result<LookupResult> {
        let mut guard = common::lock(&self.router);
        let router = guard.as_mut().ok_or(Error::RouterNotWired)?;

        router.lookup(key, call)
    }

    /// Seed candidates for a lookup: up to K contacts closest to `key`.
    /// A lookup against an empty table is an invariant violation.
    pub(crate) fn lookup_seeds(&self, key: &Id) -> Result<Vec<Contact>> {
        let table = common::lock(&self.bucket_list);

        if table.is_empty() {
            return Err(Error::EmptyRoutingTable);
        }

        Ok(table.closest(key, self.config.k))
    }

    // === Maintenance passes ===

    /// Run a random-id FIND_NODE lookup through the contacts of every
    /// bucket the filter admits, learning whatever comes back.
    pub(crate) fn refresh_buckets(&self, only_stale: bool, skip_covering: Option<&Id>) {
        let plans: Vec<(Id, Vec<Contact>)> = {
            let table = common::lock(&self.bucket_list);

            table
                .buckets()
                .iter()
                .filter(|bucket| {
                    if let Some(id) = skip_covering {
                        if bucket.has_in_range(id) {
                            return false;
                        }
                    }
                    !only_stale
                        || bucket.last_refreshed().elapsed() > self.config.bucket_refresh_interval
                })
                .map(|bucket| (bucket.range().random_id(), bucket.contacts().to_vec()))
                .collect()
        };

        for (random_id, contacts) in plans {
            trace!(refresh_id = %random_id, "Refreshing bucket");

            for contact in contacts {
                match contact.protocol().find_node(&self.our_contact, random_id) {
                    Ok(found) => {
                        for found_contact in found {
                            let _ = self.add_contact(found_contact);
                        }
                    }
                    Err(rpc_error) => self.handle_error(&rpc_error, &contact),
                }
            }

            // Splits may have shifted indices; touch by id instead.
            common::lock(&self.bucket_list).touch_bucket(&random_id);
        }
    }

    /// Re-push republish-tier entries that went untouched past the
    /// republish interval to the currently closest contacts.
    pub(crate) fn republish_keys(&self) {
        for (key, entry) in self.republish.entries() {
            if entry.age() < self.config.key_republish_interval {
                continue;
            }

            let targets = match self.store_targets(&key) {
                Ok(targets) => targets,
                Err(_) => continue,
            };

            debug!(%key, targets = targets.len(), "Republishing key");

            for target in targets {
                self.store_at(&target, key, entry.value.clone(), false, entry.expiration_secs);
            }

            self.republish.touch(&key);
        }
    }

    /// Re-push authored entries to the closest contacts currently known,
    /// without a fresh lookup.
    pub(crate) fn republish_originated(&self) {
        for (key, entry) in self.originator.entries() {
            if entry.age() < self.config.originator_republish_interval {
                continue;
            }

            let targets = common::lock(&self.bucket_list).closest(&key, self.config.k);

            debug!(%key, targets = targets.len(), "Republishing originated key");

            for target in targets {
                self.store_at(&target, key, entry.value.clone(), false, entry.expiration_secs);
            }

            self.originator.touch(&key);
        }
    }

    /// Ping every contact not seen within [STALE_AFTER](crate::STALE_AFTER),
    /// refreshing the responsive ones and counting a failure against the
    /// rest.
    pub(crate) fn ping_stale_contacts(&self) {
        let stale: Vec<Contact> = common::lock(&self.bucket_list)
            .to_vec()
            .into_iter()
            .filter(|contact| contact.is_stale())
            .collect();

        for contact in stale {
            trace!(contact = %contact.id, "Pinging stale contact");

            match contact.protocol().ping(&self.our_contact) {
                Ok(()) => {
                    // Re-admission touches the contact and clears its
                    // failure streak.
                    let _ = self.add_contact(contact);
                }
                Err(rpc_error) => self.handle_error(&rpc_error, &contact),
            }
        }
    }

    /// Remove cache and republish entries whose age reached their stored
    /// expiration. Authored values never expire locally.
    pub(crate) fn expire_keys(&self) {
        for store in [&self.cache, &self.republish] {
            for (key, entry) in store.entries() {
                if entry.is_expired() {
                    trace!(%key, "Expiring stored value");
                    store.remove(&key);
                }
            }
        }
    }

    // === Store propagation ===

    /// Push a value to the contacts closest to `key`: directly to the known
    /// closest when the owning bucket was refreshed recently, otherwise to
    /// the closest discovered by a FIND_NODE lookup.
    pub(crate) fn propagate_store(&self, key: Id, value: Bytes, expiration_secs: u64) -> Result<()> {
        let (empty, recently_refreshed, known_closest) = {
            let table = common::lock(&self.bucket_list);
            let index = table.bucket_index_of(&key);

            (
                table.is_empty(),
                table.buckets()[index].last_refreshed().elapsed()
                    < self.config.bucket_refresh_interval,
                table.closest(&key, self.config.k),
            )
        };

        if empty {
            // Nobody to replicate to yet; the value stays local.
            return Ok(());
        }

        let targets = if recently_refreshed {
            known_closest
        } else {
            self.lookup(key, RpcCall::FindNode)?.contacts
        };

        for target in targets {
            self.store_at(&target, key, value.clone(), false, expiration_secs);
        }

        Ok(())
    }

    fn store_at(&self, target: &Contact, key: Id, value: Bytes, is_cached: bool, expiration_secs: u64) {
        if let Err(rpc_error) =
            target
                .protocol()
                .store(&self.our_contact, key, value, is_cached, expiration_secs)
        {
            self.handle_error(&rpc_error, target);
        }
    }

    // === Private Methods ===

    fn push_pending(&self, contact: Contact) {
        let mut pending = common::lock(&self.pending);

        pending.retain(|candidate| candidate.id != contact.id);
        pending.push(contact);
    }

    fn evict_and_replace(&self, contact: &Contact) {
        common::lock(&self.eviction_counts).remove(&contact.id);

        let mut table = common::lock(&self.bucket_list);

        if !table.contains(&contact.id) {
            // The failures came from a peer we never admitted; nothing to
            // evict and no pending candidate to promote.
            return;
        }

        let range = *table.buckets()[table.bucket_index_of(&contact.id)].range();

        if table.evict(&contact.id).is_err() {
            return;
        }

        debug!(contact = %contact.id, "Evicted unresponsive contact");

        let promoted = {
            let mut pending = common::lock(&self.pending);

            pending
                .iter()
                .rposition(|candidate| range.contains(&candidate.id))
                .map(|position| pending.remove(position))
        };

        if let Some(candidate) = promoted {
            debug!(contact = %candidate.id, "Promoted pending contact");
            table.push_direct(candidate);
        }
    }

    /// Push every stored key the new contact is now closer to than any
    /// other contact we know of.
    fn seed_new_contact(&self, sender: &Contact) {
        let contacts = common::lock(&self.bucket_list).to_vec();

        for (key, entry) in self.republish.entries() {
            let sender_distance = sender.id.xor(&key);

            let closest = contacts
                .iter()
                .filter(|contact| contact.id != sender.id)
                .map(|contact| contact.id.xor(&key))
                .min()
                .map_or(true, |nearest| sender_distance < nearest);

            if closest {
                trace!(%key, contact = %sender.id, "Seeding new contact with key");
                self.store_at(sender, key, entry.value.clone(), false, entry.expiration_secs);
            }
        }
    }

    fn store_targets(&self, key: &Id) -> Result<Vec<Contact>> {
        let (recently_refreshed, known_closest) = {
            let table = common::lock(&self.bucket_list);
            let index = table.bucket_index_of(key);

            (
                table.buckets()[index].last_refreshed().elapsed()
                    < self.config.bucket_refresh_interval,
                table.closest(key, self.config.k),
            )
        };

        if recently_refreshed {
            Ok(known_closest)
        } else {
            Ok(self.lookup(*key, RpcCall::FindNode)?.contacts)
        }
    }

    /// Count of known contacts numerically between our id and `target`,
    /// used for the distance-decayed cache expiration.
    fn separating_contacts(&self, target: &Id) -> usize {
        let our_id = self.id();
        let (low, high) = if our_id < *target {
            (our_id, *target)
        } else {
            (*target, our_id)
        };

        common::lock(&self.bucket_list)
            .to_vec()
            .iter()
            .filter(|contact| contact.id > low && contact.id < high)
            .count()
    }
}

impl Debug for Inner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Inner({})", self.id())
    }
}

/// A Kademlia DHT peer.
///
/// Owns the local [Node], the router, the three storage tiers and the
/// background maintenance thread.
pub struct Dht {
    inner: Arc<Inner>,
    shutdown: Option<flume::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Dht {
    /// Create a new Dht node with in-memory storage tiers.
    ///
    /// `protocol` is the handle through which *other* peers reach this
    /// node; it travels inside our own contact on every outbound RPC.
    pub fn new(id: Id, protocol: Arc<dyn Protocol>, config: Config) -> Self {
        Self::with_storage(
            id,
            protocol,
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    /// Create a new Dht node over caller-provided storage tiers.
    pub fn with_storage(
        id: Id,
        protocol: Arc<dyn Protocol>,
        config: Config,
        originator: Arc<dyn Storage>,
        republish: Arc<dyn Storage>,
        cache: Arc<dyn Storage>,
    ) -> Self {
        let bucket_list = BucketList::new(id).with_k(config.k).with_b(config.b);

        Self::from_parts(
            Contact::new(id, protocol),
            bucket_list,
            config,
            originator,
            republish,
            cache,
        )
    }

    pub(crate) fn from_parts(
        our_contact: Contact,
        bucket_list: BucketList,
        config: Config,
        originator: Arc<dyn Storage>,
        republish: Arc<dyn Storage>,
        cache: Arc<dyn Storage>,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            our_contact,
            bucket_list: Mutex::new(bucket_list),
            originator,
            republish,
            cache,
            pending: Mutex::new(Vec::new()),
            eviction_counts: Mutex::new(HashMap::new()),
            router: Mutex::new(None),
        });

        // Post-construction wiring: the router holds a non-owning reference
        // back into the shared state it searches through.
        let router: Box<dyn Lookup> = if inner.config.parallel {
            Box::new(ParallelRouter::new(Arc::downgrade(&inner), &inner.config))
        } else {
            Box::new(Router::new(Arc::downgrade(&inner), &inner.config))
        };
        *common::lock(&inner.router) = Some(router);

        let (shutdown, handle) = if inner.config.maintenance {
            let (sender, receiver) = flume::bounded::<()>(1);
            let weak = Arc::downgrade(&inner);
            let tick = inner.config.maintenance_tick;

            let handle = thread::spawn(move || run_maintenance(weak, receiver, tick));

            (Some(sender), Some(handle))
        } else {
            (None, None)
        };

        Dht {
            inner,
            shutdown,
            handle,
        }
    }

    // === Getters ===

    pub fn id(&self) -> Id {
        self.inner.id()
    }

    pub fn our_contact(&self) -> Contact {
        self.inner.our_contact()
    }

    /// The server-side view of this peer, to be wired into a transport.
    pub fn node(&self) -> Node {
        Node {
            inner: self.inner.clone(),
        }
    }

    /// Number of contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        common::lock(&self.inner.bucket_list).size()
    }

    pub fn contains(&self, id: &Id) -> bool {
        common::lock(&self.inner.bucket_list).contains(id)
    }

    /// All contacts currently in the routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        common::lock(&self.inner.bucket_list).to_vec()
    }

    pub fn originator_storage(&self) -> Arc<dyn Storage> {
        self.inner.originator.clone()
    }

    pub fn republish_storage(&self) -> Arc<dyn Storage> {
        self.inner.republish.clone()
    }

    pub fn cache_storage(&self) -> Arc<dyn Storage> {
        self.inner.cache.clone()
    }

    // === Public Methods ===

    /// Admit a contact into the routing table, pinging the least recently
    /// seen contact of a full bucket before anything is evicted.
    pub fn add_contact(&self, contact: Contact) -> Result<()> {
        self.inner.add_contact(contact)
    }

    /// Iteratively locate the K contacts closest to `target` across the
    /// network, closest first.
    pub fn find_node(&self, target: Id) -> Result<Vec<Contact>> {
        Ok(self.inner.lookup(target, RpcCall::FindNode)?.contacts)
    }

    /// Join the network through one known peer: learn it, locate ourselves
    /// with a FIND_NODE on our own id, then refresh every bucket except the
    /// peer's own to rapidly populate the table.
    pub fn bootstrap(&self, known_peer: Contact) -> Result<()> {
        debug!(peer = %known_peer.id, "Bootstrapping");

        self.inner.add_contact(known_peer.clone())?;

        let contacts = known_peer
            .protocol()
            .find_node(&self.inner.our_contact(), self.id())
            .map_err(|rpc_error| {
                error!(peer = %known_peer.id, %rpc_error, "Bootstrap peer unreachable");
                self.inner.handle_error(&rpc_error, &known_peer);
                Error::Rpc(rpc_error)
            })?;

        for contact in contacts {
            let _ = self.inner.add_contact(contact);
        }

        self.inner.refresh_buckets(false, Some(&known_peer.id));

        debug!(table_size = self.routing_table_size(), "Bootstrap complete");

        Ok(())
    }

    /// Author a key/value pair: keep it in the originator tier and
    /// replicate it toward the K contacts closest to the key.
    pub fn store(&self, key: Id, value: Bytes) -> Result<()> {
        let expiration_secs = self.inner.config.expiration_secs;

        self.inner
            .originator
            .set(key, StoreValue::new(value.clone(), expiration_secs));

        self.inner.propagate_store(key, value, expiration_secs)
    }

    /// Resolve a key: originator, republish and cache tiers first, then an
    /// iterative FIND_VALUE lookup. A value found remotely is cached at the
    /// closest responding contact that did not hold it, with an expiration
    /// halved for every contact separating us from that target in id order.
    pub fn find_value(&self, key: Id) -> Result<Option<Bytes>> {
        for store in [
            &self.inner.originator,
            &self.inner.republish,
            &self.inner.cache,
        ] {
            if let Some(entry) = store.get(&key) {
                if !entry.is_expired() {
                    return Ok(Some(entry.value));
                }
            }
        }

        let result = self.inner.lookup(key, RpcCall::FindValue)?;

        let (found_by, value) = match (result.found_by, result.value) {
            (Some(found_by), Some(value)) => (found_by, value),
            _ => return Ok(None),
        };

        common::lock(&self.inner.bucket_list).touch_bucket(&key);

        let cache_target = result
            .contacts
            .iter()
            .filter(|contact| contact.id != found_by.id)
            .min_by_key(|contact| contact.id.xor(&key));

        if let Some(target) = cache_target {
            let separation = self.inner.separating_contacts(&target.id) as u32;
            let expiration_secs = self.inner.config.expiration_secs >> separation.min(63);

            debug!(
                %key,
                cached_at = %target.id,
                separation,
                expiration_secs,
                "Caching found value"
            );

            self.inner
                .store_at(target, key, value.clone(), true, expiration_secs);
        }

        Ok(Some(value))
    }

    /// Feed a remote-call failure observed outside the Dht's own calls into
    /// the eviction policy.
    pub fn handle_error(&self, rpc_error: &RpcError, contact: &Contact) {
        self.inner.handle_error(rpc_error, contact)
    }

    // === Manual maintenance passes ===

    /// Refresh every bucket that went stale past the refresh interval.
    pub fn refresh_buckets(&self) {
        self.inner.refresh_buckets(true, None);
    }

    /// Re-push replicated entries untouched past the republish interval.
    pub fn republish_keys(&self) {
        self.inner.republish_keys();
    }

    /// Re-push authored entries past the originator republish interval.
    pub fn republish_originated(&self) {
        self.inner.republish_originated();
    }

    /// Ping contacts that went unseen past the staleness window.
    pub fn ping_stale_contacts(&self) {
        self.inner.ping_stale_contacts();
    }

    /// Sweep out expired cache and republish entries.
    pub fn expire_keys(&self) {
        self.inner.expire_keys();
    }

    // === Persistence ===

    /// Capture a full snapshot of the routing table, contacts and storage
    /// tiers for a warm restart.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.inner)
    }

    /// Rebuild a Dht from a snapshot. `factory` resolves each persisted
    /// endpoint back into a protocol handle; back-references between the
    /// node, table and router are rewired before maintenance restarts.
    pub fn restore<F>(snapshot: &Snapshot, factory: F, config: Config) -> Result<Dht>
    where
        F: Fn(&str) -> Result<Arc<dyn Protocol>>,
    {
        snapshot.restore(factory, config)
    }

    /// Stop the background maintenance thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Debug for Dht {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Dht({})", self.id())
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct MaintenanceTimers {
    last_bucket_refresh: Instant,
    last_key_republish: Instant,
    last_originator_republish: Instant,
    last_expiration_sweep: Instant,
}

impl MaintenanceTimers {
    fn new() -> Self {
        let now = Instant::now();

        MaintenanceTimers {
            last_bucket_refresh: now,
            last_key_republish: now,
            last_originator_republish: now,
            last_expiration_sweep: now,
        }
    }

    fn tick(&mut self, inner: &Inner) {
        // Staleness is checked every tick; only actually stale contacts
        // cost a network round-trip.
        inner.ping_stale_contacts();

        if self.last_bucket_refresh.elapsed() > inner.config.bucket_refresh_interval {
            self.last_bucket_refresh = Instant::now();
            inner.refresh_buckets(true, None);
        }

        if self.last_key_republish.elapsed() > inner.config.key_republish_interval {
            self.last_key_republish = Instant::now();
            inner.republish_keys();
        }

        if self.last_originator_republish.elapsed() > inner.config.originator_republish_interval {
            self.last_originator_republish = Instant::now();
            inner.republish_originated();
        }

        if self.last_expiration_sweep.elapsed() > inner.config.expiration_sweep_interval {
            self.last_expiration_sweep = Instant::now();
            inner.expire_keys();
        }
    }
}

fn run_maintenance(
    inner: Weak<Inner>,
    shutdown: flume::Receiver<()>,
    tick: std::time::Duration,
) {
    let mut timers = MaintenanceTimers::new();

    loop {
        match shutdown.recv_timeout(tick) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
            Err(flume::RecvTimeoutError::Timeout) => {}
        }

        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        timers.tick(&inner);
    }
}
