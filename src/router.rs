//! Iterative lookup strategies driving FIND_NODE / FIND_VALUE as the initiator.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{self, Contact, Distance, Id};
use crate::config::Config;
use crate::dht::Inner;
use crate::protocol::FindValueReply;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which RPC an iterative lookup drives against each queried peer.
pub enum RpcCall {
    FindNode,
    FindValue,
}

#[derive(Debug, Clone)]
/// Outcome of one iterative lookup.
pub struct LookupResult {
    /// True when a FIND_VALUE lookup located the value.
    pub found: bool,
    /// Up to K closest contacts accumulated during the lookup, closest first.
    pub contacts: Vec<Contact>,
    /// The peer that supplied the value, when found.
    pub found_by: Option<Contact>,
    pub value: Option<Bytes>,
}

/// The shared contract of the two lookup strategies.
///
/// A router instance holds per-call accumulator state, so only one lookup
/// may be in flight per instance; the exclusive receiver enforces that.
pub trait Lookup: Send {
    fn lookup(&mut self, key: Id, call: RpcCall) -> Result<LookupResult>;
}

/// Per-call accumulator shared by both strategies.
///
/// Candidates are kept in two running sets: "closer" and "farther". Seeds
/// are classified against our own distance to the key; contacts discovered
/// in a response are classified against the queried peer's distance.
struct LookupState {
    key: Id,
    our_id: Id,
    our_distance: Distance,
    k: usize,
    closer: Vec<Contact>,
    farther: Vec<Contact>,
    contacted: HashSet<Id>,
    found: Option<(Contact, Bytes)>,
}

impl LookupState {
    fn new(key: Id, our_id: Id, k: usize) -> Self {
        LookupState {
            key,
            our_id,
            our_distance: our_id.xor(&key),
            k,
            closer: Vec::new(),
            farther: Vec::new(),
            contacted: HashSet::new(),
            found: None,
        }
    }

    fn seed(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            let closer = contact.id.xor(&self.key) < self.our_distance;
            self.insert(contact, closer);
        }
    }

    fn known(&self, id: &Id) -> bool {
        self.closer.iter().any(|c| c.id == *id) || self.farther.iter().any(|c| c.id == *id)
    }

    fn insert(&mut self, contact: Contact, closer: bool) {
        if contact.id == self.our_id || self.known(&contact.id) {
            return;
        }

        if closer {
            self.closer.push(contact);
        } else {
            self.farther.push(contact);
        }
    }

    /// Merge contacts from a response, classified against the responding
    /// peer's own distance to the key.
    fn merge_response(&mut self, from: &Contact, contacts: Vec<Contact>) {
        let from_distance = from.id.xor(&self.key);

        for contact in contacts {
            let closer = contact.id.xor(&self.key) < from_distance;
            self.insert(contact, closer);
        }
    }

    /// Drop an unreachable peer from the candidate sets; it must not appear
    /// in the returned closest set.
    fn record_failure(&mut self, id: &Id) {
        self.closer.retain(|c| c.id != *id);
        self.farther.retain(|c| c.id != *id);
    }

    fn set_found(&mut self, from: Contact, value: Bytes) {
        if self.found.is_none() {
            self.found = Some((from, value));
        }
    }

    /// The initial query batch: the `alpha` closest known candidates,
    /// regardless of which running set they fell into.
    fn initial_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let mut candidates: Vec<Contact> =
            self.closer.iter().chain(self.farther.iter()).cloned().collect();
        candidates.sort_by_key(|c| c.id.xor(&self.key));
        candidates.truncate(alpha);

        for contact in &candidates {
            self.contacted.insert(contact.id);
        }

        candidates
    }

    /// The next `alpha` uncontacted peers, preferring the closer set and
    /// falling back to the farther set, closest first within each.
    fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let mut batch: Vec<Contact> = Vec::with_capacity(alpha);

        for set in [&self.closer, &self.farther] {
            let mut candidates: Vec<Contact> = set
                .iter()
                .filter(|c| !self.contacted.contains(&c.id))
                .cloned()
                .collect();
            candidates.sort_by_key(|c| c.id.xor(&self.key));

            for contact in candidates {
                if batch.len() >= alpha {
                    break;
                }
                batch.push(contact);
            }
        }

        for contact in &batch {
            self.contacted.insert(contact.id);
        }

        batch
    }

    /// The accumulated closer set has reached K members.
    fn is_complete(&self) -> bool {
        self.closer.len() >= self.k
    }

    /// A cheap measure of accumulated knowledge, used by the parallel
    /// strategy to detect stalled progress.
    fn progress(&self) -> usize {
        self.closer.len() + self.farther.len() + self.contacted.len()
    }

    fn result(&self) -> LookupResult {
        let mut contacts: Vec<Contact> =
            self.closer.iter().chain(self.farther.iter()).cloned().collect();
        contacts.sort_by_key(|c| c.id.xor(&self.key));
        contacts.truncate(self.k);

        let (found_by, value) = match &self.found {
            Some((from, value)) => (Some(from.clone()), Some(value.clone())),
            None => (None, None),
        };

        LookupResult {
            found: self.found.is_some(),
            contacts,
            found_by,
            value,
        }
    }
}

fn dispatch(
    sender: &Contact,
    contact: &Contact,
    key: Id,
    call: RpcCall,
) -> std::result::Result<FindValueReply, crate::protocol::RpcError> {
    match call {
        RpcCall::FindNode => contact
            .protocol()
            .find_node(sender, key)
            .map(FindValueReply::contacts),
        RpcCall::FindValue => contact.protocol().find_value(sender, key),
    }
}

/// Sequential lookup strategy: one RPC batch at a time on the calling
/// thread, deterministic ordering, no concurrency.
pub struct Router {
    inner: Weak<Inner>,
    k: usize,
    alpha: usize,
}

impl Router {
    pub(crate) fn new(inner: Weak<Inner>, config: &Config) -> Self {
        Router {
            inner,
            k: config.k,
            alpha: config.alpha,
        }
    }
}

impl Lookup for Router {
    fn lookup(&mut self, key: Id, call: RpcCall) -> Result<LookupResult> {
        let inner = self.inner.upgrade().ok_or(Error::RouterNotWired)?;
        let sender = inner.our_contact();

        let mut state = LookupState::new(key, sender.id, self.k);
        state.seed(inner.lookup_seeds(&key)?);

        let mut batch = state.initial_batch(self.alpha);

        while !batch.is_empty() {
            for contact in batch {
                match dispatch(&sender, &contact, key, call) {
                    Ok(reply) => {
                        if let Some(value) = reply.value {
                            debug!(?key, from = %contact.id, "Lookup found value");
                            state.set_found(contact, value);
                            return Ok(state.result());
                        }

                        state.merge_response(&contact, reply.contacts.unwrap_or_default());
                    }
                    Err(error) => {
                        trace!(?key, contact = %contact.id, %error, "Lookup peer unreachable");
                        state.record_failure(&contact.id);
                        inner.handle_error(&error, &contact);
                    }
                }
            }

            if state.is_complete() {
                break;
            }

            batch = state.next_batch(self.alpha);
        }

        Ok(state.result())
    }
}

struct SharedLookup {
    state: Mutex<LookupState>,
    /// Set once the lookup is decided; dispatched-but-unstarted work is
    /// discarded rather than cancelled.
    stop: AtomicBool,
    outstanding: AtomicUsize,
}

struct WorkItem {
    contact: Contact,
    key: Id,
    call: RpcCall,
    shared: Arc<SharedLookup>,
}

/// Concurrent lookup strategy: RPC batches are dispatched to a bounded
/// worker pool through a work queue, and the initiating call polls the
/// shared accumulator at a fixed interval.
pub struct ParallelRouter {
    inner: Weak<Inner>,
    k: usize,
    alpha: usize,
    poll_interval: Duration,
    query_time: Duration,
    work: flume::Sender<WorkItem>,
}

impl ParallelRouter {
    pub(crate) fn new(inner: Weak<Inner>, config: &Config) -> Self {
        let (work, queue) = flume::bounded::<WorkItem>(config.pool_size * 2);

        for _ in 0..config.pool_size {
            let queue = queue.clone();
            let inner = inner.clone();

            // Workers exit when the router is dropped and the queue closes.
            thread::spawn(move || worker(inner, queue));
        }

        ParallelRouter {
            inner,
            k: config.k,
            alpha: config.alpha,
            poll_interval: config.poll_interval,
            query_time: config.query_time,
            work,
        }
    }

    fn dispatch_batch(&self, shared: &Arc<SharedLookup>, batch: Vec<Contact>, key: Id, call: RpcCall) {
        for contact in batch {
            shared.outstanding.fetch_add(1, Ordering::SeqCst);

            let item = WorkItem {
                contact,
                key,
                call,
                shared: shared.clone(),
            };

            if self.work.send(item).is_err() {
                // No workers left; nothing will decrement for this item.
                shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Lookup for ParallelRouter {
    fn lookup(&mut self, key: Id, call: RpcCall) -> Result<LookupResult> {
        let inner = self.inner.upgrade().ok_or(Error::RouterNotWired)?;

        let shared = Arc::new(SharedLookup {
            state: Mutex::new(LookupState::new(key, inner.id(), self.k)),
            stop: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
        });

        let first = {
            let mut state = common::lock(&shared.state);
            state.seed(inner.lookup_seeds(&key)?);
            state.initial_batch(self.alpha)
        };

        self.dispatch_batch(&shared, first, key, call);

        let mut last_progress = Instant::now();
        let mut last_seen_progress = 0;

        loop {
            thread::sleep(self.poll_interval);

            let (done, progress) = {
                let state = common::lock(&shared.state);
                (state.found.is_some() || state.is_complete(), state.progress())
            };

            if progress > last_seen_progress {
                last_seen_progress = progress;
                last_progress = Instant::now();
            }

            if done {
                break;
            }

            if shared.outstanding.load(Ordering::SeqCst) == 0 {
                let batch = common::lock(&shared.state).next_batch(self.alpha);

                if batch.is_empty() {
                    break;
                }

                self.dispatch_batch(&shared, batch, key, call);
            } else if last_progress.elapsed() > self.query_time {
                debug!(?key, "Parallel lookup made no progress within the query window");
                break;
            }
        }

        shared.stop.store(true, Ordering::SeqCst);

        let result = common::lock(&shared.state).result();
        Ok(result)
    }
}

fn worker(inner: Weak<Inner>, queue: flume::Receiver<WorkItem>) {
    for item in queue.iter() {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        if item.shared.stop.load(Ordering::SeqCst) {
            item.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        let sender = inner.our_contact();

        match dispatch(&sender, &item.contact, item.key, item.call) {
            Ok(reply) => {
                let mut state = common::lock(&item.shared.state);

                if let Some(value) = reply.value {
                    state.set_found(item.contact.clone(), value);
                    item.shared.stop.store(true, Ordering::SeqCst);
                } else {
                    state.merge_response(&item.contact, reply.contacts.unwrap_or_default());
                }
            }
            Err(error) => {
                common::lock(&item.shared.state).record_failure(&item.contact.id);
                inner.handle_error(&error, &item.contact);
            }
        }

        item.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testnet::VirtualProtocol;

    fn contact(id: Id) -> Contact {
        Contact::new(id, Arc::new(VirtualProtocol::new(id)))
    }

    fn id_with_last_byte(byte: u8) -> Id {
        let mut bytes = [0_u8; 20];
        bytes[19] = byte;
        Id::from_bytes(bytes).unwrap()
    }

    #[test]
    fn seeds_classify_against_our_distance() {
        let key = id_with_last_byte(0);
        let our_id = id_with_last_byte(8);

        let mut state = LookupState::new(key, our_id, 20);

        let near = contact(id_with_last_byte(1));
        let far = contact(id_with_last_byte(200));
        state.seed(vec![near.clone(), far.clone()]);

        assert_eq!(state.closer, vec![near]);
        assert_eq!(state.farther, vec![far]);
    }

    #[test]
    fn batches_prefer_closer_uncontacted() {
        let key = id_with_last_byte(0);
        let our_id = id_with_last_byte(0x10);

        let mut state = LookupState::new(key, our_id, 20);

        state.seed((1..=9).map(|i| contact(id_with_last_byte(i))).collect());

        let first = state.initial_batch(3);
        assert_eq!(
            first.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![
                id_with_last_byte(1),
                id_with_last_byte(2),
                id_with_last_byte(3)
            ]
        );

        let second = state.next_batch(3);
        assert_eq!(
            second.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![
                id_with_last_byte(4),
                id_with_last_byte(5),
                id_with_last_byte(6)
            ]
        );
    }

    #[test]
    fn failed_peers_are_excluded_from_results() {
        let key = id_with_last_byte(0);
        let our_id = id_with_last_byte(0xff);

        let mut state = LookupState::new(key, our_id, 20);

        let dead = contact(id_with_last_byte(1));
        state.seed(vec![dead.clone(), contact(id_with_last_byte(2))]);
        state.record_failure(&dead.id);

        let result = state.result();
        assert!(!result.found);
        assert_eq!(result.contacts.len(), 1);
        assert_eq!(result.contacts[0].id, id_with_last_byte(2));
    }

    #[test]
    fn first_found_value_wins() {
        let key = id_with_last_byte(0);
        let mut state = LookupState::new(key, id_with_last_byte(0xff), 20);

        let first = contact(id_with_last_byte(1));
        state.set_found(first.clone(), Bytes::from_static(b"one"));
        state.set_found(contact(id_with_last_byte(2)), Bytes::from_static(b"two"));

        let result = state.result();
        assert!(result.found);
        assert_eq!(result.found_by, Some(first));
        assert_eq!(result.value, Some(Bytes::from_static(b"one")));
    }
}
