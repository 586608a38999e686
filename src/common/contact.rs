//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::Id;
use crate::protocol::Protocol;

/// A contact that was not seen for this long is considered stale.
pub const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

#[derive(Clone)]
/// A remote peer handle in the Kademlia routing table.
///
/// Equality is defined by [Id] alone; the protocol handle and last-seen
/// time do not participate.
pub struct Contact {
    pub id: Id,
    protocol: Arc<dyn Protocol>,
    last_seen: Instant,
}

impl Contact {
    /// Creates a new Contact from an id and a protocol handle to reach it.
    pub fn new(id: Id, protocol: Arc<dyn Protocol>) -> Contact {
        Contact {
            id,
            protocol,
            last_seen: Instant::now(),
        }
    }

    // === Getters ===

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_AFTER
    }

    // === Public Methods ===

    /// Update the last-seen time to now.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Replace the protocol handle and refresh the last-seen time.
    /// The id never changes.
    pub fn update(&mut self, other: &Contact) {
        self.protocol = other.protocol.clone();
        self.last_seen = Instant::now();
    }

    pub(crate) fn with_last_seen(mut self, last_seen: Instant) -> Contact {
        self.last_seen = last_seen;
        self
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Contact({}, {}, last seen {:?} ago)",
            self.id,
            self.protocol.endpoint(),
            self.last_seen.elapsed()
        )
    }
}
