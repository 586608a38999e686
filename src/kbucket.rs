//! Kbuckets
use std::{
    fmt::{self, Debug, Formatter},
    slice::Iter,
    time::Instant,
};

use crate::common::{BucketRange, Contact, Id, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_K: usize = 20;

/// A capacity-bounded list of contacts covering a contiguous sub-range of
/// the Id space.
///
/// Contacts are ordered by recency: the least-recently-seen contact sits at
/// the head, the most-recently-seen at the tail.
pub struct KBucket {
    /// K (as in k-bucket) is the maximum number of contacts in a k-bucket.
    /// This controls the redundancy factor of the DHT, the higher
    /// the more nodes we store (and thus lookup) values at.
    k: usize,
    range: BucketRange,
    contacts: Vec<Contact>,
    /// Last time a refresh lookup ran through this bucket.
    last_refreshed: Instant,
}

impl KBucket {
    pub fn new(range: BucketRange) -> Self {
        KBucket {
            k: DEFAULT_K,
            range,
            contacts: Vec::with_capacity(DEFAULT_K),
            last_refreshed: Instant::now(),
        }
    }

    // === Options ===

    pub fn with_size(mut self, k: usize) -> Self {
        self.k = k;
        self.contacts.reserve(k);
        self
    }

    // === Getters ===

    pub fn range(&self) -> &BucketRange {
        &self.range
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn last_refreshed(&self) -> Instant {
        self.last_refreshed
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.k
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// The least-recently-seen contact, first in line for a liveness check
    /// when the bucket is full.
    pub fn least_recent(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// Number of leading bits shared by all contacts currently in the bucket.
    ///
    /// An empty bucket reports the full id width; the depth only matters for
    /// split eligibility, which is never evaluated on an empty bucket.
    pub fn depth(&self) -> usize {
        let mut contacts = self.contacts.iter();

        let first = match contacts.next() {
            Some(contact) => contact,
            None => return ID_BITS,
        };

        contacts.fold(ID_BITS, |depth, contact| {
            depth.min(first.id.shared_prefix_bits(&contact.id))
        })
    }

    pub fn has_in_range(&self, id: &Id) -> bool {
        self.range.contains(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.contacts.iter().any(|contact| contact.id == *id)
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    // === Public Methods ===

    /// Append a contact at the tail (most-recently-seen position).
    /// Returns false when the bucket is full or already holds the id.
    pub fn push(&mut self, contact: Contact) -> bool {
        debug_assert!(self.range.contains(&contact.id));

        if self.contains(&contact.id) || self.is_full() {
            return false;
        }

        self.contacts.push(contact);
        true
    }

    /// Replace an existing contact in place: the protocol handle and
    /// last-seen time are updated, the position in the list is kept.
    pub fn replace(&mut self, contact: &Contact) -> bool {
        match self.contacts.iter_mut().find(|c| c.id == contact.id) {
            Some(existing) => {
                existing.update(contact);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let position = self.contacts.iter().position(|contact| contact.id == *id)?;

        Some(self.contacts.remove(position))
    }

    /// Split this bucket at the numeric midpoint of its range into two
    /// half-range children. Contacts below the midpoint land in the left
    /// child, the rest in the right, both keeping their recency order.
    pub fn split(self) -> (KBucket, KBucket) {
        let (left_range, right_range) = self.range.split();

        let mut left = KBucket::new(left_range).with_size(self.k);
        let mut right = KBucket::new(right_range).with_size(self.k);

        left.last_refreshed = self.last_refreshed;
        right.last_refreshed = self.last_refreshed;

        for contact in self.contacts {
            if left.range.contains(&contact.id) {
                left.contacts.push(contact);
            } else {
                right.contacts.push(contact);
            }
        }

        (left, right)
    }

    /// Mark the bucket as refreshed now.
    pub fn touch(&mut self) {
        self.last_refreshed = Instant::now();
    }

    pub(crate) fn set_last_refreshed(&mut self, last_refreshed: Instant) {
        self.last_refreshed = last_refreshed;
    }
}

impl Debug for KBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KBucket({:?}, {}/{} contacts)",
            self.range,
            self.contacts.len(),
            self.k
        )
    }
}
