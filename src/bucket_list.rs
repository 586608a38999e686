//! Ordered, space-covering collection of k-buckets owning contact admission.

use std::fmt::{self, Debug, Formatter};

use tracing::trace;

use crate::common::{BucketRange, Contact, Id};
use crate::kbucket::{KBucket, DEFAULT_K};
use crate::{Error, Result};

/// The default branching factor controlling when a full bucket that does not
/// cover our own id may still split.
pub const DEFAULT_B: usize = 5;

/// The routing table: an ordered list of [KBucket]s whose ranges are
/// pairwise disjoint and together cover exactly `[0, 2^160)` at all times.
pub struct BucketList {
    our_id: Id,
    buckets: Vec<KBucket>,
    k: usize,
    b: usize,
}

#[derive(Debug, Clone)]
/// Outcome of [BucketList::add_contact].
///
/// The full-bucket outcome is handed to the owning Dht, which performs the
/// liveness ping and the eviction bookkeeping; the table itself never makes
/// network calls.
pub enum Admission {
    /// The contact was already known; its handle and timestamp were updated.
    Replaced,
    /// The contact was appended to a bucket with spare capacity, possibly
    /// after one or more splits.
    Added,
    /// The owning bucket is full and not eligible to split. The caller
    /// should ping `least_recent` and either evict it or queue the new
    /// contact as a pending replacement.
    Full { least_recent: Contact },
}

impl BucketList {
    pub fn new(our_id: Id) -> Self {
        BucketList {
            our_id,
            buckets: vec![KBucket::new(BucketRange::full())],
            k: DEFAULT_K,
            b: DEFAULT_B,
        }
    }

    // === Options ===

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self.buckets = vec![KBucket::new(BucketRange::full()).with_size(k)];
        self
    }

    pub fn with_b(mut self, b: usize) -> Self {
        self.b = b;
        self
    }

    // === Getters ===

    pub fn our_id(&self) -> Id {
        self.our_id
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Total number of contacts across all buckets.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.buckets[self.bucket_index_of(id)].contains(id)
    }

    /// Index of the bucket whose range covers `id`.
    pub fn bucket_index_of(&self, id: &Id) -> usize {
        self.buckets
            .iter()
            .position(|bucket| bucket.has_in_range(id))
            // The buckets cover the whole id space, every id has an owner.
            .unwrap_or(0)
    }

    /// Returns all contacts in the table.
    pub fn to_vec(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }

    /// Up to `count` contacts closest to `target` by XOR distance,
    /// closest first.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<Contact> {
        let mut contacts = self.to_vec();

        contacts.sort_by_key(|contact| contact.id.xor(target));
        contacts.truncate(count);

        contacts
    }

    // === Public Methods ===

    /// Admit a contact into the table.
    ///
    /// Walks the admission rules in order: refuse self, replace in place,
    /// append when there is room, split while the owning bucket is eligible,
    /// and otherwise report the full bucket's least-recently-seen contact
    /// for the caller to health-check.
    pub fn add_contact(&mut self, mut contact: Contact) -> Result<Admission> {
        if contact.id == self.our_id {
            return Err(Error::SelfContact);
        }

        contact.touch();

        loop {
            let index = self.bucket_index_of(&contact.id);
            let bucket = &mut self.buckets[index];

            if bucket.contains(&contact.id) {
                bucket.replace(&contact);
                return Ok(Admission::Replaced);
            }

            if !bucket.is_full() {
                bucket.push(contact);
                return Ok(Admission::Added);
            }

            if self.can_split(index) {
                self.split(index);
                // Retry against the children.
                continue;
            }

            let least_recent = self.buckets[index]
                .least_recent()
                .cloned()
                // A full bucket always has a head.
                .ok_or(Error::ContactNotFound(contact.id))?;

            return Ok(Admission::Full { least_recent });
        }
    }

    /// Remove a contact from its bucket, returning it.
    ///
    /// Requesting eviction of a contact that is not present is an invariant
    /// violation.
    pub fn evict(&mut self, id: &Id) -> Result<Contact> {
        let index = self.bucket_index_of(id);

        self.buckets[index]
            .remove(id)
            .ok_or(Error::ContactNotFound(*id))
    }

    /// Append a contact directly into the bucket covering it, bypassing the
    /// admission rules. Used to promote a pending replacement into a slot
    /// that was just vacated by an eviction.
    pub(crate) fn push_direct(&mut self, contact: Contact) -> bool {
        let index = self.bucket_index_of(&contact.id);

        self.buckets[index].push(contact)
    }

    /// Mark the bucket covering `id` as refreshed now.
    pub fn touch_bucket(&mut self, id: &Id) {
        let index = self.bucket_index_of(id);

        self.buckets[index].touch();
    }

    pub(crate) fn from_buckets(our_id: Id, buckets: Vec<KBucket>, k: usize, b: usize) -> Self {
        BucketList {
            our_id,
            buckets,
            k,
            b,
        }
    }

    // === Private Methods ===

    /// A full bucket may split when its range covers our own id, or when its
    /// depth is not a multiple of the branching factor.
    fn can_split(&self, index: usize) -> bool {
        let bucket = &self.buckets[index];

        bucket.has_in_range(&self.our_id) || bucket.depth() % self.b != 0
    }

    fn split(&mut self, index: usize) {
        let bucket = self.buckets.remove(index);

        trace!(range = ?bucket.range(), "Splitting bucket");

        let (left, right) = bucket.split();

        // Children take the parent's slot, keeping the list ordered by range.
        self.buckets.insert(index, right);
        self.buckets.insert(index, left);
    }
}

impl Debug for BucketList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "BucketList(our id {}) {{", self.our_id)?;
        for bucket in &self.buckets {
            writeln!(f, "  {bucket:?}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use std::convert::TryInto;
    use std::sync::Arc;

    use super::*;
    use crate::testnet::VirtualProtocol;

    fn contact(id: Id) -> Contact {
        Contact::new(id, Arc::new(VirtualProtocol::new(id)))
    }

    fn id_from(bytes: [u8; 20]) -> Id {
        Id::from_bytes(bytes).unwrap()
    }

    #[test]
    fn should_not_add_self() {
        let id = Id::random();
        let mut table = BucketList::new(id);

        assert!(matches!(
            table.add_contact(contact(id)),
            Err(Error::SelfContact)
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn replaces_known_contact_in_place() {
        let mut table = BucketList::new(Id::random());
        let contact = contact(Id::random());

        assert!(matches!(
            table.add_contact(contact.clone()),
            Ok(Admission::Added)
        ));
        assert!(matches!(
            table.add_contact(contact.clone()),
            Ok(Admission::Replaced)
        ));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn k_contacts_never_split() {
        let mut table = BucketList::new(Id::random());

        for i in 0..DEFAULT_K {
            let mut bytes = [0_u8; 20];
            bytes[19] = i as u8;
            table.add_contact(contact(id_from(bytes))).unwrap();
        }

        assert_eq!(table.buckets().len(), 1);
        assert_eq!(table.size(), DEFAULT_K);
    }

    #[test]
    fn splits_preserve_coverage_and_disjointness() {
        let our_id: Id = "0000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let mut table = BucketList::new(our_id);

        for _ in 0..500 {
            let _ = table.add_contact(contact(Id::random()));
        }

        assert!(table.buckets().len() > 1);

        // Every id is covered by exactly one bucket.
        for _ in 0..500 {
            let id = Id::random();
            let covering = table
                .buckets()
                .iter()
                .filter(|bucket| bucket.has_in_range(&id))
                .count();

            assert_eq!(covering, 1);
        }

        // Adjacent ranges tile the space: each bucket's exclusive upper
        // bound is the next bucket's lower bound, starting at zero and
        // ending at 2^160.
        let zero = id_from([0_u8; 20]);
        assert_eq!(table.buckets()[0].range().low(), zero);

        for pair in table.buckets().windows(2) {
            assert_eq!(
                pair[0].range().high_exclusive(),
                Some(pair[1].range().low())
            );
        }

        let last = table.buckets().last().unwrap();
        assert_eq!(last.range().high_exclusive(), None);
    }

    #[test]
    fn split_bucket_keeps_all_contacts() {
        let our_id = id_from([0_u8; 20]);
        let mut table = BucketList::new(our_id);

        for i in 0..DEFAULT_K {
            let mut bytes = [0_u8; 20];
            bytes[0] = if i % 2 == 0 { 0x01 } else { 0xf0 };
            bytes[19] = i as u8;
            table.add_contact(contact(id_from(bytes))).unwrap();
        }

        // The 21st contact forces a split of the full-range bucket.
        let mut bytes = [0_u8; 20];
        bytes[0] = 0x42;
        table.add_contact(contact(id_from(bytes))).unwrap();

        assert!(table.buckets().len() >= 2);
        assert_eq!(table.size(), DEFAULT_K + 1);
    }

    #[test]
    fn full_unsplittable_bucket_reports_least_recent() {
        // Our id has msb 0, all contacts have msb 1 and share exactly five
        // leading bits, so after the first split the right bucket excludes
        // our id and has depth 5, a multiple of B: no further splits.
        let our_id = id_from([0_u8; 20]);
        let mut table = BucketList::new(our_id);

        let mut first_added = None;

        for i in 0..DEFAULT_K {
            let mut bytes = [0_u8; 20];
            bytes[0] = 0b1000_1000 | (i as u8 % 8);
            bytes[19] = i as u8;
            let c = contact(id_from(bytes));

            first_added.get_or_insert_with(|| c.clone());
            table.add_contact(c).unwrap();
        }

        let mut bytes = [0_u8; 20];
        bytes[0] = 0b1000_1111;
        bytes[19] = 0xff;

        match table.add_contact(contact(id_from(bytes))).unwrap() {
            Admission::Full { least_recent } => {
                assert_eq!(Some(least_recent), first_added);
            }
            other => panic!("expected a full bucket, got {other:?}"),
        }

        assert_eq!(table.size(), DEFAULT_K);
    }

    #[test]
    fn evicting_unknown_contact_is_an_error() {
        let mut table = BucketList::new(Id::random());

        assert!(matches!(
            table.evict(&Id::random()),
            Err(Error::ContactNotFound(_))
        ));
    }

    #[test]
    fn closest_matches_brute_force() {
        let our_id = Id::random();
        let mut table = BucketList::new(our_id);

        let mut all = Vec::new();
        for _ in 0..100 {
            let c = contact(Id::random());
            if matches!(table.add_contact(c.clone()), Ok(Admission::Added)) {
                all.push(c);
            }
        }

        let target = Id::random();
        let closest = table.closest(&target, DEFAULT_K);

        all.sort_by_key(|contact| contact.id.xor(&target));
        all.truncate(DEFAULT_K);

        assert_eq!(
            closest.iter().map(|c| c.id).collect::<Vec<_>>(),
            all.iter().map(|c| c.id).collect::<Vec<_>>()
        );
    }
}
