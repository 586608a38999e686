//! Kademlia node Id or a lookup target
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};

use rand::Rng;

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target.
///
/// An unsigned 160-bit integer. The natural integer ordering is used only
/// for bucket range membership; closeness is always the XOR metric ([Id::xor]).
pub struct Id(pub(crate) [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Derive an Id from arbitrary content bytes.
    ///
    /// This is the opaque "ID-from-bytes" operation used to turn stored
    /// content into a key in the same 160-bit space nodes occupy.
    pub fn from_data<T: AsRef<[u8]>>(data: T) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(data.as_ref());

        Id(hasher.digest().bytes())
    }

    /// XOR distance between this Id and a target Id.
    pub fn xor(&self, other: &Id) -> Distance {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(result)
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        let byte = self.0[index / 8];

        byte & (0x80 >> (index % 8)) != 0
    }

    /// Number of leading bits this Id shares with `other`.
    pub fn shared_prefix_bits(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub(crate) fn with_bit_set(mut self, index: usize) -> Id {
        self.0[index / 8] |= 0x80 >> (index % 8);
        self
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl TryFrom<&str> for Id {
    type Error = Error;

    fn try_from(value: &str) -> Result<Id> {
        if value.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdEncoding(value.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(value.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// XOR distance between two [Id]s, interpreted as an unsigned 160-bit integer.
pub struct Distance(pub(crate) [u8; ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0; ID_SIZE]);

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:x?})", &self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
/// A half-open range `[low, high)` of the Id space covered by one k-bucket.
///
/// Every range the split algorithm can produce is a power-of-two aligned
/// half of its parent, so a range is stored as a bit prefix and its length.
/// The exclusive upper bound `low + 2^(160 - bits)` never needs to be
/// materialized, which keeps the top range's `2^160` bound representable.
pub struct BucketRange {
    prefix: Id,
    bits: usize,
}

impl BucketRange {
    /// The range covering the entire Id space `[0, 2^160)`.
    pub fn full() -> Self {
        BucketRange {
            prefix: Id([0; ID_SIZE]),
            bits: 0,
        }
    }

    pub(crate) fn from_prefix(prefix: Id, bits: usize) -> Self {
        BucketRange { prefix, bits }
    }

    // === Getters ===

    /// Inclusive lower bound of the range.
    pub fn low(&self) -> Id {
        self.prefix
    }

    /// Length of the shared bit prefix all Ids in this range have.
    pub fn bits(&self) -> usize {
        self.bits
    }

    // === Public Methods ===

    pub fn contains(&self, id: &Id) -> bool {
        id.shared_prefix_bits(&self.prefix) >= self.bits
    }

    /// The numeric midpoint of the range, `low + (high - low) / 2`.
    pub fn midpoint(&self) -> Id {
        self.prefix.with_bit_set(self.bits)
    }

    /// Split the range at its midpoint into two half-range children.
    pub fn split(&self) -> (BucketRange, BucketRange) {
        let left = BucketRange {
            prefix: self.prefix,
            bits: self.bits + 1,
        };
        let right = BucketRange {
            prefix: self.midpoint(),
            bits: self.bits + 1,
        };

        (left, right)
    }

    /// A uniformly random Id inside this range, used for bucket refresh
    /// lookups.
    pub fn random_id(&self) -> Id {
        let mut id = Id::random();

        // Overwrite the prefix bits so the id falls inside the range.
        let whole_bytes = self.bits / 8;
        id.0[..whole_bytes].copy_from_slice(&self.prefix.0[..whole_bytes]);

        let rem = self.bits % 8;
        if rem > 0 {
            let mask = 0xff_u8 << (8 - rem);
            id.0[whole_bytes] = (self.prefix.0[whole_bytes] & mask) | (id.0[whole_bytes] & !mask);
        }

        id
    }

    /// Exclusive upper bound of the range, or `None` when the bound is
    /// `2^160` itself (the top of the space).
    pub fn high_exclusive(&self) -> Option<Id> {
        if self.bits == 0 {
            return None;
        }

        // low + 2^(160 - bits): add one at the last prefix bit, with carry.
        let mut bytes = *self.prefix.as_bytes();
        let bit = self.bits - 1;

        let mut byte_index = bit / 8;
        let mut addend = 0x80_u8 >> (bit % 8);

        loop {
            let (sum, overflow) = bytes[byte_index].overflowing_add(addend);
            bytes[byte_index] = sum;

            if !overflow {
                return Some(Id(bytes));
            }
            if byte_index == 0 {
                // Carried past the most significant bit: the bound is 2^160.
                return None;
            }

            byte_index -= 1;
            addend = 1;
        }
    }
}

impl Debug for BucketRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BucketRange({}/{})", self.prefix, self.bits)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn from_bytes_wrong_size() {
        assert!(matches!(
            Id::from_bytes([0_u8; 19]),
            Err(Error::InvalidIdSize(19))
        ));
        assert!(matches!(
            Id::from_bytes([0_u8; 21]),
            Err(Error::InvalidIdSize(21))
        ));
    }

    #[test]
    fn hex_roundtrip() {
        let id: Id = "aefb7fac689c1122107dfcde08f6fa2ec4cfec66"
            .try_into()
            .unwrap();

        assert_eq!(id.to_string(), "aefb7fac689c1122107dfcde08f6fa2ec4cfec66");
    }

    #[test]
    fn xor_is_symmetric() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&a), Distance::ZERO);
    }

    #[test]
    fn closeness_is_not_numeric_difference() {
        let a = Id::from_bytes([0b0111_1111_u8; 20]).unwrap();
        let b = Id::from_bytes([0b1000_0000_u8; 20]).unwrap();
        let c = Id::from_bytes([0b0000_0000_u8; 20]).unwrap();

        // b is numerically adjacent to a but xor-far from it.
        assert!(a.xor(&c) < a.xor(&b));
    }

    #[test]
    fn bits() {
        let id = Id::from_bytes({
            let mut bytes = [0_u8; 20];
            bytes[0] = 0b1010_0000;
            bytes
        })
        .unwrap();

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(2));
        assert!(!id.bit(159));
    }

    #[test]
    fn shared_prefix() {
        let a = Id::from_bytes([0_u8; 20]).unwrap();
        let b = Id::from_bytes({
            let mut bytes = [0_u8; 20];
            bytes[1] = 0b0001_0000;
            bytes
        })
        .unwrap();

        assert_eq!(a.shared_prefix_bits(&b), 11);
        assert_eq!(a.shared_prefix_bits(&a), ID_BITS);
    }

    #[test]
    fn range_split_covers_parent() {
        let full = BucketRange::full();
        let (left, right) = full.split();

        for _ in 0..100 {
            let id = Id::random();

            assert!(full.contains(&id));
            assert_ne!(left.contains(&id), right.contains(&id));

            if id < full.midpoint() {
                assert!(left.contains(&id));
            } else {
                assert!(right.contains(&id));
            }
        }
    }

    #[test]
    fn range_high_exclusive() {
        let full = BucketRange::full();
        assert_eq!(full.high_exclusive(), None);

        let (left, right) = full.split();
        assert_eq!(left.high_exclusive(), Some(right.low()));
        assert_eq!(right.high_exclusive(), None);

        let (right_left, right_right) = right.split();
        assert_eq!(right_left.high_exclusive(), Some(right_right.low()));
    }

    #[test]
    fn random_id_in_range() {
        let (_, right) = BucketRange::full().split();
        let (_, range) = right.split();

        for _ in 0..100 {
            assert!(range.contains(&range.random_id()));
        }
    }

    #[test]
    fn from_data_is_stable() {
        assert_eq!(Id::from_data(b"hello"), Id::from_data(b"hello"));
        assert_ne!(Id::from_data(b"hello"), Id::from_data(b"world"));
    }
}
