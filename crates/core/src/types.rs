//! Identifier types shared by every layer.
//!
//! All of these are thin newtypes over integers. They exist so the
//! storage, lock, and log layers cannot accidentally mix an object id
//! with a class id or a page offset with a log position.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Object identifier.
///
/// A stable 64-bit handle naming a persisted object. Monotonically
/// increasing; 0 is the null reference and ids below
/// [`Oid::FIRST_USER`] are reserved for system objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(u64);

impl Oid {
    /// The null reference. Never maps to a stored object.
    pub const NULL: Oid = Oid(0);

    /// First identifier handed out to user objects. Everything below
    /// (except 0) is reserved for system objects.
    pub const FIRST_USER: Oid = Oid(64);

    /// Construct from a raw value.
    pub const fn new(raw: u64) -> Self {
        Oid(raw)
    }

    /// Raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the null reference.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether this id lies in the reserved system range.
    pub const fn is_system(self) -> bool {
        self.0 != 0 && self.0 < Self::FIRST_USER.0
    }

    /// The next identifier in sequence.
    pub const fn next(self) -> Self {
        Oid(self.0 + 1)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

/// Class identifier, naming the stored object's type.
///
/// Ids below [`Cid::FIRST_USER`] denote built-in system classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid(u64);

impl Cid {
    /// Absent / unknown class.
    pub const NULL: Cid = Cid(0);

    /// First identifier available for user-defined classes.
    pub const FIRST_USER: Cid = Cid(64);

    /// Construct from a raw value.
    pub const fn new(raw: u64) -> Self {
        Cid(raw)
    }

    /// Raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this id lies in the reserved built-in range.
    pub const fn is_system(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:{}", self.0)
    }
}

/// Physical location of an on-page object segment.
///
/// Encoded as an absolute logical byte address on the volume:
/// `page_offset * page_size + byte_offset`. Volumes never hand out
/// page 0 (it is their own header), so address 0 doubles as the null
/// sentinel both in memory and in the on-page overflow pointer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPtr(u64);

impl ObjectPtr {
    /// Null pointer sentinel (also the on-page encoding of "no overflow").
    pub const NULL: ObjectPtr = ObjectPtr(0);

    /// Build a pointer from a logical page offset and a byte offset
    /// within that page.
    pub fn new(page: u64, offset: usize, page_size: usize) -> Self {
        debug_assert!(offset < page_size);
        ObjectPtr(page * page_size as u64 + offset as u64)
    }

    /// Construct from a raw absolute byte address.
    pub const fn from_raw(raw: u64) -> Self {
        ObjectPtr(raw)
    }

    /// Raw absolute byte address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Logical page offset this pointer falls in.
    pub fn page(self, page_size: usize) -> u64 {
        self.0 / page_size as u64
    }

    /// Byte offset within the page.
    pub fn offset(self, page_size: usize) -> usize {
        (self.0 % page_size as u64) as usize
    }

    /// Whether this is the null sentinel.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ptr:{:#x}", self.0)
    }
}

/// Redo-log transaction identifier, assigned by the log when a BEGIN
/// record is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(u64);

impl TxnId {
    /// Placeholder passed to the log in a BEGIN record; the log
    /// replaces it with a freshly assigned id.
    pub const UNASSIGNED: TxnId = TxnId(0);

    /// Construct from a raw value.
    pub const fn new(raw: u64) -> Self {
        TxnId(raw)
    }

    /// Raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Position of a record in the redo log.
///
/// Opaque to everything except the log implementation that produced
/// it. File-backed logs encode (segment, byte offset); the in-memory
/// log uses a plain index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition(u64);

impl LogPosition {
    /// Start of the log.
    pub const START: LogPosition = LogPosition(0);

    /// Construct from a raw value.
    pub const fn from_raw(raw: u64) -> Self {
        LogPosition(raw)
    }

    /// Raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log:{:#x}", self.0)
    }
}

/// Typed key space for the lock scheduler.
///
/// The scheduler never hashes arbitrary objects; every lockable
/// resource is named by one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// A single stored object.
    Object(Oid),
    /// The OID allocation table as a whole.
    OidTable,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Object(oid) => write!(f, "object({oid})"),
            LockKey::OidTable => write!(f, "oid-table"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_reserved_ranges() {
        assert!(Oid::NULL.is_null());
        assert!(!Oid::NULL.is_system());
        assert!(Oid::new(1).is_system());
        assert!(Oid::new(63).is_system());
        assert!(!Oid::FIRST_USER.is_system());
        assert_eq!(Oid::new(5).next(), Oid::new(6));
    }

    #[test]
    fn cid_reserved_ranges() {
        assert!(Cid::NULL.is_system());
        assert!(Cid::new(63).is_system());
        assert!(!Cid::FIRST_USER.is_system());
    }

    #[test]
    fn object_ptr_round_trips_page_and_offset() {
        let page_size = 4096;
        let ptr = ObjectPtr::new(7, 123, page_size);
        assert_eq!(ptr.page(page_size), 7);
        assert_eq!(ptr.offset(page_size), 123);
        assert!(!ptr.is_null());
        assert!(ObjectPtr::NULL.is_null());
    }

    #[test]
    fn lock_key_equality_is_structural() {
        assert_eq!(LockKey::Object(Oid::new(9)), LockKey::Object(Oid::new(9)));
        assert_ne!(LockKey::Object(Oid::new(9)), LockKey::Object(Oid::new(10)));
        assert_ne!(LockKey::Object(Oid::new(9)), LockKey::OidTable);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Oid::new(42).to_string(), "oid:42");
        assert_eq!(TxnId::new(3).to_string(), "txn:3");
        assert_eq!(LockKey::OidTable.to_string(), "oid-table");
    }

    proptest::proptest! {
        #[test]
        fn object_ptr_decomposition_round_trips(
            page in 1u64..1 << 40,
            offset in 0usize..4096,
        ) {
            let ptr = ObjectPtr::new(page, offset, 4096);
            proptest::prop_assert_eq!(ptr.page(4096), page);
            proptest::prop_assert_eq!(ptr.offset(4096), offset);
        }
    }
}
