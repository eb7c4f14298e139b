//! OID indirection table.
//!
//! Maps an OID to its (object pointer, class id) entry. The OID space
//! is divided into fixed-size pages of entries; table pages are
//! allocated lazily and linked into a singly-linked chain rooted at
//! the store header page. Entries are zero-initialized (null pointer)
//! until first written.
//!
//! # Table page layout (big-endian)
//!
//! ```text
//! offset 0: pointer to next OID-table page (8 bytes; 0 = end of chain)
//! then N entries of: object pointer (8 bytes) | CID (8 bytes)
//! ```
//!
//! The store header page additionally persists the next-OID watermark
//! so that identifier allocation survives restarts:
//!
//! ```text
//! magic "ORST" (4) | format version (4) | next OID (8) | table root page (8)
//! ```

use byteorder::{BigEndian, ByteOrder};
use orion_core::{BlockVolume, Error, ObjectPtr, Oid, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Magic bytes identifying the store header page: "ORST"
pub const STORE_MAGIC: [u8; 4] = *b"ORST";

/// Current store format version
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Logical page holding the store header. The first allocation on a
/// fresh volume, so always page 1.
pub const STORE_HEADER_PAGE: u64 = 1;

const STORE_HEADER_SIZE: usize = 4 + 4 + 8 + 8;

/// Size of the next-page pointer at the start of each table page.
const TABLE_NEXT_PTR_SIZE: usize = 8;

/// Encoded size of one table entry.
const ENTRY_SIZE: usize = 16;

/// One OID table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OidEntry {
    /// First segment of the object, or null if the OID has never been
    /// stored (or was freed).
    pub ptr: ObjectPtr,
    /// Class of the object; [`orion_core::Cid::NULL`] when unset.
    pub cid: orion_core::Cid,
}

impl OidEntry {
    /// The zero-initialized entry.
    pub const EMPTY: OidEntry = OidEntry {
        ptr: ObjectPtr::NULL,
        cid: orion_core::Cid::NULL,
    };
}

struct TableState {
    /// First table page in the chain.
    root_page: u64,
    /// Next OID to hand out.
    next_oid: u64,
}

/// The OID indirection table.
///
/// All mutations go through one mutex; reads walk the page chain
/// without it (chain links are only ever appended, never unlinked).
pub struct OidTable {
    volume: Arc<dyn BlockVolume>,
    state: Mutex<TableState>,
}

impl OidTable {
    /// Entries per table page for the volume's page size.
    fn entries_per_page(&self) -> u64 {
        ((self.volume.page_size() - TABLE_NEXT_PTR_SIZE) / ENTRY_SIZE) as u64
    }

    /// Initialize the table on a fresh volume: allocates the store
    /// header page and the first table page.
    pub fn format(volume: Arc<dyn BlockVolume>) -> Result<Self> {
        let header_page = volume.allocate_page()?;
        if header_page != STORE_HEADER_PAGE {
            return Err(Error::corrupt(format!(
                "store format on a non-fresh volume (got page {header_page})"
            )));
        }
        let root_page = volume.allocate_page()?;
        // allocate_page hands pages back zeroed: next pointer and all
        // entries already hold their initial state
        let table = OidTable {
            volume,
            state: Mutex::new(TableState {
                root_page,
                next_oid: Oid::FIRST_USER.as_u64(),
            }),
        };
        table.write_store_header(root_page, Oid::FIRST_USER.as_u64())?;
        debug!(target: "orion::store", root_page, "oid table formatted");
        Ok(table)
    }

    /// Open the table on an existing volume by reading the store
    /// header page.
    pub fn open(volume: Arc<dyn BlockVolume>) -> Result<Self> {
        let mut header = [0u8; STORE_HEADER_SIZE];
        volume.load_page(&mut header, STORE_HEADER_PAGE, 0)?;
        if header[0..4] != STORE_MAGIC {
            return Err(Error::corrupt("bad store header magic"));
        }
        let version = BigEndian::read_u32(&header[4..8]);
        if version != STORE_FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported store format version {version}"
            )));
        }
        let next_oid = BigEndian::read_u64(&header[8..16]);
        let root_page = BigEndian::read_u64(&header[16..24]);
        Ok(OidTable {
            volume,
            state: Mutex::new(TableState {
                root_page,
                next_oid,
            }),
        })
    }

    fn write_store_header(&self, root_page: u64, next_oid: u64) -> Result<()> {
        let mut header = [0u8; STORE_HEADER_SIZE];
        header[0..4].copy_from_slice(&STORE_MAGIC);
        BigEndian::write_u32(&mut header[4..8], STORE_FORMAT_VERSION);
        BigEndian::write_u64(&mut header[8..16], next_oid);
        BigEndian::write_u64(&mut header[16..24], root_page);
        self.volume.store_page(&header, STORE_HEADER_PAGE, 0)
    }

    /// Walk the chain to the table page holding `chain_index`, without
    /// allocating. Returns `None` if the chain ends first.
    fn find_page(&self, root_page: u64, chain_index: u64) -> Result<Option<u64>> {
        let mut page = root_page;
        for _ in 0..chain_index {
            let mut next_buf = [0u8; TABLE_NEXT_PTR_SIZE];
            self.volume.load_page(&mut next_buf, page, 0)?;
            let next = BigEndian::read_u64(&next_buf);
            if next == 0 {
                return Ok(None);
            }
            page = next;
        }
        Ok(Some(page))
    }

    /// Walk the chain to the table page holding `chain_index`,
    /// allocating and linking missing pages. Caller holds the state
    /// lock.
    fn find_or_grow_page(&self, root_page: u64, chain_index: u64) -> Result<u64> {
        let mut page = root_page;
        for _ in 0..chain_index {
            let mut next_buf = [0u8; TABLE_NEXT_PTR_SIZE];
            self.volume.load_page(&mut next_buf, page, 0)?;
            let mut next = BigEndian::read_u64(&next_buf);
            if next == 0 {
                next = self.volume.allocate_page()?;
                let mut link = [0u8; TABLE_NEXT_PTR_SIZE];
                BigEndian::write_u64(&mut link, next);
                self.volume.store_page(&link, page, 0)?;
                trace!(target: "orion::store", page = next, "oid table page allocated");
            }
            page = next;
        }
        Ok(page)
    }

    /// Read the entry for `oid`. An OID whose table page was never
    /// allocated reads as [`OidEntry::EMPTY`].
    pub fn get(&self, oid: Oid) -> Result<OidEntry> {
        if oid.is_null() {
            return Err(Error::ObjectNotFound(oid));
        }
        let epp = self.entries_per_page();
        let (chain_index, slot) = (oid.as_u64() / epp, oid.as_u64() % epp);
        let root_page = self.state.lock().root_page;
        let Some(page) = self.find_page(root_page, chain_index)? else {
            return Ok(OidEntry::EMPTY);
        };
        let mut buf = [0u8; ENTRY_SIZE];
        let offset = TABLE_NEXT_PTR_SIZE + slot as usize * ENTRY_SIZE;
        self.volume.load_page(&mut buf, page, offset)?;
        let raw_ptr = BigEndian::read_u64(&buf[0..8]);
        let raw_cid = BigEndian::read_u64(&buf[8..16]);
        Ok(OidEntry {
            ptr: ObjectPtr::from_raw(raw_ptr),
            cid: orion_core::Cid::new(raw_cid),
        })
    }

    /// Write the entry for `oid`, growing the chain as needed.
    pub fn set(&self, oid: Oid, entry: OidEntry) -> Result<()> {
        if oid.is_null() {
            return Err(Error::ObjectNotFound(oid));
        }
        let epp = self.entries_per_page();
        let (chain_index, slot) = (oid.as_u64() / epp, oid.as_u64() % epp);
        let state = self.state.lock();
        let page = self.find_or_grow_page(state.root_page, chain_index)?;
        drop(state);
        let mut buf = [0u8; ENTRY_SIZE];
        BigEndian::write_u64(&mut buf[0..8], entry.ptr.as_u64());
        BigEndian::write_u64(&mut buf[8..16], entry.cid.as_u64());
        let offset = TABLE_NEXT_PTR_SIZE + slot as usize * ENTRY_SIZE;
        self.volume.store_page(&buf, page, offset)
    }

    /// Allocate `count` fresh OIDs. Returns the first; the block is
    /// `first..first + count`, strictly increasing and never reused.
    pub fn new_block(&self, count: u64) -> Result<Oid> {
        let mut state = self.state.lock();
        let first = state.next_oid;
        if count == 0 {
            return Ok(Oid::new(first));
        }
        let last = first + count - 1;
        let epp = self.entries_per_page();
        self.find_or_grow_page(state.root_page, last / epp)?;
        state.next_oid = last + 1;
        self.write_store_header(state.root_page, state.next_oid)?;
        debug!(target: "orion::store", first, count, "oid block allocated");
        Ok(Oid::new(first))
    }

    /// Make sure `oid` has a table slot and is covered by the next-OID
    /// watermark. Idempotent: used during log replay, where the
    /// original allocation side effect may or may not have happened.
    pub fn ensure_allocated(&self, oid: Oid) -> Result<()> {
        if oid.is_null() {
            return Err(Error::ObjectNotFound(oid));
        }
        let mut state = self.state.lock();
        let epp = self.entries_per_page();
        self.find_or_grow_page(state.root_page, oid.as_u64() / epp)?;
        if oid.as_u64() >= state.next_oid {
            state.next_oid = oid.as_u64() + 1;
            self.write_store_header(state.root_page, state.next_oid)?;
        }
        Ok(())
    }

    /// Next OID the table would hand out (for diagnostics).
    pub fn next_oid(&self) -> u64 {
        self.state.lock().next_oid
    }
}
