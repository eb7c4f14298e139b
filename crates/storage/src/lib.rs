//! Paged object storage for OrionDB
//!
//! This crate owns everything that touches pages:
//! - The bit-exact on-page object format (header + segment records,
//!   big-endian, packed behind a 2-byte free-length prefix)
//! - Two [`BlockVolume`](orion_core::BlockVolume) implementations:
//!   `MemoryVolume` for tests and caches, `FileVolume` for durable
//!   single-file storage with a free-page list
//! - The OID table: lazily-grown chain of pages mapping an OID to its
//!   (object pointer, class id) entry
//! - [`ObjectStore`]: store/load/free of serialized object images with
//!   transparent multi-page overflow chaining

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod oid_table;
pub mod page;
pub mod store;
pub mod volume;

pub use oid_table::{OidEntry, OidTable};
pub use page::{ObjectHeader, FREE_FILL, FREE_LEN_SIZE, OBJECT_HEADER_SIZE};
pub use store::ObjectStore;
pub use volume::{FileVolume, MemoryVolume};
