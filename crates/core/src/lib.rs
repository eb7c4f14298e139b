//! Core types and traits for OrionDB
//!
//! This crate defines the foundational types used throughout the system:
//! - Oid / Cid: object and class identifiers with reserved ranges
//! - ObjectPtr: physical location of an object's first on-page segment
//! - TxnId / LogPosition: redo-log identifiers
//! - LockKey: typed key space for the lock scheduler
//! - Error: error type hierarchy
//! - Config: typed configuration with compile-time backend selection
//! - Traits: the two external collaborator seams (BlockVolume, RedoLog)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{Config, DetectorKind, LogKind, VolumeKind};
pub use error::{Error, Result};
pub use traits::{AppendOutcome, BlockVolume, RedoLog, RedoRecord};
pub use types::{Cid, LockKey, LogPosition, ObjectPtr, Oid, TxnId};
