//! Lock scheduling for OrionDB
//!
//! This crate implements two-phase locking over typed keys:
//! - Three lock modes (READ < UPGRADE < WRITE) with the classic
//!   shared / upgrade / exclusive compatibility matrix
//! - Strict FIFO fairness among waiters on a key
//! - Two interchangeable deadlock detectors: exact waits-for-graph
//!   search and conservative timestamp ordering
//! - An arena of lock records addressed by index, so one record can
//!   sit on a key's granted list, a key's wait queue, and its owning
//!   transaction's lock list without shared mutable aliasing
//!
//! The scheduler knows nothing about storage; any [`orion_core::LockKey`]
//! can be locked.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod deadlock;
pub mod scheduler;
pub mod stats;

pub use scheduler::{compatible, LockMode, LockScheduler, TxnHandle, WaitPolicy};
pub use stats::LockStats;
