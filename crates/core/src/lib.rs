//! Core types shared across the Basalt storage stack.
//!
//! This crate carries the identifiers, the closed error taxonomy, the
//! partition key-prefix encoding, and the process-wide memory watermark
//! flag. It has no I/O and no OS dependencies; everything heavier lives in
//! the crates that build on it.

pub mod error;
pub mod key;
pub mod types;
pub mod watermark;

pub use error::{Error, Result};
pub use types::{ClusterId, LogId, PartitionId, SpaceId, TermId, NO_LOG};
