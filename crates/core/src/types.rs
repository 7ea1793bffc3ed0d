//! Identifier types for spaces, partitions, and log records.

/// Logical namespace. Every key in the store is scoped to one space.
pub type SpaceId = u32;

/// Shard of a space; the unit of logging and placement.
pub type PartitionId = u32;

/// Position of a record in a partition's log. The first record ever
/// appended has id 1; [`NO_LOG`] (0) means "no log exists".
pub type LogId = u64;

/// Leadership epoch tag. Non-decreasing along any one partition's log.
pub type TermId = u64;

/// Opaque 64-bit tag attached to every log record. The log treats it as
/// bytes; upper layers use it for cross-cluster replication.
pub type ClusterId = i64;

/// Reserved log id meaning "no log".
pub const NO_LOG: LogId = 0;
