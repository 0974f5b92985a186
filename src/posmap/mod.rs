//! Durable position maps: the cluster map translating logical record
//! positions to physical page placements, and the version map tracking
//! per-key-bucket modification counters.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod version;

pub use cluster::{Bucket, ClusterPositionMap, RecordPlacement, SlotStatus};
pub use version::{key_hash, VersionPositionMap};
