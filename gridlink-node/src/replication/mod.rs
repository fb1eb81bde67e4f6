/// Replication module - peer-to-peer state convergence
///
/// Design:
/// - Every mutation is recorded in a per-store modification log tagged with
///   origin identifier and timestamp; deletions stay as tombstones
/// - Each peer drains the log through its own iterator; a reconnecting
///   peer bootstraps via `dirty_entries` or a checksummed snapshot
/// - Receivers reconcile with last-writer-wins, identifier as tie-break,
///   so arrival order across peers never matters
pub mod engine;
pub mod log;
pub mod types;

pub use engine::ReplicatedMap;
pub use log::{ModificationIterator, ModificationLog};
pub use types::{
    ModificationEntry, PeerId, ReplicationError, ReplicationMessage, ReplicationResult,
    ReplicationStats,
};
