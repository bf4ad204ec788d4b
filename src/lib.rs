//! Namespace metadata engine for a distributed filesystem.
//!
//! Maintains a hierarchical namespace over a replicated key-value store
//! that is strongly consistent only within one entity group: entry base
//! records with sharded high-churn attributes, name reservations, a
//! two-sided directory slot index kept dense by background compaction,
//! sharded child counters, and a write-invalidated cache, composed behind
//! the [`store::EntryStore`] façade. Cross-group operations are
//! optimistic: lost races are detected by state checks and compensated by
//! idempotent deferred tasks, never prevented by locks.

pub mod cache;
pub mod counter;
pub mod deferred;
pub mod entry;
pub mod errors;
pub mod index;
pub mod keys;
pub mod kv;
pub mod name_holder;
pub mod permissions;
pub mod store;
pub mod types;

pub use errors::{MetaError, StoreError};
pub use store::EntryStore;

/// Tuning knobs, fixed at construction and threaded through every call.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shard records per entry for mtime/size/write-nonce writes.
    pub entry_shards: u32,
    /// Shard keys per child counter.
    pub counter_shards: u32,
    /// Children per listing page.
    pub page_size: usize,
    /// Busy-ladder budget for directory index insertion.
    pub insert_attempts: u32,
    /// Rows per range scan when walking index nodes.
    pub scan_limit: usize,
    /// Round budget for one compaction pass before it is re-enqueued.
    pub compaction_rounds: u32,
    /// CAS retry budget for single-entry transactions.
    pub txn_attempts: u32,
    /// Read cache capacity, in values.
    pub cache_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry_shards: 4,
            counter_shards: 8,
            page_size: 64,
            insert_attempts: 64,
            scan_limit: 128,
            compaction_rounds: 32,
            txn_attempts: 16,
            cache_capacity: 65_536,
        }
    }
}
