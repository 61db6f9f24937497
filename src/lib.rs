//! # Engagement Ledger
//!
//! A per-account record store for a social client: an append-only log of
//! repository records, a rebuildable index over it, and a sidecar of
//! in-place engagement counters fed by likes, reposts, replies and quotes
//! from other accounts.
//!
//! ## Core Concepts
//!
//! - **Envelopes**: Immutable, checksummed log entries, one per record version
//! - **Slot index**: Key to current envelope, journaled and rebuildable from the log
//! - **Counters**: Fixed 56-byte slots updated in place, never torn
//! - **Dispersion**: Counter increments routed to the store that owns the subject
//! - **Generations**: Compaction publishes a new file set atomically
//!
//! ## Example
//!
//! ```ignore
//! use engagement_ledger::{AccountId, AccountRegistry, IndexKey, StoreConfig};
//!
//! let registry = AccountRegistry::new(StoreConfig::at("./engagement"))?;
//! let alice = AccountId::new("did:plc:alice");
//!
//! // Ingest decoded repository records
//! let report = registry.ingest(&alice, records)?;
//!
//! // Read aggregate counts for a post
//! let counts = registry.read_counters(&alice, &IndexKey::new("app.bsky.feed.post", "3k2a"))?;
//!
//! // Drop superseded versions
//! registry.compact(&alice, None)?;
//! ```

pub mod collab;
pub mod compaction;
pub mod counters;
pub mod dispersion;
pub mod error;
pub mod events;
pub mod generation;
pub mod ingest;
pub mod journal;
pub mod reader;
pub mod records;
pub mod recovery;
pub mod registry;
pub mod store;
pub mod types;

// Re-exports
pub use collab::{EngagementSnapshot, EngagementSource, SnapshotDecoder};
pub use compaction::CompactionReport;
pub use counters::{CountersReader, CountersSidecar};
pub use dispersion::{
    derive_ops, DispersionOp, OpKind, PendingEntry, Resolution, RetryPass, RetryPolicy,
    TargetResolver, Unresolved,
};
pub use error::{Result, StoreError};
pub use events::{DropReason, EventBus, EventFilter, StoreEvent, SubscriptionHandle, SubscriptionId};
pub use ingest::{validate, IngestReport};
pub use reader::AccountReader;
pub use records::{EnvelopeLog, IndexEntry, SlotIndex};
pub use recovery::{IndexRecovery, IntegrityReport, RecoveryReport};
pub use registry::{AccountRegistry, RetrySummary};
pub use store::{account_dir, store_exists, AccountStore, ResyncOutcome, StoreConfig, StoreStats, WriterGuard};
pub use types::*;
