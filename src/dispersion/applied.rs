//! Journal of dispersion ops already applied to a store.

use crate::error::{Result, StoreError};
use crate::journal::{Journal, JournalKind, HEADER_SIZE};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;

/// Applied-op journal file identity.
pub const APPLIED_KIND: JournalKind = JournalKind {
    name: "applied-op journal",
    magic: *b"APJ\0",
    version: 1,
};

/// Idempotency keys of ops applied to this store's counters.
///
/// A key is journaled before its increment: a crash in between loses the
/// increment (healed by an authoritative resync) but never applies it twice.
pub struct AppliedOps {
    journal: Journal,
    keys: RwLock<HashSet<String>>,
}

impl AppliedOps {
    pub fn open_or_create(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self {
                journal: Journal::create(path, APPLIED_KIND, sync_interval)?,
                keys: RwLock::new(HashSet::new()),
            });
        }

        let (journal, _) = Journal::open(path, APPLIED_KIND, sync_interval)?;
        let mut keys = HashSet::new();
        for frame in journal.iter_from(HEADER_SIZE)? {
            let (_, payload) = frame?;
            keys.insert(hex::encode(payload));
        }
        Ok(Self {
            journal,
            keys: RwLock::new(keys),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.read().contains(key)
    }

    /// Journal `key`. Returns false if it was already present.
    pub fn record(&self, key: &str) -> Result<bool> {
        let mut keys = self.keys.write();
        if keys.contains(key) {
            return Ok(false);
        }
        let raw = hex::decode(key).map_err(|e| {
            StoreError::InvalidRecord(format!("idempotency key {}: {}", key, e))
        })?;
        self.journal.append(&raw)?;
        // Durable before the increment it guards
        self.journal.sync()?;
        keys.insert(key.to_string());
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn journal_len(&self) -> u64 {
        self.journal.len()
    }
}
