//! Lock-free read view of an account store.
//!
//! Used when another process holds the writer lock. The view is a snapshot
//! of the log, index and slot bindings as of [`AccountReader::open`];
//! counters are read live through [`CountersReader`].

use crate::counters::{CountersReader, SlotKeys};
use crate::error::{Result, StoreError};
use crate::generation::{self, generation_dir_name, COUNTERS_FILE, INDEX_FILE, KEYS_FILE, LOG_FILE};
use crate::records::{EnvelopeLog, IndexEntry, SlotIndex};
use crate::store::{account_dir, store_exists, verify_manifest};
use crate::types::{AccountId, CountersSlot, Envelope, IndexKey, SlotId};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

/// Attempts to open a generation that a concurrent compaction keeps retiring.
const OPEN_ATTEMPTS: usize = 3;

/// Read-only snapshot of one account store.
pub struct AccountReader {
    account: AccountId,
    generation: u64,
    log: EnvelopeLog,
    entries: BTreeMap<IndexKey, IndexEntry>,
    bindings: BTreeMap<IndexKey, SlotId>,
    counters: CountersReader,
}

impl AccountReader {
    /// Open a read view of `account` under `root` without taking any lock.
    pub fn open(root: &Path, account: &AccountId) -> Result<Self> {
        if !store_exists(root, account) {
            return Err(StoreError::UnknownAccount(account.clone()));
        }
        let dir = account_dir(root, account);
        verify_manifest(&dir, account)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let number = generation::read_current(&dir)?
                .ok_or_else(|| StoreError::InvalidFormat(format!("{} has no CURRENT", dir.display())))?;
            match Self::open_generation(account, &dir, number) {
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound && attempt < OPEN_ATTEMPTS => {
                    tracing::debug!(account = %account, generation = number, "generation retired while opening, retrying");
                }
                result => return result,
            }
        }
    }

    fn open_generation(account: &AccountId, dir: &Path, number: u64) -> Result<Self> {
        let gen_dir = dir.join(generation_dir_name(number));
        let log = EnvelopeLog::open_read_only(gen_dir.join(LOG_FILE))?;
        let counters = CountersReader::open(gen_dir.join(COUNTERS_FILE))?;
        let bindings = SlotKeys::read_bindings(gen_dir.join(KEYS_FILE))?;
        let entries = SlotIndex::read_entries(gen_dir.join(INDEX_FILE), &log)?;

        tracing::debug!(
            account = %account,
            generation = number,
            keys = entries.len(),
            slots = bindings.len(),
            "read view opened"
        );
        Ok(Self {
            account: account.clone(),
            generation: number,
            log,
            entries,
            bindings,
            counters,
        })
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Generation the view was taken from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Keys in the view, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current envelope for `key`; `None` if absent or deleted.
    pub fn read_record(&self, key: &IndexKey) -> Result<Option<Envelope>> {
        match self.entries.get(key) {
            Some(entry) if !entry.deleted => Ok(Some(self.log.read_at(entry.log_offset)?)),
            _ => Ok(None),
        }
    }

    /// Counters of `key`; `None` until anything has been counted for it.
    pub fn read_counters(&self, key: &IndexKey) -> Result<Option<CountersSlot>> {
        let slot = self
            .bindings
            .get(key)
            .copied()
            .or_else(|| self.entries.get(key).and_then(|entry| entry.counters_slot));
        let Some(slot) = slot else {
            return Ok(None);
        };
        match self.counters.read_stable(slot) {
            Ok(counters) => Ok(Some(counters)),
            // Bound, but the writer has not written the slot yet
            Err(StoreError::SlotOutOfRange(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
