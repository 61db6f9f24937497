//! Open-time integrity scan and index rebuild.

use crate::counters::{CountersSidecar, SidecarRecovery};
use crate::error::Result;
use crate::events::{EventBus, StoreEvent};
use crate::generation::{generation_dir_name, Generation, COUNTERS_FILE, INDEX_FILE, KEYS_FILE, LOG_FILE};
use crate::journal::JournalRecovery;
use crate::records::{EnvelopeLog, IndexLoad, SlotIndex};
use crate::types::AccountId;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// How the index was brought up to date on open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexRecovery {
    /// Journal loaded; `caught_up` log envelopes were replayed into it.
    Loaded { caught_up: u64 },
    /// Journal discarded and rebuilt from the log.
    Rebuilt { reason: String },
}

/// What the open-time scan found and fixed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryReport {
    pub generation: u64,
    pub log: JournalRecovery,
    pub index: IndexRecovery,
    pub counters: SidecarRecovery,
    /// Slot associations restored from the slot-key journal.
    pub slots_reattached: u64,
}

/// Open generation `number` of `account`, repairing whatever a crash left.
///
/// A torn log tail is truncated. An index that is missing, from another
/// version or corrupt is rebuilt from the log; a merely short one is caught
/// up. Version mismatches in the log or counters file are returned as errors.
pub(crate) fn open_generation(
    account: &AccountId,
    account_dir: &Path,
    number: u64,
    sync_interval: u64,
    events: &EventBus,
) -> Result<(Generation, RecoveryReport)> {
    let dir = account_dir.join(generation_dir_name(number));

    let (log, log_recovery) = EnvelopeLog::open(dir.join(LOG_FILE), sync_interval)?;
    if let Some(offset) = log_recovery.truncated_from {
        events.publish(StoreEvent::LogTruncated {
            account: account.clone(),
            file: LOG_FILE.to_string(),
            offset,
            removed: log_recovery.truncated_bytes,
        });
    }

    let (counters, counters_recovery) =
        CountersSidecar::open(dir.join(COUNTERS_FILE), dir.join(KEYS_FILE), sync_interval)?;
    let bindings = counters.bindings();

    let (index, index_recovery) =
        match SlotIndex::open(dir.join(INDEX_FILE), log.size(), sync_interval)? {
            IndexLoad::Loaded(index) => {
                let caught_up = index.catch_up(&log, &bindings)?;
                if caught_up > 0 {
                    tracing::info!(account = %account, caught_up, "index caught up with log tail");
                }
                (index, IndexRecovery::Loaded { caught_up })
            }
            IndexLoad::NeedsRebuild(reason) => {
                tracing::warn!(account = %account, reason = %reason, "rebuilding index from log");
                let index = SlotIndex::rebuild(dir.join(INDEX_FILE), &log, &bindings, sync_interval)?;
                tracing::info!(account = %account, entries = index.len(), "index rebuilt");
                events.publish(StoreEvent::IndexRebuilt {
                    account: account.clone(),
                    reason: reason.clone(),
                    entries: index.len(),
                });
                (index, IndexRecovery::Rebuilt { reason })
            }
        };

    // The index journal may have lost attachments the slot-key journal kept
    let mut slots_reattached = 0;
    for (key, slot) in &bindings {
        if index.attach_slot(key, *slot)? {
            slots_reattached += 1;
        }
    }

    let report = RecoveryReport {
        generation: number,
        log: log_recovery,
        index: index_recovery,
        counters: counters_recovery,
        slots_reattached,
    };
    Ok((Generation::new(number, dir, log, index, counters), report))
}

/// Consistency summary of a generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub generation: u64,
    pub envelopes: u64,
    pub live_keys: u64,
    pub tombstoned_keys: u64,
    pub slots: u64,
    pub log_bytes: u64,
    /// The journaled index equals a fresh rebuild from the log.
    pub index_consistent: bool,
}

/// Compare the live index with a rebuild from the log.
///
/// Caller holds the writer lock.
pub(crate) fn verify(generation: &Generation, sync_interval: u64) -> Result<IntegrityReport> {
    let mut envelopes = 0;
    for logged in generation.log.envelopes(generation.log.start())? {
        logged?;
        envelopes += 1;
    }

    let scratch = generation.dir.join("verify.jnl");
    let rebuilt = SlotIndex::rebuild(
        &scratch,
        &generation.log,
        &generation.counters.bindings(),
        sync_interval,
    )?;
    let index_consistent = rebuilt.encode_dense()? == generation.index.encode_dense()?;
    drop(rebuilt);
    fs::remove_file(&scratch)?;

    let entries = generation.index.entries();
    let tombstoned = entries.iter().filter(|e| e.deleted).count() as u64;
    Ok(IntegrityReport {
        generation: generation.number,
        envelopes,
        live_keys: entries.len() as u64 - tombstoned,
        tombstoned_keys: tombstoned,
        slots: generation.counters.len(),
        log_bytes: generation.log.size(),
        index_consistent,
    })
}
