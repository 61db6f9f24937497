//! Log compaction into a fresh generation.

use crate::counters::CountersSidecar;
use crate::error::{Result, StoreError};
use crate::generation::{generation_dir_name, Generation, COUNTERS_FILE, INDEX_FILE, KEYS_FILE, LOG_FILE};
use crate::journal::sync_parent;
use crate::records::{EnvelopeLog, SlotIndex};
use crate::types::{IndexKey, SlotId, Timestamp};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Result of one compaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Generation that became current.
    pub generation: u64,
    /// Log bytes before and after.
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Tombstoned keys removed after their retention window.
    pub keys_dropped: u64,
    /// Superseded or expired envelopes not carried over.
    pub envelopes_dropped: u64,
    /// Counters slots released with their keys.
    pub slots_dropped: u64,
}

fn check_abort(abort: Option<&AtomicBool>) -> Result<()> {
    match abort {
        Some(flag) if flag.load(Ordering::SeqCst) => Err(StoreError::Aborted),
        _ => Ok(()),
    }
}

/// Build generation `current.number + 1` holding only current state.
///
/// The new generation is fully written and synced but not yet published.
/// On error or abort its directory is removed and `current` is untouched.
pub(crate) fn build_next(
    current: &Generation,
    account_dir: &Path,
    tombstone_retention_ms: i64,
    sync_interval: u64,
    now: Timestamp,
    abort: Option<&AtomicBool>,
) -> Result<(Generation, CompactionReport)> {
    let number = current.number + 1;
    let dir = account_dir.join(generation_dir_name(number));
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }

    let result = write_generation(
        current,
        &dir,
        number,
        tombstone_retention_ms,
        sync_interval,
        now,
        abort,
    );
    if result.is_err() {
        if let Err(e) = fs::remove_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove partial generation");
        }
    }
    result
}

fn write_generation(
    current: &Generation,
    dir: &Path,
    number: u64,
    tombstone_retention_ms: i64,
    sync_interval: u64,
    now: Timestamp,
    abort: Option<&AtomicBool>,
) -> Result<(Generation, CompactionReport)> {
    fs::create_dir_all(dir)?;
    let mut report = CompactionReport {
        generation: number,
        bytes_before: current.log.size(),
        ..Default::default()
    };

    // Decide per key what survives
    let mut keep_offsets = HashSet::new();
    let mut dropped_keys: BTreeSet<IndexKey> = BTreeSet::new();
    for entry in current.index.entries() {
        let expired = entry.deleted
            && now.0.saturating_sub(entry.source_timestamp.0) >= tombstone_retention_ms;
        if expired {
            dropped_keys.insert(entry.key);
        } else {
            keep_offsets.insert(entry.log_offset);
        }
    }
    report.keys_dropped = dropped_keys.len() as u64;

    // Carry current envelopes over in their original log order
    let log = EnvelopeLog::create(dir.join(LOG_FILE), sync_interval)?;
    for (n, logged) in current.log.envelopes(current.log.start())?.enumerate() {
        if n % 1024 == 0 {
            check_abort(abort)?;
        }
        let logged = logged?;
        if keep_offsets.contains(&logged.offset) {
            log.append(&logged.envelope)?;
        } else {
            report.envelopes_dropped += 1;
        }
    }
    log.sync()?;

    // Surviving slots keep their relative order, renumbered densely
    let counters =
        CountersSidecar::create(dir.join(COUNTERS_FILE), dir.join(KEYS_FILE), sync_interval)?;
    for old in 0..current.counters.len() {
        let old = SlotId(old);
        let Some(key) = current.counters.key_of(old) else {
            continue;
        };
        if dropped_keys.contains(&key) {
            report.slots_dropped += 1;
            continue;
        }
        counters.allocate_with(&key, current.counters.read(old)?)?;
    }
    counters.sync()?;

    check_abort(abort)?;
    let index = SlotIndex::rebuild(dir.join(INDEX_FILE), &log, &counters.bindings(), sync_interval)?;
    sync_parent(&dir.join(LOG_FILE))?;

    report.bytes_after = log.size();
    Ok((
        Generation::new(number, dir.to_path_buf(), log, index, counters),
        report,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{IndexEntry, LoggedEnvelope};
    use crate::types::{AccountId, Counter, Envelope, PostBody, RecordBody};
    use tempfile::TempDir;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    fn write(generation: &Generation, rkey: &str, text: Option<&str>, ts: i64) {
        let envelope = Envelope {
            source_timestamp: Timestamp(ts),
            owner: AccountId::new("A"),
            key: IndexKey::new("feed.post", rkey),
            content_hash: None,
            deleted: text.is_none(),
            body: match text {
                Some(text) => RecordBody::Post(PostBody {
                    text: text.to_string(),
                    ..Default::default()
                }),
                None => RecordBody::Tombstone,
            },
        };
        let (offset, end) = generation.log.append(&envelope).unwrap();
        let slot = generation.counters.slot_for(&envelope.key);
        let entry = IndexEntry::from_logged(&LoggedEnvelope { offset, end, envelope }, slot).unwrap();
        generation.index.upsert(entry).unwrap();
    }

    #[test]
    fn test_compaction_keeps_current_state() {
        let dir = TempDir::new().unwrap();
        let current = Generation::create(dir.path(), 1, 100).unwrap();

        write(&current, "a", Some("v1"), 0);
        write(&current, "a", Some("v2"), 1);
        write(&current, "old", Some("x"), 0);
        write(&current, "old", None, 0);
        write(&current, "recent", Some("y"), 0);
        write(&current, "recent", None, 40 * DAY);

        let old_slot = current.counters.allocate_slot(&IndexKey::new("feed.post", "old")).unwrap();
        let a_slot = current.counters.allocate_slot(&IndexKey::new("feed.post", "a")).unwrap();
        current.counters.increment_at(a_slot, Counter::Like, 3, Timestamp(5)).unwrap();
        current.counters.increment_at(old_slot, Counter::Like, 1, Timestamp(5)).unwrap();

        let (next, report) =
            build_next(&current, dir.path(), 30 * DAY, 100, Timestamp(41 * DAY), None).unwrap();

        assert_eq!(report.generation, 2);
        assert_eq!(report.keys_dropped, 1);
        assert_eq!(report.slots_dropped, 1);
        assert_eq!(report.envelopes_dropped, 4);
        assert!(report.bytes_after < report.bytes_before);

        let a = next.index.lookup(&IndexKey::new("feed.post", "a")).unwrap();
        assert_eq!(
            next.log.read_at(a.log_offset).unwrap(),
            current
                .log
                .read_at(current.index.lookup(&a.key).unwrap().log_offset)
                .unwrap()
        );
        assert!(next.index.lookup(&IndexKey::new("feed.post", "old")).is_none());
        assert!(next.index.lookup(&IndexKey::new("feed.post", "recent")).unwrap().deleted);

        // Slot for "a" renumbered from 1 to 0, value preserved
        assert_eq!(a.counters_slot, Some(SlotId(0)));
        assert_eq!(next.counters.read(SlotId(0)).unwrap().like_count, 3);
    }

    #[test]
    fn test_abort_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let current = Generation::create(dir.path(), 1, 100).unwrap();
        write(&current, "a", Some("v1"), 0);

        let abort = AtomicBool::new(true);
        let result = build_next(&current, dir.path(), DAY, 100, Timestamp(0), Some(&abort));
        assert!(matches!(result, Err(StoreError::Aborted)));
        assert!(!dir.path().join(generation_dir_name(2)).exists());
        assert!(current.index.lookup(&IndexKey::new("feed.post", "a")).is_some());
    }
}
