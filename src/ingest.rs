//! Ingest pipeline: validate, dedup, append, index, derive dispersion.

use crate::dispersion::{derive_ops, DispersionOp};
use crate::error::{Result, StoreError};
use crate::generation::Generation;
use crate::journal::MAX_FRAME_LEN;
use crate::records::codec::{effective_hash, encoded_size};
use crate::records::IndexEntry;
use crate::types::{AccountId, Envelope, NormalizedRecord, RecordBody, RecordUri};
use serde::Serialize;

/// Per-batch ingest totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// New envelopes appended.
    pub accepted: u64,
    /// Records already current, or older than current.
    pub deduplicated: u64,
    /// Records rejected by validation or too large to store.
    pub failed: u64,
    /// Dispersion ops applied to their target store.
    pub dispersed: u64,
    /// Dispersion ops parked in the pending queue.
    pub queued: u64,
}

/// Check that `record` may be stored in `account`'s store.
pub fn validate(account: &AccountId, record: &NormalizedRecord) -> Result<()> {
    if &record.owner != account {
        return Err(StoreError::InvalidRecord(format!(
            "record owned by {} offered to {}",
            record.owner, account
        )));
    }
    if record.key.collection.is_empty() || record.key.rkey.is_empty() {
        return Err(StoreError::InvalidRecord(format!(
            "empty collection or record key in {}",
            record.key
        )));
    }
    if record.key.rkey.contains('/') {
        return Err(StoreError::InvalidRecord(format!(
            "record key {:?} contains '/'",
            record.key.rkey
        )));
    }

    match &record.body {
        RecordBody::Like(subject) | RecordBody::Repost(subject) => {
            RecordUri::parse(&subject.subject)?;
        }
        RecordBody::Post(post) => {
            if let Some(parent) = &post.reply_parent {
                RecordUri::parse(parent)?;
            }
        }
        RecordBody::Follow(follow) | RecordBody::Block(follow) => {
            if follow.subject.as_str().is_empty() {
                return Err(StoreError::InvalidRecord(format!(
                    "{} has an empty subject account",
                    record.key
                )));
            }
        }
        RecordBody::Label(_) | RecordBody::Tombstone | RecordBody::Unknown => {}
    }

    let size = encoded_size(record)?;
    if size > MAX_FRAME_LEN {
        return Err(StoreError::InvalidRecord(format!(
            "{} encodes to {} bytes, limit is {}",
            record.key, size, MAX_FRAME_LEN
        )));
    }
    Ok(())
}

/// Whether a per-record failure must abort the whole batch.
fn is_fatal(error: &StoreError) -> bool {
    matches!(error, StoreError::Io(_))
}

/// Local effects of a batch, before dispersion is routed.
pub(crate) struct BatchOutcome {
    pub report: IngestReport,
    pub ops: Vec<DispersionOp>,
}

/// Apply `records` to `generation`. Caller holds the writer lock.
///
/// Ops are derived for accepted records and for records that are already
/// current, so an op lost to a crash after the append is re-derived on the
/// next replay. The target's applied-op journal absorbs the repeats.
pub(crate) fn apply_batch(
    generation: &Generation,
    account: &AccountId,
    records: Vec<NormalizedRecord>,
) -> Result<BatchOutcome> {
    let mut report = IngestReport::default();
    let mut ops = Vec::new();

    for record in records {
        if let Err(e) = validate(account, &record) {
            tracing::warn!(account = %account, key = %record.key, error = %e, "record rejected");
            report.failed += 1;
            continue;
        }

        let envelope = Envelope::from(record);
        let content_hash = match effective_hash(&envelope) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(account = %account, key = %envelope.key, error = %e, "record not hashable");
                report.failed += 1;
                continue;
            }
        };

        if let Some(current) = generation.index.lookup(&envelope.key) {
            if envelope.source_timestamp < current.source_timestamp {
                tracing::debug!(
                    account = %account,
                    key = %envelope.key,
                    incoming = envelope.source_timestamp.0,
                    current = current.source_timestamp.0,
                    "stale record skipped"
                );
                report.deduplicated += 1;
                continue;
            }
            if current.content_hash == content_hash {
                tracing::debug!(account = %account, key = %envelope.key, "record already current");
                report.deduplicated += 1;
                ops.extend(derive_ops(&envelope));
                continue;
            }
        }

        let (offset, end) = match generation.log.append(&envelope) {
            Ok(position) => position,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(account = %account, key = %envelope.key, error = %e, "record not appended");
                report.failed += 1;
                continue;
            }
        };
        generation.index.upsert(IndexEntry {
            key: envelope.key.clone(),
            content_hash,
            source_timestamp: envelope.source_timestamp,
            log_offset: offset,
            log_end: end,
            deleted: envelope.deleted,
            counters_slot: generation.counters.slot_for(&envelope.key),
        })?;
        tracing::debug!(
            account = %account,
            key = %envelope.key,
            offset,
            deleted = envelope.deleted,
            "record appended"
        );

        report.accepted += 1;
        ops.extend(derive_ops(&envelope));
    }

    Ok(BatchOutcome { report, ops })
}
