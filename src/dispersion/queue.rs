//! Persistent queue of dispersion ops awaiting an unreachable target store.

use super::DispersionOp;
use crate::error::Result;
use crate::journal::{Journal, JournalKind, HEADER_SIZE};
use crate::types::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Pending queue file identity.
pub const QUEUE_KIND: JournalKind = JournalKind {
    name: "pending dispersion queue",
    magic: *b"PDQ\0",
    version: 1,
};

/// Exponential backoff and reporting bounds for queued ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: i64,
    pub max_ms: i64,
    /// Age after which a still-queued op is reported.
    pub warn_horizon_ms: i64,
}

impl RetryPolicy {
    /// Delay before retry number `attempts + 1`: `base * 2^attempts`, capped.
    pub fn backoff_ms(&self, attempts: u32) -> i64 {
        self.base_ms
            .max(1)
            .saturating_mul(2i64.saturating_pow(attempts))
            .min(self.max_ms.max(self.base_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60 * 60 * 1_000,
            warn_horizon_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

/// A queued op and its retry schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub op: DispersionOp,
    pub attempts: u32,
    pub first_queued: Timestamp,
    pub next_attempt: Timestamp,
}

impl PendingEntry {
    pub fn age_ms(&self, now: Timestamp) -> i64 {
        now.0.saturating_sub(self.first_queued.0)
    }
}

/// Outcome of one retry pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryPass {
    pub attempted: u64,
    pub delivered: u64,
    pub remaining: u64,
    /// Entries still queued past the warn horizon.
    pub stalled: Vec<PendingEntry>,
}

/// Ops owed to other stores, persisted in the source account's directory.
///
/// Pushes append to the queue journal; a retry pass rewrites it atomically
/// with whatever is still owed.
pub struct PendingQueue {
    path: PathBuf,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
}

struct QueueState {
    journal: Journal,
    entries: Vec<PendingEntry>,
    /// Idempotency keys of `entries`.
    keys: HashSet<String>,
}

impl QueueState {
    fn load(journal: Journal) -> Result<Self> {
        let mut entries = Vec::new();
        let mut keys = HashSet::new();
        for frame in journal.iter_from(HEADER_SIZE)? {
            let (_, payload) = frame?;
            let entry: PendingEntry = rmp_serde::from_slice(&payload)?;
            if keys.insert(entry.op.idempotency_key()) {
                entries.push(entry);
            }
        }
        Ok(Self { journal, entries, keys })
    }
}

impl PendingQueue {
    pub fn open_or_create(path: impl AsRef<Path>, policy: RetryPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let journal = if path.exists() {
            Journal::open(&path, QUEUE_KIND, u64::MAX)?.0
        } else {
            Journal::create(&path, QUEUE_KIND, u64::MAX)?
        };
        Ok(Self {
            path,
            policy,
            state: Mutex::new(QueueState::load(journal)?),
        })
    }

    /// Queue `op` for its first retry. An op already queued is left as is.
    pub fn push(&self, op: DispersionOp, now: Timestamp) -> Result<bool> {
        Ok(self.push_all(vec![op], now)? == 1)
    }

    /// Queue `ops` with one sync. Returns how many were not already queued.
    pub fn push_all(&self, ops: Vec<DispersionOp>, now: Timestamp) -> Result<u64> {
        let mut state = self.state.lock();
        let mut added = 0;
        for op in ops {
            if !state.keys.insert(op.idempotency_key()) {
                continue;
            }
            tracing::debug!(
                actor = %op.actor,
                target = %op.target(),
                kind = %op.kind,
                subject = %op.subject,
                "dispersion op queued"
            );
            let entry = PendingEntry {
                op,
                attempts: 0,
                first_queued: now,
                next_attempt: Timestamp(now.0.saturating_add(self.policy.backoff_ms(0))),
            };
            state.journal.append(&rmp_serde::to_vec(&entry)?)?;
            state.entries.push(entry);
            added += 1;
        }
        if added > 0 {
            state.journal.sync()?;
        }
        Ok(added)
    }

    /// Try every due entry with `deliver`, which returns whether the op reached
    /// its target. Undelivered entries are rescheduled with backoff.
    pub fn retry<F>(&self, now: Timestamp, mut deliver: F) -> Result<RetryPass>
    where
        F: FnMut(&DispersionOp) -> Result<bool>,
    {
        let mut state = self.state.lock();
        let mut pass = RetryPass::default();
        let mut kept = Vec::with_capacity(state.entries.len());
        let mut changed = false;

        for mut entry in state.entries.drain(..) {
            if entry.next_attempt > now {
                kept.push(entry);
                continue;
            }
            pass.attempted += 1;
            changed = true;

            let delivered = match deliver(&entry.op) {
                Ok(delivered) => delivered,
                Err(e) => {
                    tracing::debug!(target = %entry.op.target(), error = %e, "dispersion retry failed");
                    false
                }
            };
            if delivered {
                pass.delivered += 1;
                continue;
            }

            entry.attempts = entry.attempts.saturating_add(1);
            entry.next_attempt = Timestamp(now.0.saturating_add(self.policy.backoff_ms(entry.attempts)));
            kept.push(entry);
        }

        for entry in &kept {
            let age = entry.age_ms(now);
            if age > self.policy.warn_horizon_ms {
                tracing::warn!(
                    actor = %entry.op.actor,
                    target = %entry.op.target(),
                    kind = %entry.op.kind,
                    subject = %entry.op.subject,
                    attempts = entry.attempts,
                    age_ms = age,
                    "dispersion op unresolved past horizon"
                );
                pass.stalled.push(entry.clone());
            }
        }

        pass.remaining = kept.len() as u64;
        if pass.delivered > 0 {
            state.keys = kept.iter().map(|e| e.op.idempotency_key()).collect();
        }
        state.entries = kept;
        if changed {
            self.rewrite(&mut state)?;
        }
        Ok(pass)
    }

    fn rewrite(&self, state: &mut QueueState) -> Result<()> {
        let payloads = state
            .entries
            .iter()
            .map(rmp_serde::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Journal::write_atomic(&self.path, QUEUE_KIND, payloads.iter().map(Vec::as_slice))?;
        // The old handle points at the replaced file
        state.journal = Journal::open(&self.path, QUEUE_KIND, u64::MAX)?.0;
        Ok(())
    }

    pub fn entries(&self) -> Vec<PendingEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispersion::OpKind;
    use crate::error::StoreError;
    use crate::types::{AccountId, IndexKey, RecordUri};
    use tempfile::TempDir;

    fn op(rkey: &str) -> DispersionOp {
        DispersionOp {
            kind: OpKind::Like,
            actor: AccountId::new("C"),
            subject: RecordUri::parse("B/feed.post/r1").unwrap(),
            source_key: IndexKey::new("feed.like", rkey),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_ms: 100,
            max_ms: 1_000,
            warn_horizon_ms: 5_000,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_ms(0), 100);
        assert_eq!(policy.backoff_ms(3), 800);
        assert_eq!(policy.backoff_ms(4), 1_000);
        assert_eq!(policy.backoff_ms(200), 1_000);
    }

    #[test]
    fn test_push_persists_and_dedups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.q");
        {
            let queue = PendingQueue::open_or_create(&path, policy()).unwrap();
            assert!(queue.push(op("l1"), Timestamp(0)).unwrap());
            assert!(!queue.push(op("l1"), Timestamp(10)).unwrap());
            assert!(queue.push(op("l2"), Timestamp(10)).unwrap());
        }

        let queue = PendingQueue::open_or_create(&path, policy()).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.entries()[0].next_attempt, Timestamp(100));
    }

    #[test]
    fn test_retry_reschedules_and_delivers() {
        let dir = TempDir::new().unwrap();
        let queue = PendingQueue::open_or_create(dir.path().join("pending.q"), policy()).unwrap();
        queue.push(op("l1"), Timestamp(0)).unwrap();

        // Not yet due
        let pass = queue.retry(Timestamp(50), |_| Ok(true)).unwrap();
        assert_eq!(pass.attempted, 0);

        let pass = queue
            .retry(Timestamp(100), |o| Err(StoreError::Busy(o.target().clone())))
            .unwrap();
        assert_eq!((pass.attempted, pass.remaining), (1, 1));
        assert_eq!(queue.entries()[0].attempts, 1);
        assert_eq!(queue.entries()[0].next_attempt, Timestamp(300));

        let pass = queue.retry(Timestamp(300), |_| Ok(true)).unwrap();
        assert_eq!((pass.delivered, pass.remaining), (1, 0));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stalled_past_horizon() {
        let dir = TempDir::new().unwrap();
        let queue = PendingQueue::open_or_create(dir.path().join("pending.q"), policy()).unwrap();
        queue.push(op("l1"), Timestamp(0)).unwrap();

        let pass = queue.retry(Timestamp(6_000), |_| Ok(false)).unwrap();
        assert_eq!(pass.stalled.len(), 1);
        assert_eq!(pass.remaining, 1);
    }

    #[test]
    fn test_pushes_after_retry_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.q");
        {
            let queue = PendingQueue::open_or_create(&path, policy()).unwrap();
            assert_eq!(queue.push_all(vec![op("l1"), op("l2"), op("l1")], Timestamp(0)).unwrap(), 2);

            let pass = queue
                .retry(Timestamp(100), |o| Ok(o.source_key.rkey == "l1"))
                .unwrap();
            assert_eq!((pass.delivered, pass.remaining), (1, 1));

            // Appends go to the rewritten file, and a delivered op may be queued again
            assert!(queue.push(op("l3"), Timestamp(200)).unwrap());
            assert!(queue.push(op("l1"), Timestamp(200)).unwrap());
        }

        let queue = PendingQueue::open_or_create(&path, policy()).unwrap();
        let rkeys: Vec<_> = queue.entries().iter().map(|e| e.op.source_key.rkey.clone()).collect();
        assert_eq!(rkeys, vec!["l2", "l3", "l1"]);
        assert_eq!(queue.entries()[0].attempts, 1);
    }

    #[test]
    fn test_push_appends_without_rewriting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.q");
        let queue = PendingQueue::open_or_create(&path, policy()).unwrap();

        let mut sizes = Vec::new();
        for i in 0..50 {
            queue.push(op(&format!("l{:02}", i)), Timestamp(0)).unwrap();
            sizes.push(std::fs::metadata(&path).unwrap().len());
        }
        // Every push grows the file by exactly one frame
        let growth: Vec<_> = sizes.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(growth.iter().all(|g| *g == growth[0]));
        assert_eq!(queue.len(), 50);
    }
}
