//! Per-account store tying log, index, counters and dispersion together.

use crate::collab::{EngagementSource, SnapshotDecoder};
use crate::compaction::{self, CompactionReport};
use crate::dispersion::{
    deliver, route, AppliedOps, Delivery, DispersionOp, PendingQueue, RetryPass, RetryPolicy, TargetResolver,
};
use crate::error::{Result, StoreError};
use crate::events::{EventBus, EventFilter, StoreEvent, SubscriptionHandle};
use crate::generation::{self, Generation, COUNTERS_FILE, INDEX_FILE, LOG_FILE};
use crate::ingest::{self, IngestReport};
use crate::journal::sync_parent;
use crate::recovery::{self, IntegrityReport};
use crate::types::{AccountId, CountersSlot, Envelope, IndexKey, NormalizedRecord, RecordUri, Timestamp, ViewerFlags};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Store configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding every account store.
    pub root: PathBuf,

    /// Whether to create an account store on first open.
    pub create_if_missing: bool,

    /// Fsync every N appends or slot writes (0 and 1 both mean every write).
    pub sync_interval: u64,

    /// Decoded envelopes kept per account for `read_record`.
    pub envelope_cache_size: usize,

    /// Checkpoint the index once its journal holds this many records per key.
    pub index_checkpoint_ratio: u64,

    /// How long a tombstoned key survives compaction.
    pub tombstone_retention_ms: i64,

    pub dispersion_backoff_base_ms: i64,

    pub dispersion_backoff_max_ms: i64,

    /// Age after which an undelivered dispersion op is reported.
    pub dispersion_warn_horizon_ms: i64,

    /// Per-subscriber event buffer.
    pub event_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./engagement"),
            create_if_missing: true,
            sync_interval: 100,
            envelope_cache_size: 1000,
            index_checkpoint_ratio: 4,
            tombstone_retention_ms: 30 * 24 * 60 * 60 * 1000,
            dispersion_backoff_base_ms: 1000,
            dispersion_backoff_max_ms: 60 * 60 * 1000,
            dispersion_warn_horizon_ms: 24 * 60 * 60 * 1000,
            event_buffer: 1024,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `root`, defaults elsewhere.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispersion_backoff_base_ms <= 0 || self.dispersion_backoff_max_ms < self.dispersion_backoff_base_ms {
            return Err(StoreError::Config(format!(
                "dispersion backoff bounds {}..{} ms",
                self.dispersion_backoff_base_ms, self.dispersion_backoff_max_ms
            )));
        }
        if self.tombstone_retention_ms < 0 {
            return Err(StoreError::Config("negative tombstone retention".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_ms: self.dispersion_backoff_base_ms,
            max_ms: self.dispersion_backoff_max_ms,
            warn_horizon_ms: self.dispersion_warn_horizon_ms,
        }
    }
}

/// Magic bytes for the account manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"EGS\0";

/// Current store format version.
const MANIFEST_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const APPLIED_FILE: &str = "applied.jnl";
const PENDING_FILE: &str = "pending.q";

/// Directory of `account` under `root`: `{root}/{prefix}/{escaped id}`.
///
/// The leaf keeps the full id, scheme included, so distinct ids never share
/// a directory: `:` becomes `+`, ASCII alphanumerics and `.-` stay, and any
/// other byte is written as `_` plus two hex digits.
pub fn account_dir(root: &Path, account: &AccountId) -> PathBuf {
    let mut name = String::with_capacity(account.as_str().len());
    for byte in account.as_str().bytes() {
        match byte {
            b':' => name.push('+'),
            b'.' | b'-' => name.push(byte as char),
            _ if byte.is_ascii_alphanumeric() => name.push(byte as char),
            _ => name.push_str(&format!("_{:02x}", byte)),
        }
    }
    root.join(account.shard_prefix()).join(name)
}

/// Whether `account` has a store under `root`.
pub fn store_exists(root: &Path, account: &AccountId) -> bool {
    account_dir(root, account).join(MANIFEST_FILE).exists()
}

fn write_manifest(dir: &Path, account: &AccountId) -> Result<()> {
    let path = dir.join(MANIFEST_FILE);
    let tmp = dir.join("MANIFEST.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[MANIFEST_VERSION, 0, 0, 0])?;
        let id = account.as_str().as_bytes();
        file.write_all(&(id.len() as u32).to_le_bytes())?;
        file.write_all(id)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    sync_parent(&path)?;
    Ok(())
}

pub(crate) fn verify_manifest(dir: &Path, account: &AccountId) -> Result<()> {
    let mut file = File::open(dir.join(MANIFEST_FILE))?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)
        .map_err(|_| StoreError::InvalidFormat("Truncated manifest".into()))?;

    if &header[..4] != MANIFEST_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid store magic".into()));
    }
    if header[4] != MANIFEST_VERSION {
        return Err(StoreError::VersionMismatch {
            file: "manifest",
            expected: MANIFEST_VERSION,
            got: header[4],
        });
    }

    let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let mut id = vec![0u8; len];
    file.read_exact(&mut id)
        .map_err(|_| StoreError::InvalidFormat("Truncated manifest".into()))?;
    if id != account.as_str().as_bytes() {
        return Err(StoreError::InvalidFormat(format!(
            "manifest in {} belongs to {}",
            dir.display(),
            String::from_utf8_lossy(&id)
        )));
    }
    Ok(())
}

/// Advisory lock file of an account directory.
///
/// While held it contains the holder's pid. Content found at acquisition
/// means the previous holder died without releasing it.
struct LockFile {
    file: File,
}

impl LockFile {
    fn open(dir: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        Ok(Self { file })
    }

    /// Take the lock. Returns whether the previous holder crashed.
    fn try_acquire(&self, account: &AccountId) -> Result<bool> {
        self.file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Busy(account.clone()))?;

        let stamp = (|| -> Result<bool> {
            let crashed = self.file.metadata()?.len() > 0;
            let mut file = &self.file;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(std::process::id().to_string().as_bytes())?;
            Ok(crashed)
        })();
        if stamp.is_err() {
            let _ = FileExt::unlock(&self.file);
        }
        stamp
    }

    fn release(&self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

/// Held lock on a [`LockFile`], released on drop.
struct LockHold<'a>(&'a LockFile);

impl Drop for LockHold<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Exclusive right to mutate one account store, released on drop.
pub struct WriterGuard<'a> {
    _hold: LockHold<'a>,
    _local: MutexGuard<'a, ()>,
}

/// Result of an authoritative counters resync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResyncOutcome {
    /// False when the slot already held fresher counts.
    pub applied: bool,
    pub counters: CountersSlot,
    pub viewer: ViewerFlags,
}

/// Size and shape of a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    pub generation: u64,
    pub keys: u64,
    pub slots: u64,
    pub log_bytes: u64,
    pub total_bytes: u64,
    pub applied_ops: u64,
    pub pending_ops: u64,
}

/// Durable record store of one account.
///
/// Writers are serialized by [`WriterGuard`]; a second writer fails fast with
/// [`StoreError::Busy`]. Readers never take the writer lock.
pub struct AccountStore {
    account: AccountId,

    dir: PathBuf,

    config: StoreConfig,

    lock: LockFile,

    /// In-process half of the writer lock.
    writer: Mutex<()>,

    /// Live generation; swapped as a unit by compaction.
    generation: RwLock<Arc<Generation>>,

    applied: RwLock<AppliedOps>,

    pending: PendingQueue,

    /// Decoded envelopes by (generation, offset).
    cache: Mutex<LruCache<(u64, u64), Envelope>>,

    events: Arc<EventBus>,
}

impl AccountStore {
    /// Open (or create, if configured) the store of `account`.
    pub fn open(account: AccountId, config: StoreConfig) -> Result<Self> {
        let events = Arc::new(EventBus::new(config.event_buffer));
        Self::open_with_events(account, config, events)
    }

    /// Open with a shared event bus.
    pub fn open_with_events(account: AccountId, config: StoreConfig, events: Arc<EventBus>) -> Result<Self> {
        let dir = account_dir(&config.root, &account);
        if !dir.join(MANIFEST_FILE).exists() {
            if !config.create_if_missing {
                return Err(StoreError::UnknownAccount(account));
            }
            Self::create_layout(&dir, &account, config.sync_interval)?;
        }
        verify_manifest(&dir, &account)?;

        let lock = LockFile::open(&dir)?;
        let (generation, applied) = {
            let crashed = lock.try_acquire(&account)?;
            let _hold = LockHold(&lock);
            if crashed {
                tracing::warn!(account = %account, "previous writer did not release the lock, scanning");
            }
            (
                Self::open_current(&account, &dir, &config, &events)?,
                AppliedOps::open_or_create(dir.join(APPLIED_FILE), config.sync_interval)?,
            )
        };

        let pending = PendingQueue::open_or_create(dir.join(PENDING_FILE), config.retry_policy())?;
        let cache_size = NonZeroUsize::new(config.envelope_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        tracing::debug!(account = %account, generation = generation.number, "account store opened");
        Ok(Self {
            account,
            dir,
            config,
            lock,
            writer: Mutex::new(()),
            generation: RwLock::new(Arc::new(generation)),
            applied: RwLock::new(applied),
            pending,
            cache: Mutex::new(LruCache::new(cache_size)),
            events,
        })
    }

    fn create_layout(dir: &Path, account: &AccountId, sync_interval: u64) -> Result<()> {
        // A directory without a manifest is an interrupted create
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        Generation::create(dir, 1, sync_interval)?;
        generation::write_current(dir, 1)?;
        write_manifest(dir, account)?;
        tracing::info!(account = %account, dir = %dir.display(), "account store created");
        Ok(())
    }

    fn open_current(account: &AccountId, dir: &Path, config: &StoreConfig, events: &EventBus) -> Result<Generation> {
        let number = generation::read_current(dir)?
            .ok_or_else(|| StoreError::InvalidFormat(format!("{} has no CURRENT", dir.display())))?;
        generation::remove_stale(dir, number)?;
        let (generation, report) =
            recovery::open_generation(account, dir, number, config.sync_interval, events)?;
        tracing::debug!(account = %account, ?report, "generation opened");
        Ok(generation)
    }

    /// Take the writer lock, reloading if another writer changed the store.
    pub fn lock_writer(&self) -> Result<WriterGuard<'_>> {
        let local = self
            .writer
            .try_lock()
            .ok_or_else(|| StoreError::Busy(self.account.clone()))?;
        let crashed = self.lock.try_acquire(&self.account)?;
        let guard = WriterGuard {
            _hold: LockHold(&self.lock),
            _local: local,
        };

        if crashed {
            tracing::warn!(account = %self.account, "previous writer did not release the lock, scanning");
            self.reload()?;
        } else if self.changed_on_disk()? {
            tracing::debug!(account = %self.account, "store changed by another writer, reloading");
            self.reload()?;
        }
        Ok(guard)
    }

    fn changed_on_disk(&self) -> Result<bool> {
        let generation = self.generation();
        if generation::read_current(&self.dir)? != Some(generation.number) {
            return Ok(true);
        }
        let len = |name: &str| fs::metadata(generation.dir.join(name)).map(|m| m.len());
        Ok(len(LOG_FILE)? != generation.log.size()
            || len(COUNTERS_FILE)? != generation.counters.size()
            || len(INDEX_FILE)? != generation.index.journal_len()
            || fs::metadata(self.dir.join(APPLIED_FILE))?.len() != self.applied.read().journal_len())
    }

    /// Re-run the open-time scan. Caller holds the writer lock.
    fn reload(&self) -> Result<()> {
        let generation = Self::open_current(&self.account, &self.dir, &self.config, &self.events)?;
        let applied = AppliedOps::open_or_create(self.dir.join(APPLIED_FILE), self.config.sync_interval)?;
        *self.generation.write() = Arc::new(generation);
        *self.applied.write() = applied;
        self.cache.lock().clear();
        Ok(())
    }

    /// Live generation. Holding the returned `Arc` keeps its files alive
    /// across a concurrent compaction.
    pub fn generation(&self) -> Arc<Generation> {
        Arc::clone(&self.generation.read())
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Ops this store owes to other stores.
    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn subscribe(&self, filter: EventFilter) -> SubscriptionHandle {
        self.events.subscribe(filter)
    }

    // --- Ingest ---

    /// Ingest a batch of decoded records and route the dispersion it causes.
    pub fn ingest(&self, records: Vec<NormalizedRecord>, resolver: &dyn TargetResolver) -> Result<IngestReport> {
        let batch = {
            let _writer = self.lock_writer()?;
            let generation = self.generation();
            let batch = ingest::apply_batch(&generation, &self.account, records)?;
            generation.log.sync()?;
            generation.index.sync()?;
            if generation.index.needs_checkpoint(self.config.index_checkpoint_ratio) {
                generation.index.checkpoint()?;
            }
            batch
        };

        let mut report = batch.report;
        let routed = route(self, batch.ops, resolver, Timestamp::now());
        report.dispersed = routed.dispersed;
        report.queued = routed.queued;

        tracing::info!(
            account = %self.account,
            accepted = report.accepted,
            deduplicated = report.deduplicated,
            failed = report.failed,
            dispersed = report.dispersed,
            queued = report.queued,
            "ingest finished"
        );
        self.events.publish(StoreEvent::IngestFinished {
            account: self.account.clone(),
            accepted: report.accepted,
            deduplicated: report.deduplicated,
            failed: report.failed,
        });
        Ok(report)
    }

    /// Decode a raw snapshot with `decoder` and ingest it.
    pub fn ingest_snapshot(
        &self,
        bytes: &[u8],
        decoder: &dyn SnapshotDecoder,
        resolver: &dyn TargetResolver,
    ) -> Result<IngestReport> {
        let records = decoder.decode(bytes)?;
        self.ingest(records, resolver)
    }

    // --- Reads ---

    /// Current envelope for `key`; `None` if absent or deleted.
    pub fn read_record(&self, key: &IndexKey) -> Result<Option<Envelope>> {
        let generation = self.generation();
        let entry = match generation.index.lookup(key) {
            Some(entry) if !entry.deleted => entry,
            _ => return Ok(None),
        };

        let cache_key = (generation.number, entry.log_offset);
        if let Some(envelope) = self.cache.lock().get(&cache_key).cloned() {
            return Ok(Some(envelope));
        }
        let envelope = generation.log.read_at(entry.log_offset)?;
        self.cache.lock().put(cache_key, envelope.clone());
        Ok(Some(envelope))
    }

    /// Counters of `key`; `None` until anything has been counted for it.
    pub fn read_counters(&self, key: &IndexKey) -> Result<Option<CountersSlot>> {
        let generation = self.generation();
        let slot = generation
            .index
            .lookup(key)
            .and_then(|entry| entry.counters_slot)
            .or_else(|| generation.counters.slot_for(key));
        slot.map(|slot| generation.counters.read(slot)).transpose()
    }

    // --- Counters ---

    /// Apply an op targeting this store. Returns false if it was already applied.
    pub fn apply_dispersion(&self, op: &DispersionOp) -> Result<bool> {
        if op.target() != &self.account {
            return Err(StoreError::InvalidRecord(format!(
                "op for {} applied to {}",
                op.target(),
                self.account
            )));
        }

        let _writer = self.lock_writer()?;
        let key = op.idempotency_key();
        let applied = self.applied.read();
        if applied.contains(&key) {
            tracing::debug!(account = %self.account, kind = %op.kind, subject = %op.subject, "op already applied");
            return Ok(false);
        }

        let generation = self.generation();
        let slot = generation.counters.allocate_slot(&op.subject.key)?;
        generation.index.attach_slot(&op.subject.key, slot)?;

        if !applied.record(&key)? {
            return Ok(false);
        }
        let counters = generation.counters.increment(slot, op.kind.counter(), 1)?;
        tracing::debug!(
            account = %self.account,
            kind = %op.kind,
            actor = %op.actor,
            subject = %op.subject,
            slot = slot.0,
            value = counters.get(op.kind.counter()),
            "dispersion applied"
        );
        Ok(true)
    }

    /// Overwrite the counters of `key` with authoritative remote values.
    ///
    /// Values older than the slot's last update are ignored.
    pub fn resync_counters(&self, key: &IndexKey, source: &dyn EngagementSource) -> Result<ResyncOutcome> {
        let uri = RecordUri::new(self.account.clone(), key.clone());
        let snapshot = source.fetch_authoritative_counts(&uri)?;

        let _writer = self.lock_writer()?;
        let generation = self.generation();
        let slot = generation.counters.allocate_slot(key)?;
        generation.index.attach_slot(key, slot)?;
        let applied = generation
            .counters
            .set_authoritative(slot, &snapshot.counts, snapshot.observed_at)?;
        generation.counters.sync()?;

        tracing::debug!(account = %self.account, key = %key, applied, "counters resynced");
        Ok(ResyncOutcome {
            applied,
            counters: generation.counters.read(slot)?,
            viewer: snapshot.viewer,
        })
    }

    // --- Dispersion retry ---

    /// Retry due pending ops against `resolver`.
    pub fn retry_pending(&self, resolver: &dyn TargetResolver, now: Timestamp) -> Result<RetryPass> {
        let pass = self.pending.retry(now, |op| {
            Ok(deliver(self, op, resolver)? != Delivery::Deferred)
        })?;
        if pass.delivered > 0 {
            tracing::info!(
                account = %self.account,
                delivered = pass.delivered,
                remaining = pass.remaining,
                "pending dispersion drained"
            );
        }
        for entry in &pass.stalled {
            self.events.publish(StoreEvent::DispersionStalled {
                source: self.account.clone(),
                target: entry.op.target().clone(),
                kind: entry.op.kind.to_string(),
                subject: entry.op.subject.to_string(),
                age_ms: entry.age_ms(now),
            });
        }
        Ok(pass)
    }

    // --- Maintenance ---

    /// Rewrite the log keeping only current state, and publish it atomically.
    pub fn compact(&self, abort: Option<&AtomicBool>) -> Result<CompactionReport> {
        let _writer = self.lock_writer()?;
        let current = self.generation();
        let (next, report) = compaction::build_next(
            &current,
            &self.dir,
            self.config.tombstone_retention_ms,
            self.config.sync_interval,
            Timestamp::now(),
            abort,
        )?;

        if let Some(flag) = abort {
            if flag.load(Ordering::SeqCst) {
                next.retire();
                return Err(StoreError::Aborted);
            }
        }
        if let Err(e) = generation::write_current(&self.dir, next.number) {
            next.retire();
            return Err(e);
        }

        // Publish: readers holding the old Arc keep its files until they let go
        let old = std::mem::replace(&mut *self.generation.write(), Arc::new(next));
        old.retire();
        drop(old);
        self.cache.lock().clear();

        tracing::info!(
            account = %self.account,
            generation = report.generation,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            keys_dropped = report.keys_dropped,
            slots_dropped = report.slots_dropped,
            "compaction published"
        );
        self.events.publish(StoreEvent::CompactionPublished {
            account: self.account.clone(),
            generation: report.generation,
            bytes_before: report.bytes_before,
            bytes_after: report.bytes_after,
        });
        Ok(report)
    }

    /// Compare the journaled index with a rebuild from the log.
    pub fn verify(&self) -> Result<IntegrityReport> {
        let _writer = self.lock_writer()?;
        recovery::verify(&self.generation(), self.config.sync_interval)
    }

    /// Rewrite the index journal as a dense map.
    pub fn checkpoint_index(&self) -> Result<()> {
        let _writer = self.lock_writer()?;
        self.generation().index.checkpoint()
    }

    pub fn stats(&self) -> StoreStats {
        let generation = self.generation();
        StoreStats {
            generation: generation.number,
            keys: generation.index.len() as u64,
            slots: generation.counters.len(),
            log_bytes: generation.log.size(),
            total_bytes: generation.size(),
            applied_ops: self.applied.read().len() as u64,
            pending_ops: self.pending.len() as u64,
        }
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.generation().sync()
    }
}

impl Drop for AccountStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispersion::{OpKind, Unresolved};
    use crate::types::{Counter, PostBody, RecordBody};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            sync_interval: 1,
            ..StoreConfig::at(dir.path())
        }
    }

    fn post(rkey: &str, text: &str) -> NormalizedRecord {
        NormalizedRecord::new(
            AccountId::new("did:plc:alice"),
            IndexKey::new("app.bsky.feed.post", rkey),
            Timestamp(1),
            RecordBody::Post(PostBody {
                text: text.to_string(),
                ..Default::default()
            }),
        )
    }

    fn post_of(owner: &str, rkey: &str) -> NormalizedRecord {
        NormalizedRecord {
            owner: AccountId::new(owner),
            ..post(rkey, owner)
        }
    }

    fn alice(dir: &TempDir) -> AccountStore {
        AccountStore::open(AccountId::new("did:plc:alice"), test_config(dir)).unwrap()
    }

    #[test]
    fn test_create_layout() {
        let dir = TempDir::new().unwrap();
        let store = alice(&dir);

        let expected = dir.path().join("al").join("did+plc+alice");
        assert_eq!(store.dir(), expected.as_path());
        assert!(expected.join("MANIFEST").exists());
        assert!(expected.join("gen-000001").join(LOG_FILE).exists());
        assert!(store_exists(dir.path(), store.account()));
    }

    #[test]
    fn test_account_dirs_are_distinct() {
        let dir = TempDir::new().unwrap();
        let ids = ["did:plc:alice", "did:web:alice", "alice", "did+plc+alice", "did_plc_alice"];
        let dirs: std::collections::HashSet<_> = ids
            .iter()
            .map(|id| account_dir(dir.path(), &AccountId::new(*id)))
            .collect();
        assert_eq!(dirs.len(), ids.len());

        for id in ids {
            let store = AccountStore::open(AccountId::new(id), test_config(&dir)).unwrap();
            store.ingest(vec![post_of(id, "r1")], &Unresolved).unwrap();
        }
        for id in ids {
            let store = AccountStore::open(AccountId::new(id), test_config(&dir)).unwrap();
            assert_eq!(store.account().as_str(), id);
            assert_eq!(store.stats().keys, 1);
        }
    }

    #[test]
    fn test_unknown_account_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        let result = AccountStore::open(AccountId::new("did:plc:nobody"), config);
        assert!(matches!(result, Err(StoreError::UnknownAccount(_))));
    }

    #[test]
    fn test_ingest_and_read() {
        let dir = TempDir::new().unwrap();
        let store = alice(&dir);

        let report = store.ingest(vec![post("r1", "hello")], &Unresolved).unwrap();
        assert_eq!(report.accepted, 1);

        let key = IndexKey::new("app.bsky.feed.post", "r1");
        let envelope = store.read_record(&key).unwrap().unwrap();
        assert!(matches!(envelope.body, RecordBody::Post(ref p) if p.text == "hello"));
        assert_eq!(store.read_counters(&key).unwrap(), None);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let store = alice(&dir);
            store.ingest(vec![post("r1", "hello"), post("r2", "world")], &Unresolved).unwrap();
        }

        let store = alice(&dir);
        assert_eq!(store.stats().keys, 2);
        assert!(store
            .read_record(&IndexKey::new("app.bsky.feed.post", "r2"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_writer_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = alice(&dir);

        let guard = store.lock_writer().unwrap();
        assert!(matches!(store.lock_writer(), Err(StoreError::Busy(_))));
        assert!(matches!(
            store.ingest(vec![post("r1", "x")], &Unresolved),
            Err(StoreError::Busy(_))
        ));
        drop(guard);
        assert!(store.lock_writer().is_ok());
    }

    #[test]
    fn test_self_dispersion_applies_locally() {
        let dir = TempDir::new().unwrap();
        let store = alice(&dir);
        store.ingest(vec![post("r1", "hello")], &Unresolved).unwrap();

        let op = DispersionOp {
            kind: OpKind::Like,
            actor: AccountId::new("did:plc:carol"),
            subject: RecordUri::parse("at://did:plc:alice/app.bsky.feed.post/r1").unwrap(),
            source_key: IndexKey::new("app.bsky.feed.like", "l1"),
        };
        assert!(store.apply_dispersion(&op).unwrap());
        assert!(!store.apply_dispersion(&op).unwrap());

        let counters = store
            .read_counters(&IndexKey::new("app.bsky.feed.post", "r1"))
            .unwrap()
            .unwrap();
        assert_eq!(counters.known(Counter::Like), Some(1));
    }

    #[test]
    fn test_config_from_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"root": "/tmp/x", "sync_interval": 7}"#).unwrap();

        let config = StoreConfig::from_json_file(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/x"));
        assert_eq!(config.sync_interval, 7);
        assert_eq!(config.envelope_cache_size, 1000);

        fs::write(&path, r#"{"dispersion_backoff_base_ms": 0}"#).unwrap();
        assert!(matches!(StoreConfig::from_json_file(&path), Err(StoreError::Config(_))));
    }
}
