//! Slot index: record key -> current envelope and counters slot.
//!
//! The index is an append-only journal of upserts, periodically rewritten as a
//! dense key-sorted map. It is a derived cache of the envelope log and can
//! always be rebuilt by replaying the log.

use super::codec::effective_hash;
use super::log::{EnvelopeLog, LoggedEnvelope};
use crate::error::Result;
use crate::journal::{encode_frame, Journal, JournalKind, HEADER_SIZE};
use crate::types::{IndexKey, SlotId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Index journal file identity.
pub const INDEX_KIND: JournalKind = JournalKind {
    name: "index journal",
    magic: *b"IXJ\0",
    version: 1,
};

/// Journals shorter than this are never checkpointed.
const MIN_CHECKPOINT_RECORDS: u64 = 64;

/// Current state of one record key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: IndexKey,
    /// Effective content hash (supplied or derived).
    pub content_hash: String,
    pub source_timestamp: Timestamp,
    pub log_offset: u64,
    pub log_end: u64,
    pub deleted: bool,
    pub counters_slot: Option<SlotId>,
}

impl IndexEntry {
    /// Entry describing a logged envelope.
    pub fn from_logged(logged: &LoggedEnvelope, counters_slot: Option<SlotId>) -> Result<Self> {
        Ok(Self {
            key: logged.envelope.key.clone(),
            content_hash: effective_hash(&logged.envelope)?,
            source_timestamp: logged.envelope.source_timestamp,
            log_offset: logged.offset,
            log_end: logged.end,
            deleted: logged.envelope.deleted,
            counters_slot,
        })
    }
}

/// Outcome of loading an index journal.
pub enum IndexLoad {
    Loaded(SlotIndex),
    /// The journal cannot be trusted; the reason is logged by the caller.
    NeedsRebuild(String),
}

/// In-memory view of the index.
#[derive(Default)]
struct IndexState {
    /// Current entry per key, sorted for dense encoding.
    entries: BTreeMap<IndexKey, IndexEntry>,

    /// Content hash -> key of live entries.
    by_hash: HashMap<String, IndexKey>,

    /// Highest `log_end` covered by an entry.
    high_water: u64,
}

impl IndexState {
    fn apply(&mut self, entry: IndexEntry) {
        if let Some(old) = self.entries.get(&entry.key) {
            if self.by_hash.get(&old.content_hash) == Some(&old.key) {
                self.by_hash.remove(&old.content_hash);
            }
        }
        if !entry.deleted {
            self.by_hash.insert(entry.content_hash.clone(), entry.key.clone());
        }
        self.high_water = self.high_water.max(entry.log_end);
        self.entries.insert(entry.key.clone(), entry);
    }

    fn dense_payloads(&self) -> Result<Vec<Vec<u8>>> {
        self.entries
            .values()
            .map(|entry| -> Result<Vec<u8>> { Ok(rmp_serde::to_vec(entry)?) })
            .collect()
    }
}

/// Persistent key -> entry map backed by an append-only journal.
pub struct SlotIndex {
    path: PathBuf,

    journal: RwLock<Journal>,

    state: RwLock<IndexState>,

    /// Frames in the journal, live or superseded.
    journal_records: RwLock<u64>,

    sync_interval: u64,
}

impl SlotIndex {
    /// Create an empty index.
    pub fn create(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let journal = Journal::create(&path, INDEX_KIND, sync_interval)?;
        Ok(Self::from_parts(path, journal, IndexState::default(), 0, sync_interval))
    }

    fn from_parts(
        path: PathBuf,
        journal: Journal,
        state: IndexState,
        journal_records: u64,
        sync_interval: u64,
    ) -> Self {
        Self {
            path,
            journal: RwLock::new(journal),
            state: RwLock::new(state),
            journal_records: RwLock::new(journal_records),
            sync_interval,
        }
    }

    /// Load the index journal, or report why it must be rebuilt.
    ///
    /// `log_size` is the size of the (already recovered) envelope log.
    pub fn open(path: impl AsRef<Path>, log_size: u64, sync_interval: u64) -> Result<IndexLoad> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(IndexLoad::NeedsRebuild("index journal missing".into()));
        }

        let (journal, recovery) = match Journal::open(&path, INDEX_KIND, sync_interval) {
            Ok(opened) => opened,
            Err(e) => return Ok(IndexLoad::NeedsRebuild(e.to_string())),
        };
        if recovery.corrupt_midfile {
            return Ok(IndexLoad::NeedsRebuild("index journal corrupt mid-file".into()));
        }

        let mut state = IndexState::default();
        let mut records = 0;
        for frame in journal.iter_from(HEADER_SIZE)? {
            let (_, payload) = frame?;
            let entry = match rmp_serde::from_slice::<IndexEntry>(&payload) {
                Ok(entry) => entry,
                Err(e) => return Ok(IndexLoad::NeedsRebuild(e.to_string())),
            };
            if entry.log_end > log_size {
                return Ok(IndexLoad::NeedsRebuild(format!(
                    "entry for {} ends at {} past log end {}",
                    entry.key, entry.log_end, log_size
                )));
            }
            state.apply(entry);
            records += 1;
        }

        Ok(IndexLoad::Loaded(Self::from_parts(
            path,
            journal,
            state,
            records,
            sync_interval,
        )))
    }

    /// Rebuild from a full log replay, last write wins per key.
    ///
    /// Slot associations come from `slots`, keyed by record key, so repeated
    /// rebuilds produce the same set of count-bearing entries.
    pub fn rebuild(
        path: impl AsRef<Path>,
        log: &EnvelopeLog,
        slots: &BTreeMap<IndexKey, SlotId>,
        sync_interval: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = IndexState::default();

        for logged in log.envelopes(log.start())? {
            let logged = logged?;
            let slot = slots.get(&logged.envelope.key).copied();
            state.apply(IndexEntry::from_logged(&logged, slot)?);
        }

        let payloads = state.dense_payloads()?;
        Journal::write_atomic(&path, INDEX_KIND, payloads.iter().map(Vec::as_slice))?;
        let (journal, _) = Journal::open(&path, INDEX_KIND, sync_interval)?;
        Ok(Self::from_parts(
            path,
            journal,
            state,
            payloads.len() as u64,
            sync_interval,
        ))
    }

    /// Current entries as of `log`'s end, without writing anything.
    ///
    /// The journal is used when it is readable and consistent with the log;
    /// otherwise the log is replayed in memory.
    pub fn read_entries(path: impl AsRef<Path>, log: &EnvelopeLog) -> Result<BTreeMap<IndexKey, IndexEntry>> {
        let mut state = match Self::read_journal(path.as_ref(), log.size()) {
            Ok(Some(state)) => state,
            Ok(None) => IndexState::default(),
            Err(e) => {
                tracing::debug!(path = %path.as_ref().display(), error = %e, "index journal unusable, replaying log");
                IndexState::default()
            }
        };

        let from = state.high_water.max(log.start());
        for logged in log.envelopes(from)? {
            state.apply(IndexEntry::from_logged(&logged?, None)?);
        }
        Ok(state.entries)
    }

    /// Journaled state, or `None` if it does not match the log.
    fn read_journal(path: &Path, log_size: u64) -> Result<Option<IndexState>> {
        if !path.exists() {
            return Ok(None);
        }
        let (journal, recovery) = Journal::open_read_only(path, INDEX_KIND)?;
        if recovery.corrupt_midfile {
            return Ok(None);
        }
        let mut state = IndexState::default();
        for frame in journal.iter_from(HEADER_SIZE)? {
            let (_, payload) = frame?;
            let entry: IndexEntry = rmp_serde::from_slice(&payload)?;
            if entry.log_end > log_size {
                return Ok(None);
            }
            state.apply(entry);
        }
        Ok(Some(state))
    }

    /// Journal and apply envelopes the log holds beyond the last indexed one.
    ///
    /// Returns the number of envelopes applied.
    pub fn catch_up(&self, log: &EnvelopeLog, slots: &BTreeMap<IndexKey, SlotId>) -> Result<u64> {
        let from = self.high_water().max(log.start());
        if from >= log.size() {
            return Ok(0);
        }

        let mut applied = 0;
        for logged in log.envelopes(from)? {
            let logged = logged?;
            let slot = slots.get(&logged.envelope.key).copied();
            self.upsert(IndexEntry::from_logged(&logged, slot)?)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Current entry for `key`.
    pub fn lookup(&self, key: &IndexKey) -> Option<IndexEntry> {
        self.state.read().entries.get(key).cloned()
    }

    /// Key whose live entry has this content hash.
    pub fn lookup_hash(&self, content_hash: &str) -> Option<IndexKey> {
        self.state.read().by_hash.get(content_hash).cloned()
    }

    /// Journal and apply an entry.
    pub fn upsert(&self, entry: IndexEntry) -> Result<()> {
        let payload = rmp_serde::to_vec(&entry)?;
        // Held across apply so a checkpoint never misses a journaled entry
        let journal = self.journal.read();
        journal.append(&payload)?;
        *self.journal_records.write() += 1;
        self.state.write().apply(entry);
        Ok(())
    }

    /// Record that `key` now has a counters slot. No-op without an entry.
    pub fn attach_slot(&self, key: &IndexKey, slot: SlotId) -> Result<bool> {
        let entry = match self.lookup(key) {
            Some(entry) if entry.counters_slot != Some(slot) => entry,
            _ => return Ok(false),
        };
        self.upsert(IndexEntry {
            counters_slot: Some(slot),
            ..entry
        })?;
        Ok(true)
    }

    /// Canonical encoding of the current map: one frame per key, key order.
    pub fn encode_dense(&self) -> Result<Vec<u8>> {
        Ok(self
            .state
            .read()
            .dense_payloads()?
            .iter()
            .flat_map(|payload| encode_frame(payload))
            .collect())
    }

    /// Rewrite the journal as the dense map.
    pub fn checkpoint(&self) -> Result<()> {
        let mut journal = self.journal.write();
        let payloads = self.state.read().dense_payloads()?;
        Journal::write_atomic(&self.path, INDEX_KIND, payloads.iter().map(Vec::as_slice))?;
        let (reopened, _) = Journal::open(&self.path, INDEX_KIND, self.sync_interval)?;
        *journal = reopened;
        *self.journal_records.write() = payloads.len() as u64;
        tracing::debug!(path = %self.path.display(), entries = payloads.len(), "index checkpointed");
        Ok(())
    }

    /// Whether superseded records dominate the journal.
    pub fn needs_checkpoint(&self, ratio: u64) -> bool {
        let records = self.journal_records();
        records > MIN_CHECKPOINT_RECORDS && records > ratio.max(1) * (self.len() as u64).max(1)
    }

    pub fn sync(&self) -> Result<()> {
        self.journal.read().sync()
    }

    /// All current entries in key order.
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.state.read().entries.values().cloned().collect()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// End of the last envelope the index covers.
    pub fn high_water(&self) -> u64 {
        self.state.read().high_water
    }

    pub fn journal_records(&self) -> u64 {
        *self.journal_records.read()
    }

    /// Bytes in the journal file.
    pub fn journal_len(&self) -> u64 {
        self.journal.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, Envelope, RecordBody, PostBody};
    use tempfile::TempDir;

    fn post(rkey: &str, text: &str, ts: i64) -> Envelope {
        Envelope {
            source_timestamp: Timestamp(ts),
            owner: AccountId::new("did:plc:alice"),
            key: IndexKey::new("app.bsky.feed.post", rkey),
            content_hash: None,
            deleted: false,
            body: RecordBody::Post(PostBody {
                text: text.to_string(),
                ..Default::default()
            }),
        }
    }

    fn append_and_index(log: &EnvelopeLog, index: &SlotIndex, envelope: Envelope) -> IndexEntry {
        let (offset, end) = log.append(&envelope).unwrap();
        let entry = IndexEntry::from_logged(&LoggedEnvelope { offset, end, envelope }, None).unwrap();
        index.upsert(entry.clone()).unwrap();
        entry
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let log = EnvelopeLog::create(dir.path().join("envelopes.log"), 100).unwrap();
        let index = SlotIndex::create(dir.path().join("index.jnl"), 100).unwrap();

        let first = append_and_index(&log, &index, post("r1", "v1", 1));
        let second = append_and_index(&log, &index, post("r1", "v2", 2));

        let current = index.lookup(&IndexKey::new("app.bsky.feed.post", "r1")).unwrap();
        assert_eq!(current, second);
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup_hash(&second.content_hash), Some(current.key.clone()));
        assert_eq!(index.lookup_hash(&first.content_hash), None);
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let dir = TempDir::new().unwrap();
        let log = EnvelopeLog::create(dir.path().join("envelopes.log"), 100).unwrap();
        let index = SlotIndex::create(dir.path().join("index.jnl"), 100).unwrap();

        for i in 0..10 {
            append_and_index(&log, &index, post(&format!("r{}", i % 4), &format!("text {}", i), i));
        }
        let key = IndexKey::new("app.bsky.feed.post", "r2");
        index.attach_slot(&key, SlotId(0)).unwrap();

        let mut slots = BTreeMap::new();
        slots.insert(key, SlotId(0));
        let rebuilt = SlotIndex::rebuild(dir.path().join("rebuilt.jnl"), &log, &slots, 100).unwrap();

        assert_eq!(rebuilt.encode_dense().unwrap(), index.encode_dense().unwrap());
        assert_eq!(rebuilt.high_water(), log.size());
    }

    #[test]
    fn test_reload_and_catch_up() {
        let dir = TempDir::new().unwrap();
        let log = EnvelopeLog::create(dir.path().join("envelopes.log"), 100).unwrap();
        let path = dir.path().join("index.jnl");
        {
            let index = SlotIndex::create(&path, 1).unwrap();
            append_and_index(&log, &index, post("a", "a", 1));
        }
        // Appended but never indexed, as after a crash between the two steps
        log.append(&post("b", "b", 2)).unwrap();

        let index = match SlotIndex::open(&path, log.size(), 1).unwrap() {
            IndexLoad::Loaded(index) => index,
            IndexLoad::NeedsRebuild(reason) => panic!("unexpected rebuild: {}", reason),
        };
        assert_eq!(index.len(), 1);
        assert_eq!(index.catch_up(&log, &BTreeMap::new()).unwrap(), 1);
        assert!(index.lookup(&IndexKey::new("app.bsky.feed.post", "b")).is_some());
    }

    #[test]
    fn test_missing_or_foreign_journal_needs_rebuild() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.jnl");
        assert!(matches!(
            SlotIndex::open(&path, 0, 1).unwrap(),
            IndexLoad::NeedsRebuild(_)
        ));

        std::fs::write(&path, b"garbage!").unwrap();
        assert!(matches!(
            SlotIndex::open(&path, 0, 1).unwrap(),
            IndexLoad::NeedsRebuild(_)
        ));
    }

    #[test]
    fn test_checkpoint_compacts_journal() {
        let dir = TempDir::new().unwrap();
        let log = EnvelopeLog::create(dir.path().join("envelopes.log"), 1000).unwrap();
        let path = dir.path().join("index.jnl");
        let index = SlotIndex::create(&path, 1000).unwrap();

        for i in 0..100 {
            append_and_index(&log, &index, post("hot", &i.to_string(), i));
        }
        assert!(index.needs_checkpoint(4));

        let before = index.encode_dense().unwrap();
        index.checkpoint().unwrap();
        assert_eq!(index.journal_records(), 1);
        assert!(!index.needs_checkpoint(4));

        // Appends after a checkpoint land in the new file
        append_and_index(&log, &index, post("cold", "x", 200));
        drop(index);
        let reloaded = match SlotIndex::open(&path, log.size(), 1).unwrap() {
            IndexLoad::Loaded(index) => index,
            IndexLoad::NeedsRebuild(reason) => panic!("unexpected rebuild: {}", reason),
        };
        assert_eq!(reloaded.len(), 2);
        assert_ne!(reloaded.encode_dense().unwrap(), before);
    }
}
