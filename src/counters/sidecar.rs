//! Fixed-slot counters file with in-place updates.

use super::keys::SlotKeys;
use crate::error::{Result, StoreError};
use crate::journal::sync_parent;
use crate::types::{AuthoritativeCounts, Counter, CountersSlot, IndexKey, SlotId, Timestamp, SLOT_SIZE};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the counters file.
const COUNTERS_MAGIC: &[u8; 4] = b"CNT\0";

/// Current counters file version.
const COUNTERS_VERSION: u8 = 1;

/// Size of the counters file header.
pub const COUNTERS_HEADER_SIZE: u64 = 8;

/// Attempts before a reader gives up on a slot that keeps changing.
const STABLE_READ_ATTEMPTS: usize = 16;

/// Byte offset of a slot.
pub fn slot_offset(slot: SlotId) -> u64 {
    COUNTERS_HEADER_SIZE + slot.0 * SLOT_SIZE as u64
}

fn check_header(file: &mut File, path: &Path) -> Result<()> {
    let mut header = [0u8; COUNTERS_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header).map_err(|_| {
        StoreError::InvalidFormat(format!("{} too short for header", path.display()))
    })?;
    if &header[..4] != COUNTERS_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid counters magic".into()));
    }
    if header[4] != COUNTERS_VERSION {
        return Err(StoreError::VersionMismatch {
            file: "counters file",
            expected: COUNTERS_VERSION,
            got: header[4],
        });
    }
    Ok(())
}

fn read_slot_bytes(file: &mut File, slot: SlotId) -> Result<[u8; SLOT_SIZE]> {
    let mut buf = [0u8; SLOT_SIZE];
    file.seek(SeekFrom::Start(slot_offset(slot)))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read-only view of a counters file, safe to use while another process writes.
///
/// Each slot is read twice and only returned once both reads agree, so a
/// concurrent in-place write is never observed half applied.
pub struct CountersReader {
    path: PathBuf,
    file: Mutex<File>,
}

impl CountersReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        check_header(&mut file, &path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Slots currently present in the file.
    pub fn len(&self) -> Result<u64> {
        let size = self.file.lock().metadata()?.len();
        Ok(size.saturating_sub(COUNTERS_HEADER_SIZE) / SLOT_SIZE as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read a slot, retrying until two consecutive reads match.
    pub fn read_stable(&self, slot: SlotId) -> Result<CountersSlot> {
        if slot.0 >= self.len()? {
            return Err(StoreError::SlotOutOfRange(slot));
        }
        let mut file = self.file.lock();
        let mut previous = read_slot_bytes(&mut file, slot)?;
        for _ in 0..STABLE_READ_ATTEMPTS {
            let current = read_slot_bytes(&mut file, slot)?;
            if current == previous {
                return Ok(CountersSlot::decode(&current));
            }
            previous = current;
        }
        Err(StoreError::Corruption(format!(
            "counters slot {} in {} did not settle",
            slot,
            self.path.display()
        )))
    }
}

/// What reconciling the counters file with its slot-key journal changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SidecarRecovery {
    /// Slots in the file after reconciliation.
    pub slots: u64,
    /// Slots removed because no key was bound to them.
    pub truncated_slots: u64,
    /// Bound slots that had not been written and were zero-filled.
    pub zero_filled: u64,
    /// Bindings lost with a torn slot-key journal tail.
    pub lost_bindings: bool,
}

/// Dense array of fixed-size counters slots.
///
/// Slots are only ever appended; a slot's address never changes. All
/// mutations happen under the account's writer lock.
pub struct CountersSidecar {
    path: PathBuf,

    /// Write handle.
    file: Mutex<File>,

    reader: CountersReader,

    keys: SlotKeys,

    /// Writes since last sync.
    writes_since_sync: Mutex<u64>,

    sync_interval: u64,
}

impl CountersSidecar {
    /// Create an empty sidecar at `path`, with its slot-key journal at `keys_path`.
    pub fn create(path: impl AsRef<Path>, keys_path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let keys = SlotKeys::create(keys_path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut header = [0u8; COUNTERS_HEADER_SIZE as usize];
        header[..4].copy_from_slice(COUNTERS_MAGIC);
        header[4] = COUNTERS_VERSION;
        file.write_all(&header)?;
        file.sync_all()?;
        sync_parent(&path)?;

        Self::from_parts(path, file, keys, sync_interval)
    }

    /// Open an existing sidecar and reconcile it with its slot-key journal.
    pub fn open(
        path: impl AsRef<Path>,
        keys_path: impl AsRef<Path>,
        sync_interval: u64,
    ) -> Result<(Self, SidecarRecovery)> {
        let path = path.as_ref().to_path_buf();
        let (keys, keys_recovery) = SlotKeys::open(keys_path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        check_header(&mut file, &path)?;

        let bound = keys.len();
        let size = file.metadata()?.len();
        let present = size.saturating_sub(COUNTERS_HEADER_SIZE) / SLOT_SIZE as u64;

        let mut recovery = SidecarRecovery {
            slots: bound,
            lost_bindings: keys_recovery.truncated_from.is_some(),
            ..Default::default()
        };

        if present > bound {
            recovery.truncated_slots = present - bound;
        } else {
            recovery.zero_filled = bound - present;
        }

        // Also drops a partially written trailing slot
        let expected = slot_offset(SlotId(bound));
        if size != expected {
            tracing::warn!(
                path = %path.display(),
                slots_on_disk = present,
                bound_slots = bound,
                truncated = recovery.truncated_slots,
                zero_filled = recovery.zero_filled,
                "reconciling counters file with slot bindings"
            );
            file.set_len(expected)?;
            file.sync_all()?;
        }

        Ok((Self::from_parts(path, file, keys, sync_interval)?, recovery))
    }

    fn from_parts(path: PathBuf, file: File, keys: SlotKeys, sync_interval: u64) -> Result<Self> {
        let reader = CountersReader::open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            reader,
            keys,
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Slot owned by `key`, allocating a zeroed one on first reference.
    pub fn allocate_slot(&self, key: &IndexKey) -> Result<SlotId> {
        self.allocate_with(key, CountersSlot::default())
    }

    /// Slot owned by `key`, allocating one holding `initial` on first reference.
    pub fn allocate_with(&self, key: &IndexKey, initial: CountersSlot) -> Result<SlotId> {
        let (slot, created) = self.keys.bind(key)?;
        if created {
            self.write_slot(slot, &initial)?;
            tracing::debug!(slot = slot.0, key = %key, "allocated counters slot");
        }
        Ok(slot)
    }

    /// Slot bound to `key`, if any.
    pub fn slot_for(&self, key: &IndexKey) -> Option<SlotId> {
        self.keys.slot_for(key)
    }

    /// Key bound to `slot`, if any.
    pub fn key_of(&self, slot: SlotId) -> Option<IndexKey> {
        self.keys.key_of(slot)
    }

    /// All key -> slot bindings.
    pub fn bindings(&self) -> BTreeMap<IndexKey, SlotId> {
        self.keys.snapshot()
    }

    /// Add `delta` to one counter in place.
    pub fn increment(&self, slot: SlotId, counter: Counter, delta: u64) -> Result<CountersSlot> {
        self.increment_at(slot, counter, delta, Timestamp::now())
    }

    /// [`increment`](Self::increment) with an explicit clock.
    pub fn increment_at(
        &self,
        slot: SlotId,
        counter: Counter,
        delta: u64,
        at: Timestamp,
    ) -> Result<CountersSlot> {
        let mut current = self.read(slot)?;
        current.bump(counter, delta, at);
        self.write_slot(slot, &current)?;
        Ok(current)
    }

    /// Overwrite all counters when `at` is newer than the slot's timestamp.
    ///
    /// Returns whether the write was applied.
    pub fn set_authoritative(&self, slot: SlotId, counts: &AuthoritativeCounts, at: Timestamp) -> Result<bool> {
        let mut current = self.read(slot)?;
        if at <= current.updated_at {
            tracing::debug!(
                slot = slot.0,
                incoming = at.0,
                current = current.updated_at.0,
                "stale authoritative counts ignored"
            );
            return Ok(false);
        }
        current.overwrite(counts, at);
        self.write_slot(slot, &current)?;
        Ok(true)
    }

    pub fn read(&self, slot: SlotId) -> Result<CountersSlot> {
        if slot.0 >= self.len() {
            return Err(StoreError::SlotOutOfRange(slot));
        }
        self.reader.read_stable(slot)
    }

    fn write_slot(&self, slot: SlotId, value: &CountersSlot) -> Result<()> {
        let bytes = value.encode();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(slot_offset(slot)))?;
        file.write_all(&bytes)?;

        let mut writes = self.writes_since_sync.lock();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_data()?;
            *writes = 0;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Number of allocated slots.
    pub fn len(&self) -> u64 {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the counters file in bytes.
    pub fn size(&self) -> u64 {
        slot_offset(SlotId(self.len()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sidecar(dir: &TempDir) -> CountersSidecar {
        CountersSidecar::create(
            dir.path().join("counters.bin"),
            dir.path().join("counters.keys"),
            1,
        )
        .unwrap()
    }

    fn key(rkey: &str) -> IndexKey {
        IndexKey::new("app.bsky.feed.post", rkey)
    }

    #[test]
    fn test_allocate_is_keyed() {
        let dir = TempDir::new().unwrap();
        let counters = sidecar(&dir);

        let a = counters.allocate_slot(&key("a")).unwrap();
        let b = counters.allocate_slot(&key("b")).unwrap();
        assert_eq!((a, b), (SlotId(0), SlotId(1)));
        assert_eq!(counters.allocate_slot(&key("a")).unwrap(), a);
        assert_eq!(counters.len(), 2);
        assert_eq!(counters.key_of(b), Some(key("b")));
    }

    #[test]
    fn test_increment_in_place() {
        let dir = TempDir::new().unwrap();
        let counters = sidecar(&dir);
        let slot = counters.allocate_slot(&key("a")).unwrap();
        let size = std::fs::metadata(counters.path()).unwrap().len();

        counters.increment_at(slot, Counter::Like, 1, Timestamp(100)).unwrap();
        counters.increment_at(slot, Counter::Like, 2, Timestamp(50)).unwrap();

        let read = counters.read(slot).unwrap();
        assert_eq!(read.known(Counter::Like), Some(3));
        assert_eq!(read.known(Counter::Reply), None);
        assert_eq!(read.updated_at, Timestamp(100));
        assert_eq!(std::fs::metadata(counters.path()).unwrap().len(), size);
    }

    #[test]
    fn test_stale_authoritative_rejected() {
        let dir = TempDir::new().unwrap();
        let counters = sidecar(&dir);
        let slot = counters.allocate_slot(&key("a")).unwrap();
        counters.increment_at(slot, Counter::Like, 5, Timestamp(200)).unwrap();

        let counts = AuthoritativeCounts {
            likes: 1,
            ..Default::default()
        };
        assert!(!counters.set_authoritative(slot, &counts, Timestamp(150)).unwrap());
        assert_eq!(counters.read(slot).unwrap().like_count, 5);

        assert!(counters.set_authoritative(slot, &counts, Timestamp(300)).unwrap());
        let read = counters.read(slot).unwrap();
        assert_eq!(read.like_count, 1);
        assert_eq!(read.known(Counter::Quote), Some(0));
    }

    #[test]
    fn test_out_of_range() {
        let dir = TempDir::new().unwrap();
        let counters = sidecar(&dir);
        assert!(matches!(
            counters.read(SlotId(0)),
            Err(StoreError::SlotOutOfRange(SlotId(0)))
        ));
    }

    #[test]
    fn test_reconcile_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counters.bin");
        let keys = dir.path().join("counters.keys");
        {
            let counters = sidecar(&dir);
            let slot = counters.allocate_slot(&key("a")).unwrap();
            counters.increment_at(slot, Counter::Repost, 1, Timestamp(1)).unwrap();
            counters.allocate_slot(&key("b")).unwrap();
        }

        // Binding journaled, slot never written
        let full = std::fs::metadata(&path).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(full - 10)
            .unwrap();

        let (counters, recovery) = CountersSidecar::open(&path, &keys, 1).unwrap();
        assert_eq!(recovery.slots, 2);
        assert_eq!(recovery.zero_filled, 1);
        assert_eq!(counters.read(SlotId(0)).unwrap().repost_count, 1);
        assert_eq!(counters.read(SlotId(1)).unwrap(), CountersSlot::default());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full);
    }

    #[test]
    fn test_reader_sees_writes() {
        let dir = TempDir::new().unwrap();
        let counters = sidecar(&dir);
        let slot = counters.allocate_slot(&key("a")).unwrap();
        let reader = CountersReader::open(counters.path()).unwrap();

        counters.increment_at(slot, Counter::Quote, 4, Timestamp(9)).unwrap();
        let read = reader.read_stable(slot).unwrap();
        assert_eq!(read.known(Counter::Quote), Some(4));
        assert_eq!(reader.len().unwrap(), 1);
    }
}
