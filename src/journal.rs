//! Checksummed append-only journals.
//!
//! Every persistent sequence in an account store (the envelope log, the index
//! journal, the slot-key journal, the applied-op journal) shares one layout:
//! an 8-byte header (`magic[4] version[1] reserved[3]`) followed by frames of
//! `[u32 len][payload][u32 crc32(payload)]`, all little-endian.
//!
//! A frame is either complete and verified or treated as absent. On open the
//! journal truncates a torn trailing frame before any further writes. A file
//! cut inside its header reopens as an empty journal.

use crate::error::{Result, StoreError};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the file header.
pub const HEADER_SIZE: u64 = 8;

/// Per-frame overhead (length prefix + checksum).
pub const FRAME_OVERHEAD: usize = 8;

/// Largest payload accepted; anything bigger is read as a corrupt length.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Identity of a journal file type.
#[derive(Clone, Copy, Debug)]
pub struct JournalKind {
    pub name: &'static str,
    pub magic: [u8; 4],
    pub version: u8,
}

impl JournalKind {
    fn header(&self) -> [u8; HEADER_SIZE as usize] {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[..4].copy_from_slice(&self.magic);
        header[4] = self.version;
        header
    }

    fn check_header(&self, header: &[u8]) -> Result<()> {
        if header.len() <= 4 || header[..4] != self.magic {
            return Err(StoreError::InvalidFormat(format!("Invalid {} magic", self.name)));
        }
        if header[4] != self.version {
            return Err(StoreError::VersionMismatch {
                file: self.name,
                expected: self.version,
                got: header[4],
            });
        }
        Ok(())
    }

    /// Accept a file cut short inside its header.
    ///
    /// Only a strict prefix of the expected header qualifies; foreign or
    /// newer files stay fatal.
    fn check_header_prefix(&self, existing: &[u8]) -> Result<()> {
        if self.header().starts_with(existing) {
            return Ok(());
        }
        self.check_header(existing)?;
        Err(StoreError::InvalidFormat(format!(
            "{} header damaged: {} bytes",
            self.name,
            existing.len()
        )))
    }
}

/// Result of decoding one frame from a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome<'a> {
    /// A verified frame and the total bytes it occupies.
    Complete { payload: &'a [u8], consumed: usize },
    /// Not enough bytes for the declared frame.
    Incomplete,
    /// Length or checksum is wrong.
    Corrupt,
}

/// Encode a payload as a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame
}

/// Decode the frame at the start of `data`.
pub fn decode_frame(data: &[u8]) -> FrameOutcome<'_> {
    if data.len() < 4 {
        return FrameOutcome::Incomplete;
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    // Zero-filled tails would otherwise read as empty frames with a zero crc.
    if len == 0 || len > MAX_FRAME_LEN {
        return FrameOutcome::Corrupt;
    }
    let total = len + FRAME_OVERHEAD;
    if data.len() < total {
        return FrameOutcome::Incomplete;
    }
    let payload = &data[4..4 + len];
    let stored = u32::from_le_bytes([
        data[4 + len],
        data[5 + len],
        data[6 + len],
        data[7 + len],
    ]);
    if stored != crc32fast::hash(payload) {
        return FrameOutcome::Corrupt;
    }
    FrameOutcome::Complete {
        payload,
        consumed: total,
    }
}

/// Whether any verified frame starts after byte `start` of `data`.
fn has_valid_frame_after(data: &[u8], start: usize) -> bool {
    ((start + 1)..data.len())
        .any(|at| matches!(decode_frame(&data[at..]), FrameOutcome::Complete { .. }))
}

/// Length of the verified prefix of `data` (header included) and what follows it.
fn scan_frames(data: &[u8]) -> (u64, JournalRecovery) {
    let mut recovery = JournalRecovery::default();
    let mut offset = HEADER_SIZE as usize;
    while offset < data.len() {
        match decode_frame(&data[offset..]) {
            FrameOutcome::Complete { consumed, .. } => {
                offset += consumed;
                recovery.frames += 1;
            }
            FrameOutcome::Incomplete | FrameOutcome::Corrupt => {
                recovery.corrupt_midfile = has_valid_frame_after(data, offset);
                recovery.truncated_from = Some(offset as u64);
                recovery.truncated_bytes = (data.len() - offset) as u64;
                break;
            }
        }
    }
    (offset as u64, recovery)
}

/// What the open-time scan found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JournalRecovery {
    /// Number of verified frames.
    pub frames: u64,
    /// Offset a torn or corrupt tail was truncated from.
    pub truncated_from: Option<u64>,
    /// Bytes removed by truncation.
    pub truncated_bytes: u64,
    /// The bad frame was followed by verified frames.
    pub corrupt_midfile: bool,
    /// The file ended inside its header and was reset to an empty journal.
    pub header_restored: bool,
}

/// Append-only checksummed journal.
pub struct Journal {
    /// Path to the journal file.
    path: PathBuf,

    kind: JournalKind,

    /// Append handle.
    file: Mutex<File>,

    /// Current file size (end of the last verified frame).
    len: RwLock<u64>,

    /// Appends since the last fsync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N appends (0 and 1 both mean every append).
    sync_interval: u64,
}

impl Journal {
    /// Create a new, empty journal, replacing any existing file.
    pub fn create(path: impl AsRef<Path>, kind: JournalKind, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&kind.header())?;
        file.sync_all()?;

        Ok(Self::from_parts(path, kind, file, HEADER_SIZE, sync_interval))
    }

    /// Open an existing journal, truncating a torn or corrupt tail.
    ///
    /// A bad header is fatal; a bad frame never is.
    pub fn open(
        path: impl AsRef<Path>,
        kind: JournalKind,
        sync_interval: u64,
    ) -> Result<(Self, JournalRecovery)> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        if data.len() < HEADER_SIZE as usize {
            return Self::restore_header(path, kind, sync_interval, &data);
        }
        kind.check_header(&data[..HEADER_SIZE as usize])?;
        let (end, recovery) = scan_frames(&data);

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if let Some(truncate_to) = recovery.truncated_from {
            tracing::warn!(
                journal = kind.name,
                path = %path.display(),
                truncate_to,
                removed = recovery.truncated_bytes,
                valid_frames = recovery.frames,
                "truncating torn journal tail"
            );
            file.set_len(truncate_to)?;
            file.sync_all()?;
        }

        Ok((Self::from_parts(path, kind, file, end, sync_interval), recovery))
    }

    /// Open for reading while another process may be writing.
    ///
    /// Only the verified prefix is visible and nothing on disk is repaired.
    /// Appends through the returned handle fail.
    pub fn open_read_only(path: impl AsRef<Path>, kind: JournalKind) -> Result<(Self, JournalRecovery)> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        let file = File::open(&path)?;
        if data.len() < HEADER_SIZE as usize {
            kind.check_header_prefix(&data)?;
            let recovery = JournalRecovery {
                truncated_from: (!data.is_empty()).then_some(0),
                truncated_bytes: data.len() as u64,
                ..Default::default()
            };
            return Ok((Self::from_parts(path, kind, file, HEADER_SIZE, 1), recovery));
        }
        kind.check_header(&data[..HEADER_SIZE as usize])?;
        let (end, recovery) = scan_frames(&data);
        Ok((Self::from_parts(path, kind, file, end, 1), recovery))
    }

    /// Reset a file that ends inside its header to an empty journal.
    fn restore_header(
        path: PathBuf,
        kind: JournalKind,
        sync_interval: u64,
        existing: &[u8],
    ) -> Result<(Self, JournalRecovery)> {
        kind.check_header_prefix(existing)?;
        let found = existing.len();

        tracing::warn!(
            journal = kind.name,
            path = %path.display(),
            found,
            "journal cut inside its header, restoring empty journal"
        );
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&kind.header())?;
        file.sync_all()?;

        let recovery = JournalRecovery {
            truncated_from: (found > 0).then_some(0),
            truncated_bytes: found as u64,
            header_restored: true,
            ..Default::default()
        };
        Ok((Self::from_parts(path, kind, file, HEADER_SIZE, sync_interval), recovery))
    }

    fn from_parts(path: PathBuf, kind: JournalKind, file: File, len: u64, sync_interval: u64) -> Self {
        Self {
            path,
            kind,
            file: Mutex::new(file),
            len: RwLock::new(len),
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        }
    }

    /// Write a complete journal atomically: temp file, fsync, rename.
    pub fn write_atomic<'a>(
        path: impl AsRef<Path>,
        kind: JournalKind,
        payloads: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&kind.header())?;
            for payload in payloads {
                file.write_all(&encode_frame(payload))?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        sync_parent(path)?;
        Ok(())
    }

    /// Append one frame. Returns `(offset, end)` of the written frame.
    pub fn append(&self, payload: &[u8]) -> Result<(u64, u64)> {
        if payload.is_empty() || payload.len() > MAX_FRAME_LEN {
            return Err(StoreError::InvalidRecord(format!(
                "{} frame of {} bytes outside limits",
                self.kind.name,
                payload.len()
            )));
        }

        let frame = encode_frame(payload);
        let mut file = self.file.lock();
        let mut len = self.len.write();
        let offset = *len;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&frame)?;
        *len = offset + frame.len() as u64;

        let mut writes = self.writes_since_sync.lock();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_data()?;
            *writes = 0;
        }

        Ok((offset, *len))
    }

    /// Force pending appends to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Read the verified frame at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Vec<u8>> {
        let end = self.len();
        if offset < HEADER_SIZE || offset >= end {
            return Err(StoreError::Corruption(format!(
                "{} offset {} outside [{}, {})",
                self.kind.name, offset, HEADER_SIZE, end
            )));
        }
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(offset))?;
        read_frame(&mut reader, self.kind.name)
    }

    /// Lazily iterate frames from `offset` up to the current end.
    ///
    /// The iterator owns its own file handle, so it is unaffected by later
    /// appends and can be restarted from any offset it yielded.
    pub fn iter_from(&self, offset: u64) -> Result<FrameIter> {
        let offset = offset.max(HEADER_SIZE);
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(FrameIter {
            reader: BufReader::new(file),
            name: self.kind.name,
            offset,
            end: self.len(),
        })
    }

    /// Current size in bytes.
    pub fn len(&self) -> u64 {
        *self.len.read()
    }

    /// Whether the journal holds no frames.
    pub fn is_empty(&self) -> bool {
        self.len() <= HEADER_SIZE
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read one frame from the current position of `reader`.
fn read_frame(reader: &mut impl Read, name: &str) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(StoreError::Corruption(format!("{} frame too large", name)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&payload);
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(payload)
}

/// Iterator over `(offset, payload)` frames of a journal.
pub struct FrameIter {
    reader: BufReader<File>,
    name: &'static str,
    offset: u64,
    end: u64,
}

impl Iterator for FrameIter {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        let current = self.offset;
        match read_frame(&mut self.reader, self.name) {
            Ok(payload) => {
                self.offset += (payload.len() + FRAME_OVERHEAD) as u64;
                Some(Ok((current, payload)))
            }
            Err(e) => {
                // Stop iteration on error
                self.offset = self.end;
                Some(Err(e))
            }
        }
    }
}

/// Fsync the directory containing `path` so a rename or create is durable.
pub fn sync_parent(path: &Path) -> Result<()> {
    if cfg!(unix) {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_KIND: JournalKind = JournalKind {
        name: "test journal",
        magic: *b"TST\0",
        version: 1,
    };

    #[test]
    fn test_append_and_iterate() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::create(dir.path().join("j.bin"), TEST_KIND, 1).unwrap();

        let (first, end) = journal.append(b"one").unwrap();
        assert_eq!(first, HEADER_SIZE);
        assert_eq!(end, HEADER_SIZE + 3 + FRAME_OVERHEAD as u64);
        let (second, _) = journal.append(b"two").unwrap();

        let frames: Vec<_> = journal.iter_from(0).unwrap().map(|f| f.unwrap()).collect();
        assert_eq!(frames, vec![(first, b"one".to_vec()), (second, b"two".to_vec())]);

        // Restart from the second offset
        let tail: Vec<_> = journal.iter_from(second).unwrap().map(|f| f.unwrap().1).collect();
        assert_eq!(tail, vec![b"two".to_vec()]);
        assert_eq!(journal.read_at(second).unwrap(), b"two");
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.bin");
        {
            let journal = Journal::create(&path, TEST_KIND, 1).unwrap();
            journal.append(b"complete").unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&encode_frame(b"partial")[..6]).unwrap();
        }

        let (journal, recovery) = Journal::open(&path, TEST_KIND, 1).unwrap();
        assert_eq!(recovery.frames, 1);
        assert_eq!(recovery.truncated_from, Some(good_len));
        assert!(!recovery.corrupt_midfile);
        assert_eq!(journal.len(), good_len);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_midfile_corruption_flagged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.bin");
        {
            let journal = Journal::create(&path, TEST_KIND, 1).unwrap();
            journal.append(b"first").unwrap();
            journal.append(b"second").unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        // Flip a payload byte of the first frame
        bytes[HEADER_SIZE as usize + 4] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let (journal, recovery) = Journal::open(&path, TEST_KIND, 1).unwrap();
        assert!(recovery.corrupt_midfile);
        assert_eq!(recovery.truncated_from, Some(HEADER_SIZE));
        assert!(journal.is_empty());
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.bin");
        Journal::create(&path, TEST_KIND, 1).unwrap();

        let newer = JournalKind { version: 2, ..TEST_KIND };
        let result = Journal::open(&path, newer, 1);
        assert!(matches!(
            result,
            Err(StoreError::VersionMismatch { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.bin");
        let journal = Journal::create(&path, TEST_KIND, 1).unwrap();
        journal.append(b"old").unwrap();
        drop(journal);

        Journal::write_atomic(&path, TEST_KIND, [&b"new"[..], &b"newer"[..]]).unwrap();
        let (journal, recovery) = Journal::open(&path, TEST_KIND, 1).unwrap();
        assert_eq!(recovery.frames, 2);
        let frames: Vec<_> = journal.iter_from(0).unwrap().map(|f| f.unwrap().1).collect();
        assert_eq!(frames, vec![b"new".to_vec(), b"newer".to_vec()]);
    }

    #[test]
    fn test_cut_inside_header_reopens_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.bin");
        for cut in 0..HEADER_SIZE {
            {
                let journal = Journal::create(&path, TEST_KIND, 1).unwrap();
                journal.append(b"lost").unwrap();
            }
            OpenOptions::new().write(true).open(&path).unwrap().set_len(cut).unwrap();

            let (journal, recovery) = Journal::open(&path, TEST_KIND, 1).unwrap();
            assert!(recovery.header_restored);
            assert!(journal.is_empty());
            assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_SIZE);

            // Writable again, and the restored header survives a reopen
            journal.append(b"again").unwrap();
            drop(journal);
            let (_, recovery) = Journal::open(&path, TEST_KIND, 1).unwrap();
            assert_eq!(recovery.frames, 1);
        }
    }

    #[test]
    fn test_short_foreign_header_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.bin");
        fs::write(&path, b"XYZ").unwrap();
        assert!(matches!(
            Journal::open(&path, TEST_KIND, 1),
            Err(StoreError::InvalidFormat(_))
        ));

        // Magic intact, newer version byte, header cut short
        fs::write(&path, [b'T', b'S', b'T', 0, 2, 0]).unwrap();
        assert!(matches!(
            Journal::open(&path, TEST_KIND, 1),
            Err(StoreError::VersionMismatch { expected: 1, got: 2, .. })
        ));
    }

    #[test]
    fn test_read_only_open_leaves_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.bin");
        {
            let journal = Journal::create(&path, TEST_KIND, 1).unwrap();
            journal.append(b"complete").unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&encode_frame(b"in flight")[..6]).unwrap();
        }

        let (journal, recovery) = Journal::open_read_only(&path, TEST_KIND).unwrap();
        assert_eq!(recovery.truncated_from, Some(good_len));
        assert_eq!(journal.len(), good_len);
        assert_eq!(journal.iter_from(0).unwrap().count(), 1);
        assert!(journal.append(b"nope").is_err());

        // The writer's bytes are untouched
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len + 6);
    }
}
