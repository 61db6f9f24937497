//! Generations: one self-consistent set of log, index and counters files.
//!
//! Each account directory holds any number of `gen-NNNNNN/` directories and a
//! `CURRENT` file naming the live one. Compaction writes the next generation
//! beside the live one and publishes it by atomically replacing `CURRENT`.

use crate::counters::CountersSidecar;
use crate::error::{Result, StoreError};
use crate::journal::sync_parent;
use crate::records::{EnvelopeLog, SlotIndex};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const LOG_FILE: &str = "envelopes.log";
pub const INDEX_FILE: &str = "index.jnl";
pub const COUNTERS_FILE: &str = "counters.bin";
pub const KEYS_FILE: &str = "counters.keys";
pub const CURRENT_FILE: &str = "CURRENT";

const GENERATION_PREFIX: &str = "gen-";

/// Directory name of generation `number`.
pub fn generation_dir_name(number: u64) -> String {
    format!("{}{:06}", GENERATION_PREFIX, number)
}

/// Live generation number recorded in `CURRENT`, if any.
pub fn read_current(account_dir: &Path) -> Result<Option<u64>> {
    let path = account_dir.join(CURRENT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path)?;
    text.trim()
        .strip_prefix(GENERATION_PREFIX)
        .and_then(|n| n.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| StoreError::InvalidFormat(format!("CURRENT holds {:?}", text.trim())))
}

/// Atomically point `CURRENT` at generation `number`.
pub fn write_current(account_dir: &Path, number: u64) -> Result<()> {
    let path = account_dir.join(CURRENT_FILE);
    let tmp = account_dir.join(format!("{}.tmp", CURRENT_FILE));
    {
        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{}", generation_dir_name(number))?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    sync_parent(&path)?;
    Ok(())
}

/// Remove generation directories other than `keep`, left by an interrupted
/// compaction or an unfinished removal.
pub fn remove_stale(account_dir: &Path, keep: u64) -> Result<usize> {
    let keep = generation_dir_name(keep);
    let mut removed = 0;
    for entry in fs::read_dir(account_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(GENERATION_PREFIX) && name != keep && entry.path().is_dir() {
            tracing::info!(dir = %entry.path().display(), "removing stale generation");
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Open files of one generation.
pub struct Generation {
    pub number: u64,
    pub dir: PathBuf,
    pub log: EnvelopeLog,
    pub index: SlotIndex,
    pub counters: CountersSidecar,

    /// Remove the directory once the last reader lets go.
    retired: AtomicBool,
}

impl Generation {
    pub fn new(
        number: u64,
        dir: PathBuf,
        log: EnvelopeLog,
        index: SlotIndex,
        counters: CountersSidecar,
    ) -> Self {
        Self {
            number,
            dir,
            log,
            index,
            counters,
            retired: AtomicBool::new(false),
        }
    }

    /// Create an empty generation directory under `account_dir`.
    pub fn create(account_dir: &Path, number: u64, sync_interval: u64) -> Result<Self> {
        let dir = account_dir.join(generation_dir_name(number));
        fs::create_dir_all(&dir)?;
        let log = EnvelopeLog::create(dir.join(LOG_FILE), sync_interval)?;
        let index = SlotIndex::create(dir.join(INDEX_FILE), sync_interval)?;
        let counters =
            CountersSidecar::create(dir.join(COUNTERS_FILE), dir.join(KEYS_FILE), sync_interval)?;
        sync_parent(&dir)?;
        Ok(Self::new(number, dir, log, index, counters))
    }

    /// Mark this generation for removal when dropped.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn sync(&self) -> Result<()> {
        self.log.sync()?;
        self.index.sync()?;
        self.counters.sync()
    }

    /// Bytes held by the generation's files.
    pub fn size(&self) -> u64 {
        let index = fs::metadata(self.dir.join(INDEX_FILE))
            .map(|m| m.len())
            .unwrap_or(0);
        self.log.size() + index + self.counters.size()
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if self.retired.load(Ordering::SeqCst) {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                tracing::warn!(dir = %self.dir.display(), error = %e, "failed to remove retired generation");
            }
        }
    }
}
