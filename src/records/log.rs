//! Append-only envelope log.

use super::codec::{decode_envelope, encode_envelope};
use crate::error::Result;
use crate::journal::{FrameIter, Journal, JournalKind, JournalRecovery, FRAME_OVERHEAD, HEADER_SIZE};
use crate::types::Envelope;
use std::path::Path;

/// Envelope log file identity.
pub const LOG_KIND: JournalKind = JournalKind {
    name: "envelope log",
    magic: *b"ENV\0",
    version: 1,
};

/// A decoded envelope with its position in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggedEnvelope {
    pub offset: u64,
    /// Offset just past this envelope's frame.
    pub end: u64,
    pub envelope: Envelope,
}

/// Append-only log of immutable envelopes.
///
/// Existing bytes are never modified or relocated; a correction is a new
/// trailing envelope for the same key.
pub struct EnvelopeLog {
    journal: Journal,
}

impl EnvelopeLog {
    /// Create an empty log.
    pub fn create(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        Ok(Self {
            journal: Journal::create(path, LOG_KIND, sync_interval)?,
        })
    }

    /// Open an existing log, truncating a torn trailing message.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, JournalRecovery)> {
        let (journal, recovery) = Journal::open(path, LOG_KIND, sync_interval)?;
        Ok((Self { journal }, recovery))
    }

    /// Open for reading alongside a writer in another process.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let (journal, _) = Journal::open_read_only(path, LOG_KIND)?;
        Ok(Self { journal })
    }

    /// Append an envelope, returning `(offset, end)`.
    pub fn append(&self, envelope: &Envelope) -> Result<(u64, u64)> {
        let payload = encode_envelope(envelope)?;
        self.journal.append(&payload)
    }

    /// Read the envelope at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Envelope> {
        decode_envelope(&self.journal.read_at(offset)?)
    }

    /// Lazily scan envelopes from `offset` to the end observed now.
    pub fn scan(&self, offset: u64) -> Result<EnvelopeScan> {
        Ok(EnvelopeScan {
            frames: self.journal.iter_from(offset)?,
        })
    }

    /// Replay envelopes from `offset` with their frame bounds.
    pub fn envelopes(&self, offset: u64) -> Result<LoggedEnvelopes> {
        Ok(LoggedEnvelopes {
            frames: self.journal.iter_from(offset)?,
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.journal.sync()
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        self.journal.len()
    }

    /// Offset of the first envelope.
    pub fn start(&self) -> u64 {
        HEADER_SIZE
    }

    pub fn path(&self) -> &Path {
        self.journal.path()
    }
}

/// Restartable scan over `(offset, envelope)` pairs.
pub struct EnvelopeScan {
    frames: FrameIter,
}

impl Iterator for EnvelopeScan {
    type Item = Result<(u64, Envelope)>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.frames.next()?;
        Some(frame.and_then(|(offset, payload)| Ok((offset, decode_envelope(&payload)?))))
    }
}

/// Replay over [`LoggedEnvelope`]s.
pub struct LoggedEnvelopes {
    frames: FrameIter,
}

impl Iterator for LoggedEnvelopes {
    type Item = Result<LoggedEnvelope>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.frames.next()?;
        Some(frame.and_then(|(offset, payload)| {
            Ok(LoggedEnvelope {
                offset,
                end: offset + (payload.len() + FRAME_OVERHEAD) as u64,
                envelope: decode_envelope(&payload)?,
            })
        }))
    }
}
