//! Envelope log and slot index.
//!
//! Envelopes are stored in an append-only log; the slot index maps each
//! record key to its current envelope and counters slot.

pub mod codec;
mod index;
mod log;

pub use index::{IndexEntry, IndexLoad, SlotIndex, INDEX_KIND};
pub use log::{EnvelopeLog, EnvelopeScan, LoggedEnvelope, LoggedEnvelopes, LOG_KIND};
