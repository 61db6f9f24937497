//! Engagement counters sidecar.
//!
//! Counters live in a dense array of fixed 56-byte slots updated in place,
//! next to a journal recording which record key owns each slot.

mod keys;
mod sidecar;

pub use keys::KEYS_KIND;
pub(crate) use keys::SlotKeys;
pub use sidecar::{slot_offset, CountersReader, CountersSidecar, SidecarRecovery, COUNTERS_HEADER_SIZE};
