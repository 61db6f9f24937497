//! Slot-key journal: which record key owns each counters slot.

use crate::error::{Result, StoreError};
use crate::journal::{Journal, JournalKind, JournalRecovery, HEADER_SIZE};
use crate::types::{IndexKey, SlotId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Slot-key journal file identity.
pub const KEYS_KIND: JournalKind = JournalKind {
    name: "slot-key journal",
    magic: *b"SKJ\0",
    version: 1,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SlotBinding {
    slot: SlotId,
    key: IndexKey,
}

#[derive(Default)]
struct Bindings {
    /// Key of slot `n` at position `n`.
    by_slot: Vec<IndexKey>,
    by_key: BTreeMap<IndexKey, SlotId>,
}

impl Bindings {
    fn push(&mut self, binding: SlotBinding) -> Result<()> {
        if binding.slot.0 != self.by_slot.len() as u64 {
            return Err(StoreError::Corruption(format!(
                "slot binding {} out of sequence, expected {}",
                binding.slot,
                self.by_slot.len()
            )));
        }
        self.by_key.insert(binding.key.clone(), binding.slot);
        self.by_slot.push(binding.key);
        Ok(())
    }
}

/// Append-only journal binding slot ids to record keys.
///
/// Slot `n` is bound by the `n`th frame. A binding is written and synced
/// before its slot exists, so a crash leaves at most a binding without a slot.
pub(crate) struct SlotKeys {
    journal: Journal,
    bindings: RwLock<Bindings>,
}

impl SlotKeys {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            journal: Journal::create(path, KEYS_KIND, 1)?,
            bindings: RwLock::new(Bindings::default()),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<(Self, JournalRecovery)> {
        let (journal, recovery) = Journal::open(path, KEYS_KIND, 1)?;
        let mut bindings = Bindings::default();
        for frame in journal.iter_from(HEADER_SIZE)? {
            let (_, payload) = frame?;
            bindings.push(rmp_serde::from_slice(&payload)?)?;
        }
        Ok((
            Self {
                journal,
                bindings: RwLock::new(bindings),
            },
            recovery,
        ))
    }

    /// Bindings in `path`, read without repairing anything.
    pub fn read_bindings(path: impl AsRef<Path>) -> Result<BTreeMap<IndexKey, SlotId>> {
        let (journal, _) = Journal::open_read_only(path, KEYS_KIND)?;
        let mut bindings = Bindings::default();
        for frame in journal.iter_from(HEADER_SIZE)? {
            let (_, payload) = frame?;
            bindings.push(rmp_serde::from_slice(&payload)?)?;
        }
        Ok(bindings.by_key)
    }

    /// Existing slot for `key`, or a newly journaled binding.
    ///
    /// Returns the slot and whether it was newly bound.
    pub fn bind(&self, key: &IndexKey) -> Result<(SlotId, bool)> {
        let mut bindings = self.bindings.write();
        if let Some(slot) = bindings.by_key.get(key) {
            return Ok((*slot, false));
        }
        let binding = SlotBinding {
            slot: SlotId(bindings.by_slot.len() as u64),
            key: key.clone(),
        };
        self.journal.append(&rmp_serde::to_vec(&binding)?)?;
        let slot = binding.slot;
        bindings.push(binding)?;
        Ok((slot, true))
    }

    pub fn slot_for(&self, key: &IndexKey) -> Option<SlotId> {
        self.bindings.read().by_key.get(key).copied()
    }

    pub fn key_of(&self, slot: SlotId) -> Option<IndexKey> {
        self.bindings.read().by_slot.get(slot.0 as usize).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<IndexKey, SlotId> {
        self.bindings.read().by_key.clone()
    }

    pub fn len(&self) -> u64 {
        self.bindings.read().by_slot.len() as u64
    }
}
