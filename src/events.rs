//! Operator-visible store events.
//!
//! Subscribers receive events over bounded channels. A subscriber whose
//! buffer is full is dropped rather than slowing down the store.
//!
//! # Example
//!
//! ```ignore
//! let handle = registry.subscribe(EventFilter::all());
//! while let Ok(event) = handle.recv() {
//!     if let StoreEvent::DispersionStalled { target, .. } = event {
//!         eprintln!("waiting on {}", target);
//!     }
//! }
//! ```

use crate::types::AccountId;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Events emitted by account stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// An ingest batch completed.
    IngestFinished {
        account: AccountId,
        accepted: u64,
        deduplicated: u64,
        failed: u64,
    },

    /// The slot index was rebuilt from the log.
    IndexRebuilt {
        account: AccountId,
        reason: String,
        entries: usize,
    },

    /// A torn or corrupt tail was cut from a file.
    LogTruncated {
        account: AccountId,
        file: String,
        offset: u64,
        removed: u64,
    },

    /// A compacted generation became current.
    CompactionPublished {
        account: AccountId,
        generation: u64,
        bytes_before: u64,
        bytes_after: u64,
    },

    /// A queued op is still undelivered past the warn horizon.
    DispersionStalled {
        source: AccountId,
        target: AccountId,
        kind: String,
        subject: String,
        age_ms: i64,
    },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl StoreEvent {
    /// Account the event concerns, if any.
    pub fn account(&self) -> Option<&AccountId> {
        match self {
            StoreEvent::IngestFinished { account, .. }
            | StoreEvent::IndexRebuilt { account, .. }
            | StoreEvent::LogTruncated { account, .. }
            | StoreEvent::CompactionPublished { account, .. } => Some(account),
            StoreEvent::DispersionStalled { source, .. } => Some(source),
            StoreEvent::Dropped { .. } => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Which events a subscriber wants.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only events about these accounts (None = all).
    pub accounts: Option<Vec<AccountId>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn accounts(accounts: Vec<AccountId>) -> Self {
        Self {
            accounts: Some(accounts),
        }
    }

    fn matches(&self, event: &StoreEvent) -> bool {
        match (&self.accounts, event.account()) {
            (Some(accounts), Some(account)) => accounts.contains(account),
            _ => true,
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to receive events.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub receiver: Receiver<StoreEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StoreEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StoreEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StoreEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

struct Subscription {
    filter: EventFilter,
    sender: Sender<StoreEvent>,
}

/// Fan-out of store events to subscribers.
pub struct EventBus {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);
        self.subscriptions
            .write()
            .insert(id, Subscription { filter, sender });
        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            let _ = sub.sender.try_send(StoreEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Deliver `event` to matching subscribers, dropping any that cannot keep up.
    pub fn publish(&self, event: StoreEvent) {
        let mut to_remove = Vec::new();
        {
            let subs = self.subscriptions.read();
            if subs.is_empty() {
                return;
            }
            for (id, sub) in subs.iter() {
                if !sub.filter.matches(&event) {
                    continue;
                }
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        to_remove.push(*id)
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    // Might fail, that's ok
                    let _ = sub.sender.try_send(StoreEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
