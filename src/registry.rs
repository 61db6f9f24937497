//! Open account stores under one root, and routing between them.

use crate::collab::{EngagementSource, SnapshotDecoder};
use crate::compaction::CompactionReport;
use crate::dispersion::{Resolution, RetryPass, TargetResolver};
use crate::error::{Result, StoreError};
use crate::events::{EventBus, EventFilter, SubscriptionHandle};
use crate::ingest::IngestReport;
use crate::reader::AccountReader;
use crate::store::{self, AccountStore, ResyncOutcome, StoreConfig};
use crate::types::{AccountId, CountersSlot, Envelope, IndexKey, NormalizedRecord, RecordUri, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Totals of one registry-wide retry pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: u64,
    pub delivered: u64,
    pub remaining: u64,
    pub stalled: u64,
}

impl RetrySummary {
    fn add(&mut self, pass: &RetryPass) {
        self.attempted += pass.attempted;
        self.delivered += pass.delivered;
        self.remaining += pass.remaining;
        self.stalled += pass.stalled.len() as u64;
    }
}

/// Explicitly managed set of open account stores.
///
/// Stores are opened on first use and stay open until [`close`](Self::close).
/// All stores share one [`EventBus`].
pub struct AccountRegistry {
    config: StoreConfig,
    stores: RwLock<HashMap<AccountId, Arc<AccountStore>>>,
    events: Arc<EventBus>,
}

impl AccountRegistry {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root)?;
        let events = Arc::new(EventBus::new(config.event_buffer));
        tracing::debug!(root = %config.root.display(), "account registry created");
        Ok(Self {
            config,
            stores: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Directory holding `account`'s store.
    pub fn account_dir(&self, account: &AccountId) -> PathBuf {
        store::account_dir(&self.config.root, account)
    }

    /// Open `account`, creating it if the config allows.
    pub fn open(&self, account: &AccountId) -> Result<Arc<AccountStore>> {
        self.open_with(account, self.config.clone())
    }

    /// Open `account` only if it already has a store.
    pub fn open_existing(&self, account: &AccountId) -> Result<Arc<AccountStore>> {
        let config = StoreConfig {
            create_if_missing: false,
            ..self.config.clone()
        };
        self.open_with(account, config)
    }

    fn open_with(&self, account: &AccountId, config: StoreConfig) -> Result<Arc<AccountStore>> {
        if let Some(store) = self.get(account) {
            return Ok(store);
        }

        let mut stores = self.stores.write();
        if let Some(store) = stores.get(account) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(AccountStore::open_with_events(
            account.clone(),
            config,
            Arc::clone(&self.events),
        )?);
        stores.insert(account.clone(), Arc::clone(&store));
        tracing::info!(account = %account, open = stores.len(), "account store opened");
        Ok(store)
    }

    /// Already-open store of `account`.
    pub fn get(&self, account: &AccountId) -> Option<Arc<AccountStore>> {
        self.stores.read().get(account).cloned()
    }

    /// Close `account`. Returns false if it was not open.
    ///
    /// Files stay open until the last outstanding `Arc` is dropped.
    pub fn close(&self, account: &AccountId) -> Result<bool> {
        let Some(store) = self.stores.write().remove(account) else {
            return Ok(false);
        };
        store.sync()?;
        tracing::debug!(account = %account, "account store closed");
        Ok(true)
    }

    pub fn close_all(&self) -> Result<()> {
        let stores: Vec<_> = self.stores.write().drain().collect();
        for (_, store) in stores {
            store.sync()?;
        }
        Ok(())
    }

    pub fn open_accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<_> = self.stores.read().keys().cloned().collect();
        accounts.sort();
        accounts
    }

    pub fn subscribe(&self, filter: EventFilter) -> SubscriptionHandle {
        self.events.subscribe(filter)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // --- Operations by account ---

    pub fn ingest(&self, account: &AccountId, records: Vec<NormalizedRecord>) -> Result<IngestReport> {
        self.open(account)?.ingest(records, self)
    }

    pub fn ingest_snapshot(
        &self,
        account: &AccountId,
        bytes: &[u8],
        decoder: &dyn SnapshotDecoder,
    ) -> Result<IngestReport> {
        self.open(account)?.ingest_snapshot(bytes, decoder, self)
    }

    /// Counters of `(account, key)`; `None` while nothing is known about them.
    ///
    /// A store another process is writing is read through an [`AccountReader`].
    pub fn read_counters(&self, account: &AccountId, key: &IndexKey) -> Result<Option<CountersSlot>> {
        match self.open_existing(account) {
            Ok(store) => store.read_counters(key),
            Err(StoreError::UnknownAccount(_)) => Ok(None),
            Err(StoreError::Busy(_)) => self.reader(account)?.read_counters(key),
            Err(e) => Err(e),
        }
    }

    pub fn read_record(&self, uri: &RecordUri) -> Result<Option<Envelope>> {
        match self.open_existing(&uri.account) {
            Ok(store) => store.read_record(&uri.key),
            Err(StoreError::UnknownAccount(_)) => Ok(None),
            Err(StoreError::Busy(_)) => self.reader(&uri.account)?.read_record(&uri.key),
            Err(e) => Err(e),
        }
    }

    /// Lock-free snapshot of `account`, for stores locked by another process.
    pub fn reader(&self, account: &AccountId) -> Result<AccountReader> {
        AccountReader::open(&self.config.root, account)
    }

    pub fn resync_counters(&self, uri: &RecordUri, source: &dyn EngagementSource) -> Result<ResyncOutcome> {
        self.open(&uri.account)?.resync_counters(&uri.key, source)
    }

    pub fn compact(&self, account: &AccountId, abort: Option<&AtomicBool>) -> Result<CompactionReport> {
        self.open_existing(account)?.compact(abort)
    }

    /// Retry every open store's pending dispersion ops that are due at `now`.
    ///
    /// A store that fails its pass is logged and skipped.
    pub fn retry_pending(&self, now: Timestamp) -> RetrySummary {
        let stores: Vec<_> = self.stores.read().values().cloned().collect();
        let mut summary = RetrySummary::default();
        for store in stores {
            if store.pending().is_empty() {
                continue;
            }
            match store.retry_pending(self, now) {
                Ok(pass) => summary.add(&pass),
                Err(e) => {
                    tracing::warn!(account = %store.account(), error = %e, "pending dispersion retry failed");
                }
            }
        }
        summary
    }
}

impl TargetResolver for AccountRegistry {
    fn resolve(&self, account: &AccountId) -> Result<Resolution> {
        if let Some(store) = self.get(account) {
            return Ok(Resolution::Ready(store));
        }
        if !store::store_exists(&self.config.root, account) {
            return Ok(Resolution::Unknown);
        }
        match self.open_existing(account) {
            Ok(store) => Ok(Resolution::Ready(store)),
            Err(StoreError::Busy(_)) => Ok(Resolution::Busy),
            Err(StoreError::UnknownAccount(_)) => Ok(Resolution::Unknown),
            Err(e) => Err(e),
        }
    }
}

impl Drop for AccountRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            tracing::warn!(error = %e, "failed to sync account stores on shutdown");
        }
    }
}
