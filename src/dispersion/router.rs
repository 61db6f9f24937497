//! Delivery of dispersion ops to the owning store.

use super::DispersionOp;
use crate::error::Result;
use crate::store::AccountStore;
use crate::types::{AccountId, Timestamp};
use std::sync::Arc;

/// Whether a target store can take an op right now.
pub enum Resolution {
    Ready(Arc<AccountStore>),
    /// Not known locally yet.
    Unknown,
    /// Known, but another writer holds it.
    Busy,
}

/// Looks up the store owning an account.
pub trait TargetResolver {
    fn resolve(&self, account: &AccountId) -> Result<Resolution>;
}

/// Resolver for a store used on its own: every foreign account is unknown.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unresolved;

impl TargetResolver for Unresolved {
    fn resolve(&self, _account: &AccountId) -> Result<Resolution> {
        Ok(Resolution::Unknown)
    }
}

/// What happened to a single op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    /// Already applied earlier; nothing changed.
    Duplicate,
    /// Target unreachable.
    Deferred,
}

/// Apply `op` to its target, which may be `source` itself.
pub fn deliver(source: &AccountStore, op: &DispersionOp, resolver: &dyn TargetResolver) -> Result<Delivery> {
    let applied = if op.target() == source.account() {
        source.apply_dispersion(op)?
    } else {
        match resolver.resolve(op.target())? {
            Resolution::Ready(target) => target.apply_dispersion(op)?,
            Resolution::Unknown | Resolution::Busy => return Ok(Delivery::Deferred),
        }
    };
    Ok(if applied {
        Delivery::Applied
    } else {
        Delivery::Duplicate
    })
}

/// Totals for one routed batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    pub dispersed: u64,
    pub duplicates: u64,
    pub queued: u64,
}

/// Deliver `ops` produced by `source`, queueing whatever cannot be delivered.
///
/// Must be called without holding `source`'s writer lock. Never fails: a
/// dispersion problem is not an ingest problem.
pub fn route(
    source: &AccountStore,
    ops: Vec<DispersionOp>,
    resolver: &dyn TargetResolver,
    now: Timestamp,
) -> RouteOutcome {
    let mut outcome = RouteOutcome::default();
    let mut deferred = Vec::new();

    for op in ops {
        match deliver(source, &op, resolver) {
            Ok(Delivery::Applied) => outcome.dispersed += 1,
            Ok(Delivery::Duplicate) => outcome.duplicates += 1,
            Ok(Delivery::Deferred) => deferred.push(op),
            Err(e) => {
                tracing::warn!(
                    source = %source.account(),
                    target = %op.target(),
                    kind = %op.kind,
                    error = %e,
                    "dispersion failed, queueing"
                );
                deferred.push(op);
            }
        }
    }

    if !deferred.is_empty() {
        let count = deferred.len() as u64;
        match source.pending().push_all(deferred, now) {
            Ok(_) => outcome.queued = count,
            Err(e) => {
                tracing::warn!(
                    source = %source.account(),
                    ops = count,
                    error = %e,
                    "could not persist pending dispersion ops"
                );
            }
        }
    }

    outcome
}
