//! Cross-account counter propagation.
//!
//! Likes, reposts, replies and quotes increment a counter that lives in the
//! store of the *subject's* owner. Ingest derives a [`DispersionOp`] for each
//! such effect; the router applies it to the owning store or parks it in the
//! source store's pending queue until that store becomes reachable.

mod applied;
mod queue;
mod router;

pub use applied::{AppliedOps, APPLIED_KIND};
pub use queue::{PendingEntry, PendingQueue, RetryPass, RetryPolicy, QUEUE_KIND};
pub use router::{deliver, route, Delivery, Resolution, RouteOutcome, TargetResolver, Unresolved};

use crate::types::{is_post_collection, sha256_hex, AccountId, Counter, Envelope, IndexKey, RecordBody, RecordUri};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of engagement an op carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Like,
    Repost,
    Reply,
    Quote,
}

impl OpKind {
    /// Counter incremented in the subject's slot.
    pub fn counter(self) -> Counter {
        match self {
            OpKind::Like => Counter::Like,
            OpKind::Repost => Counter::Repost,
            OpKind::Reply => Counter::Reply,
            OpKind::Quote => Counter::Quote,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Like => "like",
            OpKind::Repost => "repost",
            OpKind::Reply => "reply",
            OpKind::Quote => "quote",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A counter increment owed to the store owning `subject`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispersionOp {
    pub kind: OpKind,
    /// Account whose record caused the increment.
    pub actor: AccountId,
    pub subject: RecordUri,
    /// Key of the originating record in the actor's store.
    pub source_key: IndexKey,
}

impl DispersionOp {
    /// Account whose store holds the counter.
    pub fn target(&self) -> &AccountId {
        &self.subject.account
    }

    /// Stable dedup key over (kind, actor, subject, source key).
    pub fn idempotency_key(&self) -> String {
        let material = format!(
            "{}\0{}\0{}\0{}",
            self.kind, self.actor, self.subject, self.source_key
        );
        sha256_hex(material.as_bytes())
    }
}

/// Ops implied by one envelope. Tombstones imply none.
pub fn derive_ops(envelope: &Envelope) -> Vec<DispersionOp> {
    if envelope.deleted {
        return Vec::new();
    }

    let op = |kind: OpKind, subject: RecordUri| DispersionOp {
        kind,
        actor: envelope.owner.clone(),
        subject,
        source_key: envelope.key.clone(),
    };

    match &envelope.body {
        RecordBody::Like(like) => RecordUri::parse(&like.subject)
            .map(|subject| vec![op(OpKind::Like, subject)])
            .unwrap_or_default(),
        RecordBody::Repost(repost) => RecordUri::parse(&repost.subject)
            .map(|subject| vec![op(OpKind::Repost, subject)])
            .unwrap_or_default(),
        RecordBody::Post(post) => {
            let mut ops = Vec::new();
            let parent = post
                .reply_parent
                .as_deref()
                .and_then(|parent| RecordUri::parse(parent).ok());
            if let Some(parent) = &parent {
                ops.push(op(OpKind::Reply, parent.clone()));
            }

            for link in &post.links {
                let Ok(quoted) = RecordUri::parse(link) else {
                    continue;
                };
                if !is_post_collection(&quoted.key.collection) || parent.as_ref() == Some(&quoted) {
                    continue;
                }
                if !ops.iter().any(|o| o.kind == OpKind::Quote && o.subject == quoted) {
                    ops.push(op(OpKind::Quote, quoted));
                }
            }
            ops
        }
        _ => Vec::new(),
    }
}
