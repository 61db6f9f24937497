//! Interfaces the store consumes from the surrounding client.

use crate::error::Result;
use crate::types::{AuthoritativeCounts, NormalizedRecord, RecordUri, Timestamp, ViewerFlags};

/// Turns a raw incremental repository snapshot into normalized records.
pub trait SnapshotDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<NormalizedRecord>>;
}

/// Authoritative engagement data for one record, as reported remotely.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngagementSnapshot {
    pub counts: AuthoritativeCounts,
    pub viewer: ViewerFlags,
    /// When the remote service observed the counts.
    pub observed_at: Timestamp,
}

/// Remote source of aggregate counts and viewer flags.
pub trait EngagementSource {
    fn fetch_authoritative_counts(&self, uri: &RecordUri) -> Result<EngagementSnapshot>;
}

impl<F> SnapshotDecoder for F
where
    F: Fn(&[u8]) -> Result<Vec<NormalizedRecord>>,
{
    fn decode(&self, bytes: &[u8]) -> Result<Vec<NormalizedRecord>> {
        self(bytes)
    }
}
