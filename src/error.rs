//! Error types for the engagement ledger.

use crate::types::{AccountId, SlotId};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is busy: another writer holds {0}")]
    Busy(AccountId),

    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported {file} version: expected {expected}, got {got}")]
    VersionMismatch {
        file: &'static str,
        expected: u8,
        got: u8,
    },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid record URI: {0}")]
    InvalidUri(String),

    #[error("Counters slot out of range: {0}")]
    SlotOutOfRange(SlotId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Operation aborted before publish")]
    Aborted,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
