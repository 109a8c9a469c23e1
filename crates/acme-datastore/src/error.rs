//! Error types for ACME datastore storage.

use thiserror::Error;

use crate::record::EntityKind;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced to callers of the storage facade and lock manager.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Requested user or site document does not exist.
    #[error("{kind} record not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Stored bytes are not a valid envelope or record payload.
    #[error("invalid {kind} record for {id}: {reason}")]
    Format {
        kind: EntityKind,
        id: String,
        reason: String,
    },

    /// Authentication of an encrypted envelope failed.
    #[error("unable to decrypt {kind} record for {id}")]
    Decryption { kind: EntityKind, id: String },

    /// The document store could not be reached or answered unexpectedly.
    #[error("document store unavailable for {kind} record {id}: {reason}")]
    StoreUnavailable {
        kind: EntityKind,
        id: String,
        reason: String,
    },

    /// `unlock` called for a domain this process holds no lock on.
    #[error("no local lock to release for {domain}")]
    NoLocalLock { domain: String },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Attach operation context to a document store error.
    pub fn from_store(kind: EntityKind, id: &str, err: DocumentStoreError) -> Self {
        match err {
            DocumentStoreError::NotFound => Self::NotFound {
                kind,
                id: id.to_string(),
            },
            DocumentStoreError::Unavailable(reason) => Self::StoreUnavailable {
                kind,
                id: id.to_string(),
                reason,
            },
        }
    }

    /// Attach operation context to a codec error.
    pub fn from_codec(kind: EntityKind, id: &str, err: CodecError) -> Self {
        match err {
            CodecError::Decryption => Self::Decryption {
                kind,
                id: id.to_string(),
            },
            CodecError::Format(reason) => Self::Format {
                kind,
                id: id.to_string(),
                reason,
            },
        }
    }

    /// Whether this error means the document is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors produced while encoding or decoding record envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Authentication tag mismatch: wrong key or tampered bytes.
    #[error("decryption failure")]
    Decryption,

    /// Missing envelope prefix or unparseable payload.
    #[error("invalid data format: {0}")]
    Format(String),
}

/// Errors reported by a document store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentStoreError {
    /// No document under the requested key.
    #[error("no such document")]
    NotFound,

    /// Transport failure or unexpected response.
    #[error("{0}")]
    Unavailable(String),
}
