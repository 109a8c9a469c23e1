//! Document store backends.
//!
//! The storage layer only needs per-key get/put/delete and a keys-only
//! query ordered by modification time. No transactions or TTLs are assumed.

mod cloud;
mod memory;

pub use cloud::{CloudDatastore, DEFAULT_ENDPOINT};
pub use memory::MemoryDocumentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DocumentStoreError;
use crate::record::EntityKind;

/// Key of one document: its entity kind plus a string name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub kind: EntityKind,
    pub name: String,
}

impl DocumentKey {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Encoded record envelope. Empty for lease-only site documents.
    pub value: Vec<u8>,
    /// Last write time.
    pub modified: DateTime<Utc>,
    /// Site lock lease: locked until this instant. Always `None` for users.
    pub lease: Option<DateTime<Utc>>,
}

impl Document {
    /// Document holding `value`, stamped with the current time and no lease.
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            modified: Utc::now(),
            lease: None,
        }
    }

    /// Whether the lease is still in the future at `now`.
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some_and(|until| until > now)
    }
}

/// Keys-only query over one entity kind.
#[derive(Debug, Clone)]
pub struct KeyQuery {
    pub kind: EntityKind,
    /// Only return names starting with this prefix.
    pub name_prefix: Option<String>,
    /// Order by `modified`, most recent first.
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl KeyQuery {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            name_prefix: None,
            newest_first: false,
            limit: None,
        }
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .map_or(true, |prefix| name.starts_with(prefix))
    }
}

/// A shared document store.
///
/// Implementations must be safe for concurrent use and provide per-key
/// atomicity for each call.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, or [`DocumentStoreError::NotFound`].
    async fn get(&self, key: &DocumentKey) -> Result<Document, DocumentStoreError>;

    /// Upsert a document, fully replacing any previous one.
    async fn put(&self, key: &DocumentKey, document: Document) -> Result<(), DocumentStoreError>;

    /// Delete a document. Deleting an absent key succeeds.
    async fn delete(&self, key: &DocumentKey) -> Result<(), DocumentStoreError>;

    /// Return matching key names.
    async fn query_keys(&self, query: &KeyQuery) -> Result<Vec<String>, DocumentStoreError>;
}
