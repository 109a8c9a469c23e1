//! In-memory document store.
//!
//! Process-local stand-in for the shared datastore. Several storage
//! instances holding the same `Arc<MemoryDocumentStore>` behave like
//! independent processes sharing one remote store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{Document, DocumentKey, DocumentStore, KeyQuery};
use crate::error::DocumentStoreError;

#[derive(Debug, Clone)]
struct StoredEntry {
    document: Document,
    /// Write sequence, breaks ties between equal `modified` stamps.
    seq: u64,
}

/// In-memory document store with outage simulation.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<DocumentKey, StoredEntry>,
    next_seq: AtomicU64,
    offline: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `Unavailable` until set back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of stored documents across all kinds.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn check_online(&self) -> Result<(), DocumentStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DocumentStoreError::Unavailable(
                "memory store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, key: &DocumentKey) -> Result<Document, DocumentStoreError> {
        self.check_online()?;
        self.documents
            .get(key)
            .map(|entry| entry.document.clone())
            .ok_or(DocumentStoreError::NotFound)
    }

    async fn put(&self, key: &DocumentKey, document: Document) -> Result<(), DocumentStoreError> {
        self.check_online()?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        trace!(kind = %key.kind, name = %key.name, seq, "Memory store put");
        self.documents.insert(key.clone(), StoredEntry { document, seq });
        Ok(())
    }

    async fn delete(&self, key: &DocumentKey) -> Result<(), DocumentStoreError> {
        self.check_online()?;
        self.documents.remove(key);
        Ok(())
    }

    async fn query_keys(&self, query: &KeyQuery) -> Result<Vec<String>, DocumentStoreError> {
        self.check_online()?;

        let mut matches: Vec<(String, StoredEntry)> = self
            .documents
            .iter()
            .filter(|entry| entry.key().kind == query.kind && query.matches(&entry.key().name))
            .map(|entry| (entry.key().name.clone(), entry.value().clone()))
            .collect();

        if query.newest_first {
            matches.sort_by(|(_, a), (_, b)| {
                b.document
                    .modified
                    .cmp(&a.document.modified)
                    .then(b.seq.cmp(&a.seq))
            });
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matches.into_iter().take(limit).map(|(name, _)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EntityKind;

    fn user_key(name: &str) -> DocumentKey {
        DocumentKey::new(EntityKind::User, name)
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryDocumentStore::new();
        assert_eq!(
            store.get(&user_key("nobody")).await.unwrap_err(),
            DocumentStoreError::NotFound
        );
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = MemoryDocumentStore::new();
        store.put(&user_key("a"), Document::new(b"one".to_vec())).await.unwrap();
        store.put(&user_key("a"), Document::new(b"two".to_vec())).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&user_key("a")).await.unwrap().value, b"two");
    }

    #[tokio::test]
    async fn test_kinds_are_separate() {
        let store = MemoryDocumentStore::new();
        store.put(&user_key("x"), Document::new(Vec::new())).await.unwrap();

        let site = DocumentKey::new(EntityKind::Site, "x");
        assert!(store.get(&site).await.is_err());
        store.delete(&site).await.unwrap();
        assert!(store.get(&user_key("x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_newest_first_with_prefix() {
        let store = MemoryDocumentStore::new();
        let doc = Document::new(Vec::new());
        // Identical timestamps: write order decides.
        store.put(&user_key("p/users/a"), doc.clone()).await.unwrap();
        store.put(&user_key("q/users/b"), doc.clone()).await.unwrap();
        store.put(&user_key("p/users/c"), doc).await.unwrap();

        let query = KeyQuery::new(EntityKind::User)
            .with_name_prefix("p/")
            .newest_first()
            .with_limit(1);
        assert_eq!(store.query_keys(&query).await.unwrap(), vec!["p/users/c"]);

        let all = KeyQuery::new(EntityKind::User).newest_first();
        assert_eq!(
            store.query_keys(&all).await.unwrap(),
            vec!["p/users/c", "q/users/b", "p/users/a"]
        );
    }

    #[tokio::test]
    async fn test_offline() {
        let store = MemoryDocumentStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.get(&user_key("a")).await,
            Err(DocumentStoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert_eq!(
            store.get(&user_key("a")).await.unwrap_err(),
            DocumentStoreError::NotFound
        );
    }
}
