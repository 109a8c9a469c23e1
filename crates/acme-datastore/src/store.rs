//! Namespaced record store on top of a [`DocumentStore`].
//!
//! Logical keys are `prefix/caHost/{users|sites}/{identifier}` so several
//! CAs (staging, production) and deployments can share one project.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{Document, DocumentKey, DocumentStore, KeyQuery};
use crate::error::DocumentStoreError;
use crate::record::EntityKind;

/// Record store scoped to one prefix and CA host.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn DocumentStore>,
    prefix: String,
    ca_host: String,
}

impl RecordStore {
    pub fn new(
        backend: Arc<dyn DocumentStore>,
        prefix: impl Into<String>,
        ca_host: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            ca_host: ca_host.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ca_host(&self) -> &str {
        &self.ca_host
    }

    /// Key-name prefix shared by all records of `kind` in this namespace.
    pub fn namespace(&self, kind: EntityKind) -> String {
        join_segments(&[&self.prefix, &self.ca_host, kind.key_segment(), ""])
    }

    /// Full logical key for one record.
    pub fn key_name(&self, kind: EntityKind, id: &str) -> String {
        join_segments(&[&self.prefix, &self.ca_host, kind.key_segment(), id])
    }

    fn document_key(&self, kind: EntityKind, id: &str) -> DocumentKey {
        DocumentKey::new(kind, self.key_name(kind, id))
    }

    // =========================================================================
    // Sites
    // =========================================================================

    pub async fn get_site(&self, domain: &str) -> Result<Document, DocumentStoreError> {
        let doc = self.backend.get(&self.document_key(EntityKind::Site, domain)).await?;
        trace!(domain = %domain, lease = ?doc.lease, "Fetched site document");
        Ok(doc)
    }

    /// Upsert a site document exactly as given, lease included.
    ///
    /// Callers that are not changing the lock must pass the lease they read.
    pub async fn put_site(
        &self,
        domain: &str,
        mut document: Document,
    ) -> Result<(), DocumentStoreError> {
        document.modified = chrono::Utc::now();
        self.backend
            .put(&self.document_key(EntityKind::Site, domain), document)
            .await
    }

    /// Delete a site document, reporting `NotFound` when it was absent.
    pub async fn delete_site(&self, domain: &str) -> Result<(), DocumentStoreError> {
        let key = self.document_key(EntityKind::Site, domain);
        self.backend.get(&key).await?;
        self.backend.delete(&key).await?;
        debug!(domain = %domain, "Deleted site document");
        Ok(())
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn get_user(&self, email: &str) -> Result<Document, DocumentStoreError> {
        self.backend.get(&self.document_key(EntityKind::User, email)).await
    }

    /// Upsert a user document, stamping the modification time.
    pub async fn put_user(&self, email: &str, value: Vec<u8>) -> Result<(), DocumentStoreError> {
        self.backend
            .put(&self.document_key(EntityKind::User, email), Document::new(value))
            .await
    }

    /// Identifier of the most recently written user, if any.
    pub async fn most_recent_user_key(&self) -> Result<Option<String>, DocumentStoreError> {
        let namespace = self.namespace(EntityKind::User);
        let query = KeyQuery::new(EntityKind::User)
            .with_name_prefix(namespace.clone())
            .newest_first()
            .with_limit(1);

        let names = self.backend.query_keys(&query).await?;
        Ok(names
            .into_iter()
            .next()
            .and_then(|name| name.strip_prefix(&namespace).map(str::to_string)))
    }
}

/// Join key segments with `/`, skipping empty leading segments and
/// collapsing duplicate separators.
fn join_segments(segments: &[&str]) -> String {
    let trailing = segments.last().is_some_and(|s| s.is_empty());
    let mut joined = segments
        .iter()
        .flat_map(|s| s.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if trailing {
        joined.push('/');
    }
    joined
}
