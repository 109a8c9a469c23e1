//! Storage facade consumed by the ACME client.
//!
//! [`AcmeStorage`] is the capability surface a certificate manager needs:
//! account and certificate CRUD plus per-domain mutual exclusion.
//! [`DatastoreStorage`] implements it on a shared document store so several
//! Sentinel instances can manage the same certificates without racing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::backend::{CloudDatastore, Document, DocumentStore};
use crate::codec::RecordCodec;
use crate::config::DatastoreConfig;
use crate::error::{DocumentStoreError, StorageError, StorageResult};
use crate::lock::{LeaseStatus, LockAttempt, LockManager};
use crate::record::{EntityKind, SiteData, UserData};
use crate::store::RecordStore;

/// Storage capabilities required by the certificate manager.
#[async_trait]
pub trait AcmeStorage: Send + Sync {
    /// Whether a certificate is stored for `domain`.
    async fn site_exists(&self, domain: &str) -> StorageResult<bool>;

    async fn load_site(&self, domain: &str) -> StorageResult<SiteData>;

    async fn store_site(&self, domain: &str, data: &SiteData) -> StorageResult<()>;

    async fn delete_site(&self, domain: &str) -> StorageResult<()>;

    async fn load_user(&self, email: &str) -> StorageResult<UserData>;

    async fn store_user(&self, email: &str, data: &UserData) -> StorageResult<()>;

    /// Email of the most recently stored user, or an empty string.
    ///
    /// Best effort: lookup failures are logged and reported as empty.
    async fn most_recent_user_email(&self) -> String;

    /// Try to lock `domain`; see [`LockManager::try_lock`].
    async fn try_lock(&self, domain: &str) -> StorageResult<LockAttempt>;

    /// Release a lock taken with `try_lock`.
    async fn unlock(&self, domain: &str) -> StorageResult<()>;
}

/// [`AcmeStorage`] on a shared document store with encrypted records.
#[derive(Clone)]
pub struct DatastoreStorage {
    store: RecordStore,
    codec: RecordCodec,
    locks: LockManager,
}

impl DatastoreStorage {
    /// Build a storage instance over `backend`.
    pub fn new(
        backend: Arc<dyn DocumentStore>,
        codec: RecordCodec,
        prefix: impl Into<String>,
        ca_host: impl Into<String>,
    ) -> Self {
        let store = RecordStore::new(backend, prefix, ca_host);
        Self {
            locks: LockManager::new(store.clone()),
            store,
            codec,
        }
    }

    /// Connect to Cloud Datastore as described by `config`.
    pub fn from_config(config: &DatastoreConfig) -> StorageResult<Self> {
        config.validate()?;

        let key = config.decode_key()?;
        let codec = RecordCodec::new(key.as_deref());

        let mut backend = CloudDatastore::new(config.resolved_endpoint(), &config.project_id);
        if let Some(token) = config.access_token.as_deref().filter(|t| !t.is_empty()) {
            backend = backend.with_access_token(token);
        }

        let ca_host = config.ca_host()?;
        info!(
            project_id = %config.project_id,
            prefix = %config.prefix,
            ca_host = %ca_host,
            encrypted = codec.is_encrypted(),
            "Initialized ACME datastore storage"
        );

        Ok(Self::new(Arc::new(backend), codec, config.prefix.clone(), ca_host))
    }

    pub fn record_store(&self) -> &RecordStore {
        &self.store
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Remote lease state of `domain`.
    pub async fn lease_status(&self, domain: &str) -> StorageResult<LeaseStatus> {
        self.locks.lease_status(domain).await
    }

    /// Forcibly clear the remote lease of `domain`.
    pub async fn break_lease(&self, domain: &str) -> StorageResult<bool> {
        self.locks.break_lease(domain).await
    }

    /// Fetch the site document, treating lease-only documents as absent.
    async fn site_document(&self, domain: &str) -> StorageResult<Document> {
        let doc = self
            .store
            .get_site(domain)
            .await
            .map_err(|e| StorageError::from_store(EntityKind::Site, domain, e))?;

        if doc.value.is_empty() {
            return Err(StorageError::NotFound {
                kind: EntityKind::Site,
                id: domain.to_string(),
            });
        }
        Ok(doc)
    }
}

#[async_trait]
impl AcmeStorage for DatastoreStorage {
    async fn site_exists(&self, domain: &str) -> StorageResult<bool> {
        match self.site_document(domain).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn load_site(&self, domain: &str) -> StorageResult<SiteData> {
        let doc = self.site_document(domain).await?;
        let site = self
            .codec
            .decode(&doc.value)
            .map_err(|e| StorageError::from_codec(EntityKind::Site, domain, e))?;
        debug!(domain = %domain, "Loaded site data");
        Ok(site)
    }

    async fn store_site(&self, domain: &str, data: &SiteData) -> StorageResult<()> {
        let value = self
            .codec
            .encode(data)
            .map_err(|e| StorageError::from_codec(EntityKind::Site, domain, e))?;

        // Keep whatever lease is set so a concurrent lock survives the write.
        let lease = match self.store.get_site(domain).await {
            Ok(existing) => existing.lease,
            Err(DocumentStoreError::NotFound) => None,
            Err(e) => return Err(StorageError::from_store(EntityKind::Site, domain, e)),
        };

        let mut doc = Document::new(value);
        doc.lease = lease;
        self.store
            .put_site(domain, doc)
            .await
            .map_err(|e| StorageError::from_store(EntityKind::Site, domain, e))?;

        info!(domain = %domain, "Stored site data");
        Ok(())
    }

    async fn delete_site(&self, domain: &str) -> StorageResult<()> {
        self.store
            .delete_site(domain)
            .await
            .map_err(|e| StorageError::from_store(EntityKind::Site, domain, e))?;
        info!(domain = %domain, "Deleted site data");
        Ok(())
    }

    async fn load_user(&self, email: &str) -> StorageResult<UserData> {
        let doc = self
            .store
            .get_user(email)
            .await
            .map_err(|e| StorageError::from_store(EntityKind::User, email, e))?;
        self.codec
            .decode(&doc.value)
            .map_err(|e| StorageError::from_codec(EntityKind::User, email, e))
    }

    async fn store_user(&self, email: &str, data: &UserData) -> StorageResult<()> {
        let value = self
            .codec
            .encode(data)
            .map_err(|e| StorageError::from_codec(EntityKind::User, email, e))?;
        self.store
            .put_user(email, value)
            .await
            .map_err(|e| StorageError::from_store(EntityKind::User, email, e))?;

        info!(email = %email, "Stored user data");
        Ok(())
    }

    async fn most_recent_user_email(&self) -> String {
        match self.store.most_recent_user_key().await {
            Ok(email) => email.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Unable to query most recent user");
                String::new()
            }
        }
    }

    async fn try_lock(&self, domain: &str) -> StorageResult<LockAttempt> {
        self.locks.try_lock(domain).await
    }

    async fn unlock(&self, domain: &str) -> StorageResult<()> {
        self.locks.unlock(domain).await
    }
}
