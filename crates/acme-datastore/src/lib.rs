//! Shared ACME certificate storage for Sentinel on Google Cloud Datastore.
//!
//! Several Sentinel instances issuing certificates from the same CA can
//! share account and certificate data through one datastore project. The
//! crate provides:
//!
//! - [`RecordCodec`] - JSON record envelopes, sealed with AES-256-GCM when a
//!   key is configured
//! - [`RecordStore`] - records namespaced by key prefix and CA host
//! - [`LockManager`] - per-domain locks built on a lease timestamp stored
//!   in the site document, with same-process callers coalesced behind one
//!   [`LockWaiter`]
//! - [`DatastoreStorage`] - the [`AcmeStorage`] facade tying them together
//!
//! # Example
//!
//! ```rust,ignore
//! let storage = DatastoreStorage::from_config(&DatastoreConfig::from_env())?;
//!
//! match storage.try_lock("example.com").await? {
//!     LockAttempt::Acquired => {
//!         // obtain or renew the certificate, then:
//!         storage.store_site("example.com", &site).await?;
//!         storage.unlock("example.com").await?;
//!     }
//!     LockAttempt::Waiting(waiter) => {
//!         waiter.wait().await;
//!         // another instance finished; reload from storage
//!     }
//! }
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod record;
pub mod storage;
pub mod store;

pub use backend::{CloudDatastore, DocumentStore, MemoryDocumentStore};
pub use codec::RecordCodec;
pub use config::DatastoreConfig;
pub use error::{StorageError, StorageResult};
pub use lock::{LeaseStatus, LockAttempt, LockManager, LockWaiter};
pub use record::{EntityKind, SiteData, UserData};
pub use storage::{AcmeStorage, DatastoreStorage};
pub use store::RecordStore;
