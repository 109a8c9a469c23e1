//! Lease-based per-domain locking across processes.
//!
//! The lock for a domain is the `lease` field of its site document: the
//! domain is globally locked while the lease lies in the future. Within one
//! process all callers contending for a domain share a single
//! [`LockWaiter`], so only the first of them reads the remote document.
//!
//! ```text
//! try_lock ──► waiter registered? ──yes──► Waiting(existing waiter)
//!                   │ no
//!                   ▼
//!          register waiter, read site
//!                   │
//!      lease in future? ──yes──► spawn poller ──► Waiting(waiter)
//!                   │ no
//!                   ▼
//!     write lease = now + 30s ──► Acquired
//! ```
//!
//! There is no fencing token. A holder whose lease expired while it was
//! stalled can still write the site document, and concurrent acquirers
//! race at the store with the last write winning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::Document;
use crate::error::{DocumentStoreError, StorageError, StorageResult};
use crate::record::EntityKind;
use crate::store::RecordStore;

/// How long an acquired lease stays valid.
pub const LEASE_DURATION: Duration = Duration::from_secs(30);

/// How often a contended domain's lease is re-read.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shared handle released once the domain's lock becomes available.
///
/// Cloning is cheap; all clones observe the same release.
#[derive(Debug, Clone)]
pub struct LockWaiter {
    inner: Arc<WaiterInner>,
}

#[derive(Debug)]
struct WaiterInner {
    domain: String,
    released: CancellationToken,
}

impl LockWaiter {
    fn new(domain: &str) -> Self {
        Self {
            inner: Arc::new(WaiterInner {
                domain: domain.to_string(),
                released: CancellationToken::new(),
            }),
        }
    }

    /// Domain this waiter belongs to.
    pub fn domain(&self) -> &str {
        &self.inner.domain
    }

    /// Wait until the waiter is released. No timeout.
    pub async fn wait(&self) {
        self.inner.released.cancelled().await;
    }

    /// Whether the waiter has been released.
    pub fn is_released(&self) -> bool {
        self.inner.released.is_cancelled()
    }

    fn release(&self) {
        self.inner.released.cancel();
    }

    fn same_as(&self, other: &LockWaiter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Result of [`LockManager::try_lock`].
#[derive(Debug, Clone)]
pub enum LockAttempt {
    /// This caller now holds the lock.
    Acquired,
    /// The lock is held here or elsewhere; wait on the handle, then retry.
    Waiting(LockWaiter),
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }

    /// The waiter handle, if the lock was not acquired.
    pub fn waiter(&self) -> Option<&LockWaiter> {
        match self {
            Self::Acquired => None,
            Self::Waiting(waiter) => Some(waiter),
        }
    }
}

/// Remote lease state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Unlocked,
    Leased { until: DateTime<Utc> },
}

type WaiterTable = Arc<Mutex<HashMap<String, LockWaiter>>>;

/// Per-domain lock manager for one record store.
///
/// The waiter table mutex is only held for lookups, inserts and removals,
/// never across a remote call.
#[derive(Clone)]
pub struct LockManager {
    store: RecordStore,
    waiters: WaiterTable,
}

impl LockManager {
    pub fn new(store: RecordStore) -> Self {
        Self {
            store,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Try to take the lock for `domain`.
    ///
    /// Returns [`LockAttempt::Acquired`] when this call set the lease, or
    /// [`LockAttempt::Waiting`] with the domain's shared waiter when the
    /// lock is held by this process or another one. If the store cannot be
    /// read no waiter is left behind.
    pub async fn try_lock(&self, domain: &str) -> StorageResult<LockAttempt> {
        let waiter = {
            let mut waiters = self.waiters.lock();
            if let Some(existing) = waiters.get(domain) {
                debug!(domain = %domain, "Joining existing local lock waiter");
                return Ok(LockAttempt::Waiting(existing.clone()));
            }
            let waiter = LockWaiter::new(domain);
            waiters.insert(domain.to_string(), waiter.clone());
            waiter
        };

        let current = match self.store.get_site(domain).await {
            Ok(doc) => Some(doc),
            Err(DocumentStoreError::NotFound) => None,
            Err(e) => {
                self.release_waiter(domain, &waiter);
                return Err(StorageError::from_store(EntityKind::Site, domain, e));
            }
        };

        let now = Utc::now();
        if let Some(doc) = current.as_ref().filter(|doc| doc.is_leased_at(now)) {
            debug!(
                domain = %domain,
                lease_until = ?doc.lease,
                "Domain is locked, polling for lease expiry"
            );
            self.spawn_poller(domain, waiter.clone());
            return Ok(LockAttempt::Waiting(waiter));
        }

        let mut doc = current.unwrap_or_else(|| Document::new(Vec::new()));
        let until = now + lease_duration();
        doc.lease = Some(until);

        if let Err(e) = self.store.put_site(domain, doc).await {
            self.release_waiter(domain, &waiter);
            return Err(StorageError::from_store(EntityKind::Site, domain, e));
        }

        info!(domain = %domain, lease_until = %until, "Acquired domain lock");
        Ok(LockAttempt::Acquired)
    }

    /// Release the lock for `domain`.
    ///
    /// Clears a still-live remote lease and releases the local waiter. The
    /// local waiter is released even when the store cannot be reached; the
    /// remote lease then simply expires.
    pub async fn unlock(&self, domain: &str) -> StorageResult<()> {
        let Some(waiter) = self.waiters.lock().get(domain).cloned() else {
            return Err(StorageError::NoLocalLock {
                domain: domain.to_string(),
            });
        };

        let cleared = self.clear_lease(domain).await;
        self.release_waiter(domain, &waiter);

        match cleared {
            Ok(_) => {
                info!(domain = %domain, "Released domain lock");
                Ok(())
            }
            Err(e) => {
                warn!(
                    domain = %domain,
                    error = %e,
                    "Released local lock but could not clear remote lease"
                );
                Err(e)
            }
        }
    }

    /// Read the remote lease for `domain` without touching local state.
    pub async fn lease_status(&self, domain: &str) -> StorageResult<LeaseStatus> {
        match self.store.get_site(domain).await {
            Ok(doc) => Ok(match doc.lease {
                Some(until) if doc.is_leased_at(Utc::now()) => LeaseStatus::Leased { until },
                _ => LeaseStatus::Unlocked,
            }),
            Err(DocumentStoreError::NotFound) => Ok(LeaseStatus::Unlocked),
            Err(e) => Err(StorageError::from_store(EntityKind::Site, domain, e)),
        }
    }

    /// Clear a live remote lease regardless of who holds it.
    ///
    /// For operator recovery from a stuck holder. Local waiters in this
    /// process are left alone. Returns whether a live lease was cleared.
    pub async fn break_lease(&self, domain: &str) -> StorageResult<bool> {
        let cleared = self.clear_lease(domain).await?;
        if cleared {
            warn!(domain = %domain, "Forcibly cleared domain lease");
        }
        Ok(cleared)
    }

    /// Whether this process has a waiter registered for `domain`.
    pub fn is_locally_held(&self, domain: &str) -> bool {
        self.waiters.lock().contains_key(domain)
    }

    /// Reset a still-live lease to unset. Absent documents need nothing.
    async fn clear_lease(&self, domain: &str) -> StorageResult<bool> {
        let mut doc = match self.store.get_site(domain).await {
            Ok(doc) => doc,
            Err(DocumentStoreError::NotFound) => return Ok(false),
            Err(e) => return Err(StorageError::from_store(EntityKind::Site, domain, e)),
        };

        if !doc.is_leased_at(Utc::now()) {
            return Ok(false);
        }

        doc.lease = None;
        self.store
            .put_site(domain, doc)
            .await
            .map_err(|e| StorageError::from_store(EntityKind::Site, domain, e))?;
        Ok(true)
    }

    /// Unregister `waiter` and wake everyone blocked on it.
    fn release_waiter(&self, domain: &str, waiter: &LockWaiter) {
        remove_and_release(&self.waiters, domain, waiter);
    }

    /// Poll the remote lease until it lapses, then release `waiter`.
    ///
    /// The task also stops as soon as the waiter is released elsewhere.
    fn spawn_poller(&self, domain: &str, waiter: LockWaiter) {
        let store = self.store.clone();
        let waiters = Arc::clone(&self.waiters);
        let domain = domain.to_string();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = waiter.wait() => {
                        trace!(domain = %domain, "Lock waiter released, stopping poller");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                match store.get_site(&domain).await {
                    Ok(doc) if doc.is_leased_at(Utc::now()) => {
                        trace!(domain = %domain, lease_until = ?doc.lease, "Domain still locked");
                        continue;
                    }
                    Ok(_) | Err(DocumentStoreError::NotFound) => {
                        debug!(domain = %domain, "Domain lease lapsed, releasing waiters");
                    }
                    Err(e) => {
                        // Nobody to report to; stop blocking local callers.
                        warn!(domain = %domain, error = %e, "Lease poll failed, releasing waiters");
                    }
                }

                remove_and_release(&waiters, &domain, &waiter);
                return;
            }
        });
    }
}

fn remove_and_release(
    waiters: &Mutex<HashMap<String, LockWaiter>>,
    domain: &str,
    waiter: &LockWaiter,
) {
    {
        let mut table = waiters.lock();
        if table.get(domain).is_some_and(|current| current.same_as(waiter)) {
            table.remove(domain);
        }
    }
    waiter.release();
}

fn lease_duration() -> chrono::Duration {
    chrono::Duration::from_std(LEASE_DURATION).unwrap_or(chrono::Duration::seconds(30))
}
