//! RAII guard over a session-tied store lock.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{KvStore, LockLease, LockOptions, SessionId};
use crate::error::Result;

/// A held lock.
///
/// The lock is released and its key destroyed when the guard is dropped.
/// Prefer [`Lock::release`] so failures are observed.
pub struct Lock {
    store: Arc<dyn KvStore>,
    key: String,
    session: SessionId,
    lost: CancellationToken,
    released: bool,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("session", &self.session)
            .field("released", &self.released)
            .finish()
    }
}

impl Lock {
    /// Attempts to acquire the lock. `Ok(None)` when another holder owns it.
    pub async fn acquire(store: Arc<dyn KvStore>, opts: LockOptions) -> Result<Option<Self>> {
        let Some(lease) = store.acquire_lock(&opts).await? else {
            return Ok(None);
        };
        debug!(key = %lease.key, session = %lease.session, "lock acquired");
        Ok(Some(Self::from_lease(store, lease)))
    }

    pub fn from_lease(store: Arc<dyn KvStore>, lease: LockLease) -> Self {
        Self {
            store,
            key: lease.key,
            session: lease.session,
            lost: lease.lost,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Fires when the session backing this lock is invalidated.
    pub fn leadership(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Releases the lock, then destroys its key.
    ///
    /// Destroy failures are logged only: another holder may already have
    /// taken the key over.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release_lock(&self.key, &self.session).await?;
        if let Err(e) = self.store.destroy_lock(&self.key).await {
            debug!(key = %self.key, error = %e, "lock not destroyed");
        }
        Ok(())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Without a runtime the session outlives us; nothing else to do.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "lock dropped outside runtime, not released");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let session = self.session.clone();
        handle.spawn(async move {
            if let Err(e) = store.release_lock(&key, &session).await {
                warn!(key = %key, error = %e, "failed to release dropped lock");
                return;
            }
            let _ = store.destroy_lock(&key).await;
        });
    }
}
