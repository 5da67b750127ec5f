//! Coordination store abstraction.
//!
//! The coordination store is the only cross-process synchronization
//! primitive: a versioned key/value store with prefix listing, blocking
//! reads keyed on a modify index, and session-tied advisory locks.
//!
//! ## Design Principles
//!
//! - **Single-key operations**: no multi-key transactions are assumed
//! - **Blocking queries**: a read with a `wait_index` returns once the index
//!   for the watched key or prefix moves past it, or when `wait_time` elapses
//! - **Session-tied locks**: a lock holder keeps ownership while its session
//!   lives; session invalidation fires the lease's `lost` token

pub mod lock;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use lock::Lock;
pub use memory::MemoryStore;

/// Default bound for blocking queries when the caller sets no wait time.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(300);

/// A stored key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Store index of the last write to this key.
    pub modify_index: u64,
}

impl KvPair {
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Options for blocking reads.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Block until the index moves past this value. Zero means no blocking.
    pub wait_index: u64,
    /// Upper bound for the blocking wait.
    pub wait_time: Option<Duration>,
}

impl QueryOptions {
    pub fn blocking(wait_index: u64, wait_time: Duration) -> Self {
        Self {
            wait_index,
            wait_time: Some(wait_time),
        }
    }
}

/// Metadata returned with every blocking-capable read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryMeta {
    /// Watermark to pass as `wait_index` on the next call.
    pub last_index: u64,
}

/// Identifier of a liveness session owning locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lock acquisition options.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub key: String,
    /// Stored as the lock key's value (holder identity).
    pub value: Vec<u8>,
    /// Give up after `wait_time` instead of blocking until acquired.
    pub try_once: bool,
    pub wait_time: Duration,
}

impl LockOptions {
    /// Block until the lock is acquired.
    pub fn blocking(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            try_once: false,
            wait_time: Duration::ZERO,
        }
    }

    /// Single bounded acquisition attempt.
    pub fn try_once(key: impl Into<String>, value: impl Into<Vec<u8>>, wait_time: Duration) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            try_once: true,
            wait_time,
        }
    }
}

/// A granted lock: the owning session and its leadership signal.
#[derive(Debug, Clone)]
pub struct LockLease {
    pub key: String,
    pub session: SessionId,
    /// Cancelled when the session is invalidated while the lock is held.
    pub lost: CancellationToken,
}

/// Storage abstraction for coordination state.
///
/// All methods are `Send + Sync` so a single store handle can be shared by
/// the dispatcher, every worker and every workflow step.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Gets a key. Returns `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<KvPair>>;

    /// Blocking single-key read.
    async fn get_blocking(&self, key: &str, opts: &QueryOptions)
        -> Result<(Option<KvPair>, QueryMeta)>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Deletes every key starting with `prefix`.
    async fn delete_tree(&self, prefix: &str) -> Result<()>;

    /// Lists every pair whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Lists keys under `prefix`. With a separator, keys are truncated after
    /// the first separator following the prefix and deduplicated.
    async fn keys(
        &self,
        prefix: &str,
        separator: Option<char>,
        opts: &QueryOptions,
    ) -> Result<(Vec<String>, QueryMeta)>;

    /// Acquires a session-tied lock. `Ok(None)` means another holder owns it.
    async fn acquire_lock(&self, opts: &LockOptions) -> Result<Option<LockLease>>;

    /// Releases a lock held by `session`. Releasing a lock owned by another
    /// session is a no-op.
    async fn release_lock(&self, key: &str, session: &SessionId) -> Result<()>;

    /// Removes a lock key once it is no longer held.
    async fn destroy_lock(&self, key: &str) -> Result<()>;
}
