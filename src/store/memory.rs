//! In-memory coordination store.
//!
//! This module provides [`MemoryStore`], a complete in-process
//! implementation of the [`KvStore`] trait: versioned keys, blocking
//! queries and session-tied locks. Several orchestrator "instances" in the
//! same process share one store through an `Arc` and coordinate exactly as
//! they would through a networked store.
//!
//! ## Limitations
//!
//! - **No persistence**: All state is lost when the process exits
//! - **Single-process only**: State is not shared across process boundaries
//! - **No session TTL**: sessions end on release or explicit invalidation

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    KvPair, KvStore, LockLease, LockOptions, QueryMeta, QueryOptions, SessionId, DEFAULT_WAIT_TIME,
};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    modify_index: u64,
    session: Option<SessionId>,
}

#[derive(Debug)]
struct State {
    /// Last index handed out. Starts at 1 so that a reported watermark is
    /// never zero and always below the index of the next write.
    index: u64,
    entries: BTreeMap<String, Entry>,
    /// Index at which each deleted key was removed, so blocking queries wake
    /// on deletions too.
    tombstones: BTreeMap<String, u64>,
    sessions: HashMap<SessionId, CancellationToken>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            index: 1,
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            sessions: HashMap::new(),
        }
    }
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn write(&mut self, key: &str, value: Vec<u8>, session: Option<SessionId>) -> u64 {
        let index = self.bump();
        self.tombstones.remove(key);
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                modify_index: index,
                session,
            },
        );
        index
    }

    fn remove_all(&mut self, keys: &[String]) -> Option<u64> {
        if keys.is_empty() {
            return None;
        }
        let index = self.bump();
        for key in keys {
            if self.entries.remove(key).is_some() {
                self.tombstones.insert(key.clone(), index);
            }
        }
        Some(index)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn prefix_index(&self, prefix: &str) -> u64 {
        let live = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.modify_index)
            .max()
            .unwrap_or(0);
        let dead = self
            .tombstones
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, i)| *i)
            .max()
            .unwrap_or(0);
        live.max(dead)
    }

    fn key_index(&self, key: &str) -> u64 {
        self.entries
            .get(key)
            .map(|e| e.modify_index)
            .or_else(|| self.tombstones.get(key).copied())
            .unwrap_or(0)
    }

    /// Index handed back to callers. Keys or prefixes never written report
    /// the store-wide index, which the next write moves past.
    fn reported(&self, index: u64) -> u64 {
        if index == 0 {
            self.index
        } else {
            index
        }
    }

    fn holder(&self, key: &str) -> Option<&SessionId> {
        self.entries
            .get(key)
            .and_then(|e| e.session.as_ref())
            .filter(|s| self.sessions.contains_key(*s))
    }

    fn pair(&self, key: &str) -> Option<KvPair> {
        self.entries.get(key).map(|e| KvPair {
            key: key.to_string(),
            value: e.value.clone(),
            modify_index: e.modify_index,
        })
    }
}

/// In-memory coordination store.
///
/// Thread-safe; writes bump a store-wide modify index and wake every
/// blocked reader, which then re-evaluates its own key or prefix.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("memory store", "state lock poisoned")
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            changes,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(poison_err)
    }

    fn notify(&self, index: u64) {
        self.changes.send_replace(index);
    }

    /// Current store-wide modify index.
    pub fn index(&self) -> Result<u64> {
        Ok(self.state()?.index)
    }

    /// Session currently holding the lock at `key`, if any.
    pub fn lock_holder(&self, key: &str) -> Result<Option<SessionId>> {
        Ok(self.state()?.holder(key).cloned())
    }

    /// Invalidates a session: every lock it holds is released and its
    /// leadership token fires. Returns false if the session was unknown.
    pub fn invalidate_session(&self, session: &SessionId) -> Result<bool> {
        let (token, index) = {
            let mut state = self.state()?;
            let Some(token) = state.sessions.remove(session) else {
                return Ok(false);
            };
            let held: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.session.as_ref() == Some(session))
                .map(|(k, _)| k.clone())
                .collect();
            let index = state.bump();
            for key in held {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.session = None;
                    entry.modify_index = index;
                }
            }
            (token, index)
        };
        debug!(session = %session, "session invalidated");
        token.cancel();
        self.notify(index);
        Ok(true)
    }

    /// Invalidates the session holding the lock at `key`.
    pub fn invalidate_lock_holder(&self, key: &str) -> Result<bool> {
        match self.lock_holder(key)? {
            Some(session) => self.invalidate_session(&session),
            None => Ok(false),
        }
    }

    /// Waits until `ready` returns true or the deadline passes.
    async fn wait_until<F>(&self, deadline: Option<Instant>, mut ready: F) -> Result<bool>
    where
        F: FnMut(&mut State) -> bool + Send,
    {
        let mut rx = self.changes.subscribe();
        loop {
            let done = {
                let mut state = self.state()?;
                ready(&mut state)
            };
            if done {
                return Ok(true);
            }
            let changed = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.changed()).await {
                    Ok(res) => res.is_ok(),
                    Err(_) => return Ok(false),
                },
                None => rx.changed().await.is_ok(),
            };
            if !changed {
                return Ok(false);
            }
        }
    }

    fn deadline(opts: &QueryOptions) -> Instant {
        Instant::now() + opts.wait_time.unwrap_or(DEFAULT_WAIT_TIME)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        Ok(self.state()?.pair(key))
    }

    async fn get_blocking(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<KvPair>, QueryMeta)> {
        if opts.wait_index > 0 {
            let wait_index = opts.wait_index;
            self.wait_until(Some(Self::deadline(opts)), |state| {
                state.key_index(key) > wait_index
            })
            .await?;
        }
        let state = self.state()?;
        let meta = QueryMeta {
            last_index: state.reported(state.key_index(key)),
        };
        Ok((state.pair(key), meta))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let index = {
            let mut state = self.state()?;
            let session = state.entries.get(key).and_then(|e| e.session.clone());
            state.write(key, value.to_vec(), session)
        };
        trace!(key, index, "put");
        self.notify(index);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let index = self.state()?.remove_all(&[key.to_string()]);
        if let Some(index) = index {
            self.notify(index);
        }
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let index = {
            let mut state = self.state()?;
            let keys = state.keys_with_prefix(prefix);
            state.remove_all(&keys)
        };
        if let Some(index) = index {
            debug!(prefix, index, "deleted tree");
            self.notify(index);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let state = self.state()?;
        Ok(state
            .keys_with_prefix(prefix)
            .iter()
            .filter_map(|k| state.pair(k))
            .collect())
    }

    async fn keys(
        &self,
        prefix: &str,
        separator: Option<char>,
        opts: &QueryOptions,
    ) -> Result<(Vec<String>, QueryMeta)> {
        if opts.wait_index > 0 {
            let wait_index = opts.wait_index;
            self.wait_until(Some(Self::deadline(opts)), |state| {
                state.prefix_index(prefix) > wait_index
            })
            .await?;
        }
        let state = self.state()?;
        let mut keys = BTreeSet::new();
        for key in state.keys_with_prefix(prefix) {
            let rest = &key[prefix.len()..];
            match separator.and_then(|sep| rest.find(sep).map(|i| (sep, i))) {
                Some((sep, i)) => {
                    keys.insert(format!("{}{}", prefix, &rest[..i + sep.len_utf8()]));
                }
                None => {
                    keys.insert(key);
                }
            }
        }
        let meta = QueryMeta {
            last_index: state.reported(state.prefix_index(prefix)),
        };
        Ok((keys.into_iter().collect(), meta))
    }

    async fn acquire_lock(&self, opts: &LockOptions) -> Result<Option<LockLease>> {
        let deadline = opts.try_once.then(|| Instant::now() + opts.wait_time);
        let mut lease = None;
        let acquired = self
            .wait_until(deadline, |state| {
                if state.holder(&opts.key).is_some() {
                    return false;
                }
                let session = SessionId(Uuid::new_v4().to_string());
                let lost = CancellationToken::new();
                state.sessions.insert(session.clone(), lost.clone());
                let index = state.write(&opts.key, opts.value.clone(), Some(session.clone()));
                self.changes.send_replace(index);
                lease = Some(LockLease {
                    key: opts.key.clone(),
                    session,
                    lost,
                });
                true
            })
            .await?;
        if !acquired {
            trace!(key = %opts.key, "lock held by another session");
        }
        Ok(lease)
    }

    async fn release_lock(&self, key: &str, session: &SessionId) -> Result<()> {
        let index = {
            let mut state = self.state()?;
            state.sessions.remove(session);
            let owned = state
                .entries
                .get(key)
                .is_some_and(|e| e.session.as_ref() == Some(session));
            if owned {
                let index = state.bump();
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.session = None;
                    entry.modify_index = index;
                }
                Some(index)
            } else {
                None
            }
        };
        if let Some(index) = index {
            self.notify(index);
        }
        Ok(())
    }

    async fn destroy_lock(&self, key: &str) -> Result<()> {
        let index = {
            let mut state = self.state()?;
            if state.holder(key).is_some() {
                return Err(Error::store(format!("destroy lock {key}"), "lock in use"));
            }
            state.remove_all(&[key.to_string()])
        };
        if let Some(index) = index {
            self.notify(index);
        }
        Ok(())
    }
}
