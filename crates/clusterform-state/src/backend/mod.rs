//! Durable storage of state documents
//!
//! A backend holds exactly one canonical document per target (a cluster
//! manager). Writers must hold the target's lock: every mutating call takes
//! the [`LockToken`] returned by [`Backend::acquire_lock`], and backends
//! refuse to write when the lock on record is not that token.

mod local;
mod remote;
mod store;

pub use local::LocalBackend;
pub use remote::RemoteBackend;
pub use store::{EntryKind, HttpObjectStore, MemoryObjectStore, ObjectStore, StoreEntry};

use crate::error::{Result, StateError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// File name of the state document inside a target
pub const STATE_FILE: &str = "main.tf.json";

/// File name of the lock record inside a target
pub const LOCK_FILE: &str = "lock.json";

/// Locks older than this are considered abandoned
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Storage for one state document per target
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for messages (e.g. "local")
    fn name(&self) -> &str;

    /// Take exclusive ownership of `target`
    async fn acquire_lock(&self, target: &str) -> Result<LockToken>;

    /// Give up ownership of `target`
    async fn release_lock(&self, target: &str, lock: &LockToken) -> Result<()>;

    /// Read the current snapshot; `NotFound` when none exists
    async fn load(&self, target: &str) -> Result<Vec<u8>>;

    /// Replace the snapshot
    ///
    /// Only call this after the infrastructure change described by `bytes`
    /// has been applied successfully.
    async fn persist_state(&self, target: &str, bytes: &[u8], lock: &LockToken) -> Result<()>;

    /// Remove the snapshot after the target has been destroyed
    async fn delete(&self, target: &str, lock: &LockToken) -> Result<()>;

    /// Targets that currently have a snapshot
    async fn list(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn acquire_lock(&self, target: &str) -> Result<LockToken> {
        (**self).acquire_lock(target).await
    }

    async fn release_lock(&self, target: &str, lock: &LockToken) -> Result<()> {
        (**self).release_lock(target, lock).await
    }

    async fn load(&self, target: &str) -> Result<Vec<u8>> {
        (**self).load(target).await
    }

    async fn persist_state(&self, target: &str, bytes: &[u8], lock: &LockToken) -> Result<()> {
        (**self).persist_state(target, bytes, lock).await
    }

    async fn delete(&self, target: &str, lock: &LockToken) -> Result<()> {
        (**self).delete(target, lock).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        (**self).list().await
    }
}

/// Proof of holding a target's lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    info: LockInfo,
}

impl LockToken {
    pub fn token(&self) -> &str {
        &self.info.token
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

/// Lock record as stored next to the state document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

static LOCK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl LockInfo {
    /// A fresh lock record for this process
    pub fn new() -> Self {
        let holder = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown".to_string());
        let pid = std::process::id();
        let acquired_at = Utc::now();
        let sequence = LOCK_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let token = format!(
            "{}-{}-{}-{}",
            holder,
            pid,
            acquired_at.timestamp_nanos_opt().unwrap_or_default(),
            sequence
        );
        Self {
            holder,
            pid,
            token,
            acquired_at,
        }
    }

    pub fn is_stale(&self, stale_after: Duration) -> bool {
        Utc::now()
            .signed_duration_since(self.acquired_at)
            .to_std()
            .is_ok_and(|age| age >= stale_after)
    }

    pub(crate) fn into_token(self) -> LockToken {
        LockToken { info: self }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Default for LockInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Error for a lock held by someone else
pub(crate) fn held_by(target: &str, info: &LockInfo) -> StateError {
    StateError::Lock(format!(
        "state of '{}' is locked by {} (pid {}) since {}",
        target, info.holder, info.pid, info.acquired_at
    ))
}

/// Error for a lock that no longer belongs to the caller
pub(crate) fn lost_lock(target: &str, current: Option<&LockInfo>) -> StateError {
    match current {
        Some(info) => StateError::Lock(format!(
            "lock on '{}' was taken over by {} (pid {}) at {}",
            target, info.holder, info.pid, info.acquired_at
        )),
        None => StateError::Lock(format!("lock on '{}' was removed by someone else", target)),
    }
}

/// Targets are single path segments
pub fn validate_target(target: &str) -> Result<()> {
    if target.is_empty()
        || target == "."
        || target == ".."
        || target.contains(['/', '\\'])
        || target.chars().any(char::is_control)
    {
        return Err(StateError::InvalidTarget(target.to_string()));
    }
    Ok(())
}
