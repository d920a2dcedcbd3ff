//! Object store backend
//!
//! Keys: `<prefix>/<target>/main.tf.json` and `<prefix>/<target>/lock.json`.

use super::{
    Backend, DEFAULT_STALE_AFTER, EntryKind, LOCK_FILE, LockInfo, LockToken, ObjectStore,
    STATE_FILE, held_by, lost_lock, validate_target,
};
use crate::error::{Result, StateError};
use async_trait::async_trait;
use std::time::Duration;

/// State documents stored in an [`ObjectStore`]
#[derive(Debug, Clone)]
pub struct RemoteBackend<S> {
    store: S,
    prefix: String,
    stale_after: Duration,
}

impl<S: ObjectStore> RemoteBackend<S> {
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn key(&self, target: &str, file: &str) -> Result<String> {
        validate_target(target)?;
        Ok(if self.prefix.is_empty() {
            format!("{}/{}", target, file)
        } else {
            format!("{}/{}/{}", self.prefix, target, file)
        })
    }

    /// The stored lock record with the exact bytes it was read from
    async fn read_lock(&self, key: &str) -> Result<Option<(Vec<u8>, LockInfo)>> {
        match self.store.get(key).await? {
            Some(bytes) => match LockInfo::from_bytes(&bytes) {
                Ok(info) => Ok(Some((bytes, info))),
                Err(e) => Err(StateError::Lock(format!(
                    "lock object {} is unreadable ({}); delete it if no other operation is running",
                    key, e
                ))),
            },
            None => Ok(None),
        }
    }

    async fn current_lock(&self, key: &str) -> Result<Option<LockInfo>> {
        Ok(self.read_lock(key).await?.map(|(_, info)| info))
    }

    async fn verify_lock(&self, target: &str, lock: &LockToken) -> Result<()> {
        match self.current_lock(&self.key(target, LOCK_FILE)?).await? {
            Some(current) if current.token == lock.token() => Ok(()),
            current => Err(lost_lock(target, current.as_ref())),
        }
    }
}

#[async_trait]
impl<S: ObjectStore> Backend for RemoteBackend<S> {
    fn name(&self) -> &str {
        "remote"
    }

    async fn acquire_lock(&self, target: &str) -> Result<LockToken> {
        let key = self.key(target, LOCK_FILE)?;

        for attempt in 0..2 {
            let info = LockInfo::new();
            if self.store.put_if_absent(&key, &info.to_bytes()?).await? {
                tracing::debug!("Acquired remote state lock for {}", target);
                return Ok(info.into_token());
            }
            match self.read_lock(&key).await? {
                Some((bytes, current)) if attempt == 0 && current.is_stale(self.stale_after) => {
                    tracing::warn!(
                        "Removing stale lock on {} held by {} since {}",
                        target,
                        current.holder,
                        current.acquired_at
                    );
                    if !self.store.delete_if_matches(&key, &bytes).await? {
                        tracing::debug!("Stale lock on {} changed before removal", target);
                    }
                }
                Some((_, current)) => return Err(held_by(target, &current)),
                None => {}
            }
        }
        Err(StateError::Lock(format!(
            "could not acquire lock on '{}'",
            target
        )))
    }

    async fn release_lock(&self, target: &str, lock: &LockToken) -> Result<()> {
        let key = self.key(target, LOCK_FILE)?;
        if !self
            .store
            .delete_if_matches(&key, &lock.info().to_bytes()?)
            .await?
        {
            let current = self.current_lock(&key).await?;
            return Err(lost_lock(target, current.as_ref()));
        }
        tracing::debug!("Released remote state lock for {}", target);
        Ok(())
    }

    async fn load(&self, target: &str) -> Result<Vec<u8>> {
        let key = self.key(target, STATE_FILE)?;
        self.store.get(&key).await?.ok_or_else(|| {
            StateError::NotFound(format!("no state stored for '{}' at {}", target, key))
        })
    }

    async fn persist_state(&self, target: &str, bytes: &[u8], lock: &LockToken) -> Result<()> {
        self.verify_lock(target, lock).await?;
        let key = self.key(target, STATE_FILE)?;
        self.store.put(&key, bytes).await?;
        tracing::debug!("Saved {} bytes to {}", bytes.len(), key);
        Ok(())
    }

    async fn delete(&self, target: &str, lock: &LockToken) -> Result<()> {
        self.verify_lock(target, lock).await?;
        self.store.delete(&self.key(target, STATE_FILE)?).await?;
        tracing::debug!("Deleted remote state of {}", target);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        for entry in self.store.list(&self.prefix).await? {
            if entry.kind != EntryKind::Directory {
                continue;
            }
            if self.store.exists(&self.key(&entry.name, STATE_FILE)?).await? {
                targets.push(entry.name);
            }
        }
        targets.sort();
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryObjectStore;

    #[tokio::test]
    async fn test_keys_and_persist() {
        let store = MemoryObjectStore::new();
        let backend = RemoteBackend::new(store.clone(), "/clusterform/");

        let lock = backend.acquire_lock("prod").await.unwrap();
        assert_eq!(store.keys().await, vec!["clusterform/prod/lock.json"]);

        backend.persist_state("prod", b"{}\n", &lock).await.unwrap();
        backend.release_lock("prod", &lock).await.unwrap();

        assert_eq!(store.keys().await, vec!["clusterform/prod/main.tf.json"]);
        assert_eq!(backend.load("prod").await.unwrap(), b"{}\n");
    }

    #[tokio::test]
    async fn test_load_missing() {
        let backend = RemoteBackend::new(MemoryObjectStore::new(), "");
        assert!(backend.load("prod").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_lock_excludes_and_breaks_stale() {
        let store = MemoryObjectStore::new();
        let backend = RemoteBackend::new(store.clone(), "state");

        let first = backend.acquire_lock("prod").await.unwrap();
        assert!(matches!(
            backend.acquire_lock("prod").await,
            Err(StateError::Lock(_))
        ));

        let impatient = RemoteBackend::new(store, "state").with_stale_after(Duration::ZERO);
        let second = impatient.acquire_lock("prod").await.unwrap();

        assert!(matches!(
            backend.persist_state("prod", b"{}", &first).await,
            Err(StateError::Lock(_))
        ));
        assert!(matches!(
            backend.release_lock("prod", &first).await,
            Err(StateError::Lock(_))
        ));
        impatient.release_lock("prod", &second).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stale_break_single_holder() {
        let store = MemoryObjectStore::new();
        let backend =
            RemoteBackend::new(store.clone(), "state").with_stale_after(Duration::from_secs(60));

        for _ in 0..100 {
            let mut abandoned = LockInfo::new();
            abandoned.acquired_at = "2000-01-01T00:00:00Z".parse().unwrap();
            store
                .put("state/prod/lock.json", &abandoned.to_bytes().unwrap())
                .await
                .unwrap();

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let backend = backend.clone();
                    tokio::spawn(async move { backend.acquire_lock("prod").await })
                })
                .collect();
            let mut holders = Vec::new();
            for handle in handles {
                if let Ok(lock) = handle.await.unwrap() {
                    holders.push(lock);
                }
            }

            assert_eq!(holders.len(), 1);
            backend.release_lock("prod", &holders[0]).await.unwrap();
            assert!(store.keys().await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = MemoryObjectStore::new();
        let backend = RemoteBackend::new(store.clone(), "state");

        for target in ["staging", "prod"] {
            let lock = backend.acquire_lock(target).await.unwrap();
            backend.persist_state(target, b"{}", &lock).await.unwrap();
            backend.release_lock(target, &lock).await.unwrap();
        }
        // a held lock without state is not a target
        let pending = backend.acquire_lock("new").await.unwrap();
        store.put("state/notes.txt", b"").await.unwrap();

        assert_eq!(backend.list().await.unwrap(), vec!["prod", "staging"]);

        let lock = backend.acquire_lock("prod").await.unwrap();
        backend.delete("prod", &lock).await.unwrap();
        backend.release_lock("prod", &lock).await.unwrap();
        backend.release_lock("new", &pending).await.unwrap();

        assert_eq!(backend.list().await.unwrap(), vec!["staging"]);
    }
}
