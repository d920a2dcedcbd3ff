//! Filesystem backend
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<target>/main.tf.json         current state
//! <root>/<target>/main.tf.json.backup  state before the last commit
//! <root>/<target>/lock.json            lock record while a writer is active
//! <root>/<target>/lock.json.break      present while a stale lock is broken
//! ```

use super::{
    Backend, DEFAULT_STALE_AFTER, LOCK_FILE, LockInfo, LockToken, STATE_FILE, held_by, lost_lock,
    validate_target,
};
use crate::error::{Result, StateError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const BACKUP_SUFFIX: &str = ".backup";
const BREAK_SUFFIX: &str = ".break";

/// A break marker left behind by a crashed process is ignored after this long
const BREAK_STALE_AFTER: Duration = Duration::from_secs(30);

/// State documents stored in a local directory
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    stale_after: Duration,
}

/// What [`LocalBackend::take_lock`] found in the lock file
enum Taken {
    Removed,
    Missing,
    Other(LockInfo),
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Age after which another holder's lock is broken
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_dir(&self, target: &str) -> Result<PathBuf> {
        validate_target(target)?;
        Ok(self.root.join(target))
    }

    async fn read_lock(&self, path: &Path) -> Result<Option<LockInfo>> {
        match fs::read(path).await {
            Ok(bytes) => LockInfo::from_bytes(&bytes).map(Some).map_err(|e| {
                StateError::Lock(format!(
                    "lock file {} is unreadable ({}); remove it if no other operation is running",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn verify_lock(&self, target: &str, dir: &Path, lock: &LockToken) -> Result<()> {
        match self.read_lock(&dir.join(LOCK_FILE)).await? {
            Some(current) if current.token == lock.token() => Ok(()),
            current => Err(lost_lock(target, current.as_ref())),
        }
    }

    /// Create `path` holding `info` only if it does not exist
    ///
    /// The record is written to a private file first and hard-linked into
    /// place, so readers never observe a partially written lock.
    async fn try_create(&self, dir: &Path, path: &Path, info: &LockInfo) -> Result<bool> {
        let staging = dir.join(format!("{}.{}.tmp", LOCK_FILE, info.token));
        fs::write(&staging, info.to_bytes()?).await?;
        let linked = fs::hard_link(&staging, path).await;
        remove_if_exists(&staging).await?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the lock file only if it carries `token`
    ///
    /// The file is renamed to a private name before it is inspected. A lock
    /// that turns out to belong to someone else is linked back in place and
    /// never deleted.
    async fn take_lock(&self, dir: &Path, token: &str) -> Result<Taken> {
        let lock_path = dir.join(LOCK_FILE);
        let claimed = dir.join(format!("{}.{}.taken", LOCK_FILE, LockInfo::new().token));
        match fs::rename(&lock_path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Taken::Missing),
            Err(e) => return Err(e.into()),
        }

        let found = self.read_lock(&claimed).await;
        if let Ok(Some(info)) = &found
            && info.token == token
        {
            remove_if_exists(&claimed).await?;
            return Ok(Taken::Removed);
        }

        let restored = fs::hard_link(&claimed, &lock_path).await;
        remove_if_exists(&claimed).await?;
        match restored {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!(
                    "Lock in {} was replaced while it was being inspected",
                    dir.display()
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(match found? {
            Some(info) => Taken::Other(info),
            None => Taken::Missing,
        })
    }

    /// Break `stale`, the lock last seen on `target`, unless it changed since
    ///
    /// Breakers of one target are serialized by the break marker, and the
    /// lock is read again while holding it.
    async fn break_stale_lock(&self, target: &str, dir: &Path, stale: &LockInfo) -> Result<()> {
        let marker = dir.join(format!("{}{}", LOCK_FILE, BREAK_SUFFIX));
        if !self.try_create(dir, &marker, &LockInfo::new()).await? {
            if let Some(breaker) = self.read_lock(&marker).await?
                && breaker.is_stale(BREAK_STALE_AFTER)
            {
                tracing::warn!("Removing abandoned break marker on {}", target);
                remove_if_exists(&marker).await?;
            }
            return Err(StateError::Lock(format!(
                "stale lock on '{}' is being broken by another process",
                target
            )));
        }

        let result = self.break_marked(target, dir, stale).await;
        let cleared = remove_if_exists(&marker).await;
        result.and(cleared)
    }

    async fn break_marked(&self, target: &str, dir: &Path, stale: &LockInfo) -> Result<()> {
        match self.read_lock(&dir.join(LOCK_FILE)).await? {
            Some(current) if current.token == stale.token => {}
            Some(current) => return Err(held_by(target, &current)),
            None => return Ok(()),
        }
        tracing::warn!(
            "Removing stale lock on {} held by {} since {}",
            target,
            stale.holder,
            stale.acquired_at
        );
        match self.take_lock(dir, &stale.token).await? {
            Taken::Removed | Taken::Missing => Ok(()),
            Taken::Other(current) => Err(held_by(target, &current)),
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn backup_path(state: &Path) -> PathBuf {
    let mut name = state.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn acquire_lock(&self, target: &str) -> Result<LockToken> {
        let dir = self.target_dir(target)?;
        fs::create_dir_all(&dir).await?;
        let lock_path = dir.join(LOCK_FILE);

        for attempt in 0..2 {
            let info = LockInfo::new();
            if self.try_create(&dir, &lock_path, &info).await? {
                tracing::debug!("Acquired state lock for {}", target);
                return Ok(info.into_token());
            }
            match self.read_lock(&lock_path).await? {
                Some(current) if attempt == 0 && current.is_stale(self.stale_after) => {
                    self.break_stale_lock(target, &dir, &current).await?;
                }
                Some(current) => return Err(held_by(target, &current)),
                // released between our attempt and the read
                None => {}
            }
        }
        Err(StateError::Lock(format!(
            "could not acquire lock on '{}'",
            target
        )))
    }

    async fn release_lock(&self, target: &str, lock: &LockToken) -> Result<()> {
        let dir = self.target_dir(target)?;
        match self.take_lock(&dir, lock.token()).await? {
            Taken::Removed => {}
            Taken::Missing => return Err(lost_lock(target, None)),
            Taken::Other(current) => return Err(lost_lock(target, Some(&current))),
        }
        tracing::debug!("Released state lock for {}", target);

        // A target whose state was deleted leaves an empty directory behind
        if !fs::try_exists(dir.join(STATE_FILE)).await?
            && let Err(e) = fs::remove_dir(&dir).await
        {
            tracing::debug!("Keeping directory {}: {}", dir.display(), e);
        }
        Ok(())
    }

    async fn load(&self, target: &str) -> Result<Vec<u8>> {
        let path = self.target_dir(target)?.join(STATE_FILE);
        match fs::read(&path).await {
            Ok(bytes) => {
                tracing::debug!("Loaded {} bytes from {}", bytes.len(), path.display());
                Ok(bytes)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StateError::NotFound(format!(
                "no state stored for '{}'",
                target
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_state(&self, target: &str, bytes: &[u8], lock: &LockToken) -> Result<()> {
        let dir = self.target_dir(target)?;
        self.verify_lock(target, &dir, lock).await?;

        let path = dir.join(STATE_FILE);
        let staging = dir.join(format!("{}.tmp", STATE_FILE));
        let mut file = fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if fs::try_exists(&path).await? {
            fs::copy(&path, backup_path(&path)).await?;
            tracing::debug!("Created state backup for {}", target);
        }
        fs::rename(&staging, &path).await?;
        sync_dir(&dir).await;

        tracing::debug!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    async fn delete(&self, target: &str, lock: &LockToken) -> Result<()> {
        let dir = self.target_dir(target)?;
        self.verify_lock(target, &dir, lock).await?;
        let path = dir.join(STATE_FILE);
        remove_if_exists(&path).await?;
        remove_if_exists(&backup_path(&path)).await?;
        tracing::debug!("Deleted state of {}", target);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut targets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && fs::try_exists(entry.path().join(STATE_FILE)).await?
            {
                targets.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        targets.sort();
        Ok(targets)
    }
}

/// Flush a rename to disk; not every platform can open a directory for this
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Err(e) = async { fs::File::open(dir).await?.sync_all().await }.await {
        tracing::debug!("Could not sync {}: {}", dir.display(), e);
    }
    #[cfg(not(unix))]
    let _ = dir;
}
