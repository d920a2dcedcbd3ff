//! Load, mutate, apply, commit
//!
//! ```text
//! Idle ──load──▶ Loaded ──mutate──▶ Mutated ──▶ Applying ──ok──▶ Committed
//!                   │                              │
//!                   └──────── error ───────────────┴──err──▶ Discarded
//! ```
//!
//! The backend lock is held from before the load until after the commit or
//! discard, and the backend is written only after the provisioner succeeded.

use crate::backend::{Backend, LockToken, validate_target};
use crate::document::{MODULE_KEY, StateDocument};
use crate::error::{Result, StateError};
use crate::module::ModuleKind;
use crate::provisioner::Provisioner;
use std::collections::BTreeSet;
use std::fmt;

/// Where a provisioning run stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loaded,
    Mutated,
    Applying,
    Committed,
    Discarded,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Loaded => "loaded",
            Phase::Mutated => "mutated",
            Phase::Applying => "applying",
            Phase::Committed => "committed",
            Phase::Discarded => "discarded",
        };
        write!(f, "{}", s)
    }
}

/// How a missing snapshot is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Start from an empty document (creating a new manager)
    CreateIfMissing,
    /// Fail with `NotFound`
    RequireExisting,
}

/// Result of a committed run
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub phase: Phase,

    /// The document as now stored by the backend
    pub document: StateDocument,

    /// Whatever the mutation or destroy step reported
    pub value: T,
}

/// Phase tracking with a trace line per transition
struct Run<'a> {
    target: &'a str,
    phase: Phase,
}

impl<'a> Run<'a> {
    fn new(target: &'a str) -> Self {
        Self {
            target,
            phase: Phase::Idle,
        }
    }

    fn advance(&mut self, next: Phase) {
        tracing::info!("[{}] {} -> {}", self.target, self.phase, next);
        self.phase = next;
    }

    /// Record a failure and hand the error back
    fn discard(&mut self, error: StateError) -> StateError {
        tracing::info!("[{}] {} -> {}: {}", self.target, self.phase, Phase::Discarded, error);
        self.phase = Phase::Discarded;
        error
    }
}

/// Drives document changes through the provisioner and commits them
pub struct ProvisionCoordinator<B, P> {
    backend: B,
    provisioner: P,
}

impl<B: Backend, P: Provisioner> ProvisionCoordinator<B, P> {
    pub fn new(backend: B, provisioner: P) -> Self {
        Self {
            backend,
            provisioner,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Read the current document without taking the lock
    pub async fn load(&self, target: &str, mode: LoadMode) -> Result<StateDocument> {
        validate_target(target)?;
        match self.backend.load(target).await {
            Ok(bytes) => StateDocument::load(&bytes),
            Err(e) if e.is_not_found() && mode == LoadMode::CreateIfMissing => {
                tracing::debug!("No state for {}, starting from an empty document", target);
                Ok(StateDocument::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Mutate the target's document, apply it and commit it
    ///
    /// Nothing is written when `mutate` or the provisioner fails.
    pub async fn apply<T, F>(&self, target: &str, mode: LoadMode, mutate: F) -> Result<Outcome<T>>
    where
        T: Send,
        F: FnOnce(&mut StateDocument) -> Result<T> + Send,
    {
        let lock = self.acquire(target).await?;
        let result = self.apply_locked(target, mode, &lock, mutate).await;
        let released = self.backend.release_lock(target, &lock).await;
        and_cleanup(result, released)
    }

    /// Destroy everything under `target` and drop its snapshot
    ///
    /// Returns the names of the modules that were destroyed.
    pub async fn destroy_target(&self, target: &str) -> Result<Outcome<Vec<String>>> {
        let lock = self.acquire(target).await?;
        let result = self.destroy_target_locked(target, &lock).await;
        let released = self.backend.release_lock(target, &lock).await;
        and_cleanup(result, released)
    }

    /// Destroy selected modules and remove them from the document
    ///
    /// `select` picks module names from the current document. Selecting a
    /// cluster also selects its nodes. Returns the removed module names.
    pub async fn destroy_modules<F>(&self, target: &str, select: F) -> Result<Outcome<Vec<String>>>
    where
        F: FnOnce(&StateDocument) -> Result<Vec<String>> + Send,
    {
        let lock = self.acquire(target).await?;
        let result = self.destroy_modules_locked(target, &lock, select).await;
        let released = self.backend.release_lock(target, &lock).await;
        and_cleanup(result, released)
    }

    async fn acquire(&self, target: &str) -> Result<LockToken> {
        validate_target(target)?;
        self.backend.acquire_lock(target).await
    }

    async fn apply_locked<T, F>(
        &self,
        target: &str,
        mode: LoadMode,
        lock: &LockToken,
        mutate: F,
    ) -> Result<Outcome<T>>
    where
        T: Send,
        F: FnOnce(&mut StateDocument) -> Result<T> + Send,
    {
        let mut run = Run::new(target);
        let mut document = self.load(target, mode).await?;
        run.advance(Phase::Loaded);

        let value = mutate(&mut document).map_err(|e| run.discard(e))?;
        let bytes = document.bytes().map_err(|e| run.discard(e))?;
        run.advance(Phase::Mutated);

        run.advance(Phase::Applying);
        if let Err(e) = self.provisioner.apply(&bytes).await {
            return Err(run.discard(apply_failure(e)));
        }

        self.commit(target, &bytes, lock).await?;
        run.advance(Phase::Committed);
        Ok(Outcome {
            phase: run.phase,
            document,
            value,
        })
    }

    async fn destroy_target_locked(
        &self,
        target: &str,
        lock: &LockToken,
    ) -> Result<Outcome<Vec<String>>> {
        let mut run = Run::new(target);
        let document = self.load(target, LoadMode::RequireExisting).await?;
        run.advance(Phase::Loaded);
        let bytes = document.bytes()?;

        run.advance(Phase::Applying);
        if let Err(e) = self.provisioner.destroy(&bytes, &[]).await {
            return Err(run.discard(apply_failure(e)));
        }

        self.backend
            .delete(target, lock)
            .await
            .map_err(|e| persist_failure(target, e))?;
        run.advance(Phase::Committed);
        Ok(Outcome {
            phase: run.phase,
            document: StateDocument::new(),
            value: document.module_names().map(str::to_string).collect(),
        })
    }

    async fn destroy_modules_locked<F>(
        &self,
        target: &str,
        lock: &LockToken,
        select: F,
    ) -> Result<Outcome<Vec<String>>>
    where
        F: FnOnce(&StateDocument) -> Result<Vec<String>> + Send,
    {
        let mut run = Run::new(target);
        let mut document = self.load(target, LoadMode::RequireExisting).await?;
        run.advance(Phase::Loaded);

        let selected = select(&document)
            .and_then(|names| expand_selection(&document, target, names))
            .map_err(|e| run.discard(e))?;
        let destroyed = document.bytes()?;
        for name in &selected {
            document.remove(name);
        }
        let remaining = document.bytes()?;
        run.advance(Phase::Mutated);

        run.advance(Phase::Applying);
        if let Err(e) = self.provisioner.destroy(&destroyed, &selected).await {
            return Err(run.discard(apply_failure(e)));
        }

        self.commit(target, &remaining, lock).await?;
        run.advance(Phase::Committed);
        Ok(Outcome {
            phase: run.phase,
            document,
            value: selected,
        })
    }

    async fn commit(&self, target: &str, bytes: &[u8], lock: &LockToken) -> Result<()> {
        self.backend
            .persist_state(target, bytes, lock)
            .await
            .map_err(|e| persist_failure(target, e))?;
        tracing::debug!("Committed {} bytes for {}", bytes.len(), target);
        Ok(())
    }
}

/// Provisioner errors are total failures of the run
fn apply_failure(error: StateError) -> StateError {
    match error {
        StateError::ApplyFailure(_) => error,
        other => StateError::ApplyFailure(other.to_string()),
    }
}

fn persist_failure(target: &str, error: StateError) -> StateError {
    let error = StateError::PersistFailure {
        target: target.to_string(),
        reason: error.to_string(),
    };
    tracing::error!("{}", error);
    error
}

/// Validate selected modules and add the nodes of selected clusters
fn expand_selection(
    document: &StateDocument,
    target: &str,
    names: Vec<String>,
) -> Result<Vec<String>> {
    if names.is_empty() {
        return Err(StateError::InvalidInput(
            "no modules selected for destruction".to_string(),
        ));
    }
    let prefix = format!("{}.", MODULE_KEY);
    let mut selected = BTreeSet::new();
    for name in names {
        let name = name.strip_prefix(&prefix).unwrap_or(&name).to_string();
        if !document.contains(&name) {
            return Err(StateError::NotFound(format!(
                "module '{}' does not exist in the state of '{}'",
                name, target
            )));
        }
        if matches!(ModuleKind::of(&name), Some(ModuleKind::Cluster(_))) {
            selected.extend(document.nodes(&name).into_iter().map(str::to_string));
        }
        selected.insert(name);
    }
    Ok(selected.into_iter().collect())
}

/// Keep the operation's error, attaching a failed cleanup to it
fn and_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(error), Err(cleanup)) => Err(StateError::Cleanup {
            error: Box::new(error),
            cleanup: Box::new(cleanup),
        }),
    }
}
