use async_trait::async_trait;
use clusterform_state::{Backend, LocalBackend, LockToken, Provisioner, Result, StateError};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Apply(Vec<u8>),
    Destroy(Vec<u8>, Vec<String>),
}

/// Provisioner that records its calls instead of running terraform
#[derive(Clone, Default)]
pub struct FakeProvisioner {
    pub fail: bool,
    pub calls: Arc<Mutex<Vec<Call>>>,

    /// When set, `apply` signals `entered` and waits for `gate`
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn finish(&self, call: Call) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if let Some((entered, gate)) = &self.gate {
            entered.notify_one();
            gate.notified().await;
        }
        if self.fail {
            return Err(StateError::ApplyFailure(
                "terraform apply exited with status 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn apply(&self, document: &[u8]) -> Result<()> {
        self.finish(Call::Apply(document.to_vec())).await
    }

    async fn destroy(&self, document: &[u8], targets: &[String]) -> Result<()> {
        self.finish(Call::Destroy(document.to_vec(), targets.to_vec()))
            .await
    }
}

/// Local backend with injectable write and release failures
pub struct FaultyBackend {
    pub inner: LocalBackend,
    pub fail_persist: bool,
    pub fail_release: bool,
}

#[async_trait]
impl Backend for FaultyBackend {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn acquire_lock(&self, target: &str) -> Result<LockToken> {
        self.inner.acquire_lock(target).await
    }

    async fn release_lock(&self, target: &str, lock: &LockToken) -> Result<()> {
        self.inner.release_lock(target, lock).await?;
        if self.fail_release {
            return Err(StateError::Lock("lock store unavailable".to_string()));
        }
        Ok(())
    }

    async fn load(&self, target: &str) -> Result<Vec<u8>> {
        self.inner.load(target).await
    }

    async fn persist_state(&self, target: &str, bytes: &[u8], lock: &LockToken) -> Result<()> {
        if self.fail_persist {
            return Err(StateError::Store("disk full".to_string()));
        }
        self.inner.persist_state(target, bytes, lock).await
    }

    async fn delete(&self, target: &str, lock: &LockToken) -> Result<()> {
        self.inner.delete(target, lock).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.inner.list().await
    }
}
