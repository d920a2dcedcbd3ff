//! Provisioner backed by the terraform CLI

use crate::error::Result;
use crate::terraform::Terraform;
use async_trait::async_trait;
use clusterform_state::Provisioner;
use clusterform_state::backend::STATE_FILE;
use tempfile::TempDir;

/// Applies documents by running terraform in a scratch directory
///
/// Each run gets a fresh directory holding only `main.tf.json`; it is removed
/// when the run ends, whatever the outcome.
#[derive(Debug, Clone, Default)]
pub struct TerraformProvisioner {
    terraform: Terraform,
}

impl TerraformProvisioner {
    pub fn new(terraform: Terraform) -> Self {
        Self { terraform }
    }

    pub fn terraform(&self) -> &Terraform {
        &self.terraform
    }

    /// Scratch directory with the document written and modules initialized
    async fn prepare(&self, document: &[u8]) -> Result<TempDir> {
        let dir = tempfile::Builder::new().prefix("clusterform-").tempdir()?;
        tokio::fs::write(dir.path().join(STATE_FILE), document).await?;
        self.terraform.run(dir.path(), &["init", "-force-copy"]).await?;
        Ok(dir)
    }

    async fn run_apply(&self, document: &[u8]) -> Result<()> {
        let dir = self.prepare(document).await?;
        self.terraform.run(dir.path(), &["apply", "-auto-approve"]).await
    }

    async fn run_destroy(&self, document: &[u8], targets: &[String]) -> Result<()> {
        let dir = self.prepare(document).await?;
        let args = destroy_args(targets);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.terraform.run(dir.path(), &args).await
    }
}

/// `destroy -auto-approve [-target=module.<name>]...`
fn destroy_args(targets: &[String]) -> Vec<String> {
    let mut args = vec!["destroy".to_string(), "-auto-approve".to_string()];
    args.extend(
        targets
            .iter()
            .map(|name| format!("-target=module.{}", name.trim_start_matches("module."))),
    );
    args
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn apply(&self, document: &[u8]) -> clusterform_state::Result<()> {
        tracing::info!("Applying configuration with {}", self.terraform.binary());
        Ok(self.run_apply(document).await?)
    }

    async fn destroy(&self, document: &[u8], targets: &[String]) -> clusterform_state::Result<()> {
        if targets.is_empty() {
            tracing::info!("Destroying all modules");
        } else {
            tracing::info!("Destroying {}", targets.join(", "));
        }
        Ok(self.run_destroy(document, targets).await?)
    }
}
