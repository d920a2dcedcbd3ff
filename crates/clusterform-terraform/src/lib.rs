//! terraform provisioner for clusterform
//!
//! Implements [`clusterform_state::Provisioner`] by writing the state
//! document to a scratch directory as `main.tf.json` and running
//! `terraform init` followed by `apply` or `destroy`.
//!
//! # Requirements
//!
//! - `terraform` must be installed (or `terraform_binary` configured)
//! - Provider credentials are taken from the module settings in the document
//!
//! # Example
//!
//! ```ignore
//! use clusterform_terraform::{Terraform, TerraformProvisioner};
//!
//! let provisioner = TerraformProvisioner::new(Terraform::new("terraform"));
//! provisioner.apply(&document.bytes()?).await?;
//! ```

pub mod error;
pub mod provisioner;
pub mod terraform;

pub use error::{Result, TerraformError};
pub use provisioner::TerraformProvisioner;
pub use terraform::Terraform;
