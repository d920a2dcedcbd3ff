//! terraform wrapper error types

use clusterform_state::StateError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerraformError {
    #[error("terraform binary '{0}' not found. Install terraform or set terraform_binary")]
    TerraformNotFound(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A terraform run that did not succeed is a failed apply
impl From<TerraformError> for StateError {
    fn from(error: TerraformError) -> Self {
        StateError::ApplyFailure(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TerraformError>;
