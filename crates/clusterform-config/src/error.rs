use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "Config file {0} not found. Config files are looked up in this order:\n\
        - the CLUSTERFORM_CONFIG environment variable\n\
        - current directory: clusterform.yaml, .clusterform.yaml\n\
        - ~/.config/clusterform/config.yaml"
    )]
    NotFound(PathBuf),

    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
