use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NimbusError {
    #[error("No instance or cluster matches '{0}'.")]
    NotFound(String),
    #[error("Command '{command}' failed on {instance} ({status}).")]
    TerminalExecution {
        instance: String,
        command: String,
        status: String,
    },
    #[error("Run cancelled before completion.")]
    Cancelled,
    #[error("Error response from provider API: {0}")]
    Provider(String),
    #[error("Missing {name} in {}.", file.display())]
    MissingVariable { name: String, file: PathBuf },
    #[error("Transfer to or from {instance} failed ({status}).")]
    Transfer { instance: String, status: String },
    #[error("{0}")]
    Config(String),
    #[error("Failed to reach provider API: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to execute local command: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = NimbusError> = std::result::Result<T, E>;
