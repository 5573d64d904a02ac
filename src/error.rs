use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::kind::EntityKind;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Everything that can go wrong while resolving, loading, saving or migrating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{kind} entry '{name}' not found (searched: {})", display_paths(.searched))]
    NotFound {
        kind: EntityKind,
        name: String,
        searched: Vec<PathBuf>,
    },

    #[error("invalid {entity}: {}", .fields.join(", "))]
    Validation { entity: String, fields: Vec<String> },

    #[error("{} already exists (pass overwrite or merge to replace it)", .path.display())]
    AlreadyExists { path: PathBuf },

    #[error("saving '{entity}' was cancelled")]
    Aborted { entity: String },

    #[error("invalid default {kind}: {reason}")]
    InvalidDefault { kind: EntityKind, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("migration finished with failures: {}", .failed.join(", "))]
    MigrationPartialFailure { failed: Vec<String> },

    #[error("i/o error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("malformed JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("sqlite store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("schema error: {0}")]
    Schema(String),
}

impl ConfigError {
    pub fn validation(entity: impl Into<String>, field: impl Into<String>) -> Self {
        ConfigError::Validation {
            entity: entity.into(),
            fields: vec![field.into()],
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ConfigError::Io { path: path.into(), source }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        ConfigError::Json { path: path.into(), source }
    }
}

/// Failures surfaced by a transport; never retried or rewrapped by the session cache
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("process error running '{command}': {source}")]
    Process { command: String, source: io::Error },

    #[error("session to {target} is closed")]
    Closed { target: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
