use std::path::PathBuf;
use thiserror::Error;

/// Problems found while validating plugin or agent configuration.
///
/// These are fatal at startup: the pipeline is never started with a plugin whose `init`
/// failed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{plugin}: missing required option `{field}`")]
    MissingOption { plugin: String, field: &'static str },

    #[error("{plugin}: invalid value for `{field}`: {reason}")]
    InvalidOption {
        plugin: String,
        field: &'static str,
        reason: String,
    },

    #[error("unknown {kind} plugin type `{name}`")]
    UnknownPlugin { kind: &'static str, name: String },

    #[error("{plugin}: {source}")]
    Deserialize {
        plugin: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn invalid(plugin: &str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            plugin: plugin.to_string(),
            field,
            reason: reason.into(),
        }
    }

    pub fn missing(plugin: &str, field: &'static str) -> Self {
        Self::MissingOption {
            plugin: plugin.to_string(),
            field,
        }
    }
}

/// Failures of the file-state repository.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no file state for {path} (inode {inode})")]
    NotFound { path: String, inode: u64 },

    #[error("file state store is closed")]
    Closed,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare state directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
