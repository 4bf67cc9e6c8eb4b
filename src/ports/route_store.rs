use std::{path::PathBuf, sync::Arc};

use thiserror::Error;

use crate::config::models::RouteTable;

/// Errors raised while loading or watching route tables.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid route table {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("failed to create route directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start filesystem watch: {0}")]
    Watch(#[from] notify::Error),

    #[error("watching requires a running tokio runtime")]
    NoRuntime,
}

/// RouteStore defines the port for looking up per-service route tables.
///
/// Readers always observe a complete table; reloads replace tables whole.
pub trait RouteStore: Send + Sync + 'static {
    /// Current table for `service`, if one is loaded.
    fn get(&self, service: &str) -> Option<Arc<RouteTable>>;

    /// Every loaded table, in no particular order.
    fn get_all(&self) -> Vec<(String, Arc<RouteTable>)>;

    /// Start reloading tables in the background as their files change.
    ///
    /// Only fails when the watch itself cannot be set up.
    fn watch(&self) -> Result<(), ConfigError>;

    /// Stop the background reload. Calling it again is a no-op.
    fn stop_watch(&self);
}
