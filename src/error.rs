//! Error types for startup and listener failures

use crate::routes::Protocol;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors: anything here stops the proxy before (or instead of) serving
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("could not open settings file {path}: {source}")]
    SettingsUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse route list: {0}")]
    SettingsInvalid(#[from] serde_json::Error),

    #[error("route #{index} has an empty hostname")]
    EmptyHostname { index: usize },

    #[error("hostname {0} is configured more than once")]
    DuplicateHostname(String),

    #[error("malformed backend address {address:?} for {hostname}: {reason}")]
    InvalidBackend {
        hostname: String,
        address: String,
        reason: String,
    },

    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: Protocol,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{protocol} accept loop failed: {source}")]
    Accept {
        protocol: Protocol,
        #[source]
        source: std::io::Error,
    },

    #[error("{protocol} listener stopped: {reason}")]
    ListenerFailed { protocol: Protocol, reason: String },
}

pub type Result<T> = std::result::Result<T, ProxyError>;
