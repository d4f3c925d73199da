//! Error types for the proxy.

use thiserror::Error;

/// Errors detected before any client communication begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// Config file was not valid JSON of the expected shape.
    #[error("invalid config at {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    /// The server array was empty.
    #[error("no servers configured")]
    Empty,

    /// A server entry failed validation.
    #[error("server {index}: {reason}")]
    Server { index: usize, reason: String },
}

/// Runtime errors of the proxy session.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Framing or JSON error on a stream.
    #[error("protocol error: {0}")]
    Protocol(#[from] lspmux_protocol::ProtocolError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend process could not be spawned or a TCP backend reached.
    #[error("failed to start backend {name}: {reason}")]
    BackendStart { name: String, reason: String },

    /// An internal channel closed while the session was still live.
    #[error("stream closed")]
    ChannelClosed,
}
