//! Configuration: a JSON array of backend server entries.
//!
//! The file is passed as the sole command-line argument. The first entry is
//! the primary backend; it receives every request no other rule claims.
//!
//! ```json
//! [
//!     { "cmd": "clangd", "args": ["--background-index"] },
//!     { "port": 9257, "useCompletion": true, "useDiagnostics": false }
//! ]
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// One backend server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Executable to spawn. Mutually exclusive with `port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    /// Arguments for `cmd`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// TCP port of an externally started server. Mutually exclusive with
    /// `cmd`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// TCP host, only meaningful with `port`.
    #[serde(skip_serializing_if = "is_default_host")]
    pub host: String,

    /// Value substituted into `initialize` params and
    /// `workspace/didChangeConfiguration` settings for this backend. When
    /// absent, the primary receives the client's own value and every other
    /// backend receives null.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<Value>,

    /// Prefer this backend for completion and completionItem/resolve.
    pub use_completion: bool,

    /// Prefer this backend for signatureHelp.
    pub use_signature_help: bool,

    /// Prefer this backend for formatting and rangeFormatting.
    pub use_formatting: bool,

    /// Prefer this backend for executeCommand (per advertised command).
    pub use_execute_command: bool,

    /// Forward textDocument/publishDiagnostics from this backend.
    pub use_diagnostics: bool,
}

fn is_default_host(host: &str) -> bool {
    host == "127.0.0.1"
}

// Unset fields take these values; note diagnostics are on by default.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cmd: None,
            args: Vec::new(),
            port: None,
            host: "127.0.0.1".to_string(),
            initialization_options: None,
            use_completion: false,
            use_signature_help: false,
            use_formatting: false,
            use_execute_command: false,
            use_diagnostics: true,
        }
    }
}

impl ServerConfig {
    /// Display name: the command for spawned servers, `host:port` for TCP
    /// ones.
    pub fn name(&self) -> String {
        match (&self.cmd, self.port) {
            (Some(cmd), _) => cmd.clone(),
            (None, Some(port)) => format!("{}:{}", self.host, port),
            (None, None) => "<unconfigured>".to_string(),
        }
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        match (&self.cmd, self.port) {
            (Some(_), Some(_)) => Err(ConfigError::Server {
                index,
                reason: "\"cmd\" and \"port\" are mutually exclusive".to_string(),
            }),
            (None, None) => Err(ConfigError::Server {
                index,
                reason: "either \"cmd\" or \"port\" is required".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Load and validate the configuration file.
pub async fn load(path: &Path) -> Result<Vec<ServerConfig>, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    parse(&text, &path.display().to_string())
}

fn parse(text: &str, path: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    let servers: Vec<ServerConfig> =
        serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;

    if servers.is_empty() {
        return Err(ConfigError::Empty);
    }
    for (index, server) in servers.iter().enumerate() {
        server.validate(index)?;
    }
    Ok(servers)
}
