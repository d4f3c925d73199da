//! Multiplexing proxy for the Language Server Protocol.
//!
//! lspmux sits between a single editor client (JSON-RPC over stdio) and one
//! or more backend language servers, presenting the illusion of exactly one
//! server. Notifications and lifecycle requests fan out to every backend;
//! feature requests route to a single backend chosen from declared
//! capabilities and user preference flags; `initialize`, `shutdown` and
//! `textDocument/codeAction` aggregate answers from all backends; request ids
//! are rewritten so each backend keeps its own id space.
//!
//! The crate is a library so the integration tests can drive the router over
//! in-memory pipes; the `lspmux` binary is a thin wrapper around
//! [`router::Router`].

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod router;
pub mod routing;
pub mod transport;

pub use config::ServerConfig;
pub use error::{ConfigError, ProxyError};
pub use router::Router;
