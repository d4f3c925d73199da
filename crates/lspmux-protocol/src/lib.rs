//! JSON-RPC 2.0 message model and LSP framing for lspmux.
//!
//! The Language Server Protocol exchanges JSON-RPC 2.0 messages framed with
//! HTTP-like headers:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! <123 bytes of UTF-8 JSON>
//! ```
//!
//! This crate provides the three message shapes ([`Request`],
//! [`Notification`], [`Response`]) behind a single [`Message`] enum, plus an
//! async [`MessageReader`]/[`MessageWriter`] pair implementing the framing.
//! Payloads stay opaque `serde_json::Value`s; the proxy never models LSP
//! params beyond the fields it rewrites.

pub mod error;
pub mod framing;
pub mod message;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{MessageReader, MessageWriter};
pub use message::{Message, Notification, Request, Response, ResponsePayload, RpcError, RpcId};
