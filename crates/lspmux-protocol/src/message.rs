//! JSON-RPC 2.0 message shapes.
//!
//! A wire message is classified by shape, not by a tag: a `method` with an
//! `id` is a request, a `method` without an `id` is a notification, and an
//! `id` with a `result` or `error` is a response. [`Message`] performs that
//! classification on deserialize and flattens back to the wire form on
//! serialize.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC request/response id. The wire type (number vs string) is
/// preserved end to end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{n}"),
            RpcId::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// -32600, request rejected outright (e.g. after shutdown).
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    /// -32601, no handler for the method.
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self {
            code: -32601,
            message: message.into(),
            data: None,
        }
    }

    /// -32603, internal error.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }

    /// -32002, request received before `initialize` completed (LSP).
    pub fn server_not_initialized(message: impl Into<String>) -> Self {
        Self {
            code: -32002,
            message: message.into(),
            data: None,
        }
    }

    /// -32800, request cancelled (LSP).
    pub fn request_cancelled(message: impl Into<String>) -> Self {
        Self {
            code: -32800,
            message: message.into(),
            data: None,
        }
    }
}

/// A request: carries an id and expects exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RpcId,
    pub method: String,
    pub params: Option<Value>,
}

/// A notification: fire and forget.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A response: either a result or an error, never both.
///
/// `"result": null` is a successful response (the `shutdown` reply is exactly
/// that), so the result is not an `Option` — [`ResponsePayload`] keeps the
/// two cases disjoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RpcId,
    pub payload: ResponsePayload,
}

/// The body of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcError),
}

/// Any JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn request(id: RpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response_ok(id: RpcId, result: Value) -> Self {
        Message::Response(Response {
            id,
            payload: ResponsePayload::Result(result),
        })
    }

    pub fn response_err(id: RpcId, error: RpcError) -> Self {
        Message::Response(Response {
            id,
            payload: ResponsePayload::Error(error),
        })
    }

    /// Method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }
}

/// Wire representation: the union of all three shapes.
#[derive(Serialize, Deserialize)]
struct RawMessage {
    #[serde(default = "jsonrpc_version")]
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// Raised when a body has neither a method nor an id.
#[derive(Debug)]
pub struct InvalidShape;

impl fmt::Display for InvalidShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("message is neither a request, a notification, nor a response")
    }
}

impl std::error::Error for InvalidShape {}

impl TryFrom<RawMessage> for Message {
    type Error = InvalidShape;

    fn try_from(raw: RawMessage) -> Result<Self, InvalidShape> {
        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(Message::Request(Request {
                id,
                method,
                params: raw.params,
            })),
            (Some(method), None) => Ok(Message::Notification(Notification {
                method,
                params: raw.params,
            })),
            (None, Some(id)) => {
                // A null result deserializes as an absent one; a response
                // without an error is a success either way.
                let payload = match raw.error {
                    Some(error) => ResponsePayload::Error(error),
                    None => ResponsePayload::Result(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Message::Response(Response { id, payload }))
            }
            (None, None) => Err(InvalidShape),
        }
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        let mut raw = RawMessage {
            jsonrpc: jsonrpc_version(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match message {
            Message::Request(r) => {
                raw.id = Some(r.id);
                raw.method = Some(r.method);
                raw.params = r.params;
            }
            Message::Notification(n) => {
                raw.method = Some(n.method);
                raw.params = n.params;
            }
            Message::Response(r) => {
                raw.id = Some(r.id);
                match r.payload {
                    ResponsePayload::Result(value) => raw.result = Some(value),
                    ResponsePayload::Error(error) => raw.error = Some(error),
                }
            }
        }
        raw
    }
}
