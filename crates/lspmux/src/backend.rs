//! Per-backend runtime state.
//!
//! Each backend keeps its own outbound id space: every request the proxy
//! forwards gets a fresh monotonically increasing integer id, and the pending
//! map remembers which client id and method it stands for. Ids are never
//! reused within a session.

use crate::capabilities;
use crate::config::ServerConfig;
use lspmux_protocol::{Message, RpcId};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What a forwarded request stands for.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub client_id: RpcId,
    pub method: String,
}

/// A backend language server as the router sees it.
pub struct Backend {
    pub name: String,
    pub config: ServerConfig,
    tx: mpsc::Sender<Message>,
    init_result: Option<Value>,
    next_id: i64,
    pending: HashMap<i64, PendingRequest>,
    pub alive: bool,
    exit_sent: bool,
}

impl Backend {
    pub fn new(config: ServerConfig, tx: mpsc::Sender<Message>) -> Self {
        Self {
            name: config.name(),
            config,
            tx,
            init_result: None,
            next_id: 1,
            pending: HashMap::new(),
            alive: true,
            exit_sent: false,
        }
    }

    /// Forward a client request: allocate a fresh backend-local id, remember
    /// the origin, enqueue the rewritten request.
    pub async fn send_request(
        &mut self,
        client_id: RpcId,
        method: &str,
        params: Option<Value>,
    ) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingRequest {
                client_id,
                method: method.to_string(),
            },
        );
        self.send(Message::request(RpcId::Number(id), method, params))
            .await;
        id
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) {
        self.send(Message::notification(method, params)).await;
    }

    /// Send `exit`. Idempotent: a backend observes `exit` at most once, and
    /// nothing may follow it.
    pub async fn send_exit(&mut self) {
        if self.exit_sent {
            return;
        }
        self.exit_sent = true;
        self.push(Message::notification(capabilities::EXIT, None))
            .await;
    }

    /// Enqueue a message on this backend's FIFO write queue. A closed queue
    /// means the writer task is gone; the death is reported through the
    /// reader side, so the send is just dropped here.
    pub async fn send(&self, message: Message) {
        if self.exit_sent {
            debug!(backend = %self.name, "dropping message after exit");
            return;
        }
        self.push(message).await;
    }

    async fn push(&self, message: Message) {
        if self.tx.send(message).await.is_err() {
            warn!(backend = %self.name, "write queue closed, message dropped");
        }
    }

    /// Pop the pending entry for a response from this backend. Unknown ids
    /// yield `None` (the caller logs and drops).
    pub fn on_response(&mut self, id: &RpcId) -> Option<PendingRequest> {
        match id {
            RpcId::Number(n) => self.pending.remove(n),
            RpcId::String(_) => None,
        }
    }

    /// Backend-local ids of in-flight requests that originated from the given
    /// client id (used for `$/cancelRequest`).
    pub fn pending_ids_for(&self, client_id: &RpcId) -> Vec<i64> {
        self.pending
            .iter()
            .filter(|(_, entry)| entry.client_id == *client_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Take every outstanding request, for death cleanup.
    pub fn drain_pending(&mut self) -> Vec<PendingRequest> {
        self.pending.drain().map(|(_, entry)| entry).collect()
    }

    /// Cache the `initialize` result; it is immutable once set.
    pub fn set_init_result(&mut self, result: Value) {
        if self.init_result.is_some() {
            warn!(backend = %self.name, "duplicate initialize result ignored");
            return;
        }
        self.init_result = Some(result);
    }

    pub fn init_result(&self) -> Option<&Value> {
        self.init_result.as_ref()
    }

    /// The advertised capabilities object, once initialized.
    pub fn capabilities(&self) -> Option<&Value> {
        self.init_result.as_ref().and_then(|r| r.get("capabilities"))
    }

    pub fn initialized(&self) -> bool {
        self.init_result.is_some()
    }

    pub fn supports(&self, method: &str) -> bool {
        self.capabilities()
            .is_some_and(|caps| capabilities::supports(caps, method))
    }

    pub fn supports_command(&self, command: &str) -> bool {
        self.capabilities()
            .is_some_and(|caps| capabilities::supports_command(caps, command))
    }

    pub fn mark_dead(&mut self) {
        self.alive = false;
    }
}
