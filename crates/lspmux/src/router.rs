//! The message router and lifecycle coordinator.
//!
//! A single task owns every table. It consumes one totally ordered stream of
//! events (client and backends merged through one channel) and enqueues
//! outbound messages on the per-stream FIFO queues, so no state needs a
//! lock and broadcasts reach every backend in client order.
//!
//! Session lifecycle:
//!
//! ```text
//! UNINITIALIZED -> INITIALIZING -> RUNNING -> SHUTTING_DOWN -> SHUTDOWN_ACKED -> EXITED
//! ```
//!
//! Requests before RUNNING are answered `-32002`; requests during or after
//! shutdown are answered `-32600`. The aggregate `initialize` and `shutdown`
//! answers go to the client only once every backend has replied.

use crate::backend::{Backend, PendingRequest};
use crate::capabilities::{
    CANCEL_REQUEST, CODE_ACTION, DID_CHANGE_CONFIGURATION, EXECUTE_COMMAND, EXIT, INITIALIZE,
    PUBLISH_DIAGNOSTICS, SHUTDOWN, SINGLE_TARGET_METHODS,
};
use crate::config::ServerConfig;
use crate::error::ProxyError;
use crate::routing::{self, RoutingTable, PRIMARY};
use crate::transport::{Event, Source};
use lspmux_protocol::{
    Message, Notification, Request, Response, ResponsePayload, RpcError, RpcId,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    ShutdownAcked,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateKind {
    Initialize,
    Shutdown,
    CodeAction,
}

/// A client request waiting on answers from several backends. One slot per
/// configured backend; completion fires when `missing` reaches zero.
struct Aggregate {
    kind: AggregateKind,
    missing: usize,
    slots: Vec<Option<Value>>,
}

/// Return path for a server-initiated request forwarded to the client.
struct ServerRequestOrigin {
    backend: usize,
    id: RpcId,
}

pub struct Router {
    backends: Vec<Backend>,
    client_tx: mpsc::Sender<Message>,
    events: mpsc::Receiver<Event>,
    phase: Phase,
    routes: Option<RoutingTable>,
    aggregates: HashMap<RpcId, Aggregate>,
    /// proxy-minted client-facing id -> origin of a server-initiated request
    server_requests: HashMap<i64, ServerRequestOrigin>,
    next_client_facing_id: i64,
    /// per backend: uri -> last forwarded diagnostics
    diagnostics: Vec<HashMap<String, Value>>,
    clean_exit: bool,
}

impl Router {
    pub fn new(
        backends: Vec<Backend>,
        client_tx: mpsc::Sender<Message>,
        events: mpsc::Receiver<Event>,
    ) -> Self {
        let diagnostics = backends.iter().map(|_| HashMap::new()).collect();
        Self {
            backends,
            client_tx,
            events,
            phase: Phase::Uninitialized,
            routes: None,
            aggregates: HashMap::new(),
            server_requests: HashMap::new(),
            next_client_facing_id: 1,
            diagnostics,
            clean_exit: false,
        }
    }

    /// Run the session to completion. Returns the process exit code: 0 only
    /// for `exit` after an acknowledged `shutdown`.
    pub async fn run(mut self) -> Result<i32, ProxyError> {
        while self.phase != Phase::Exited {
            let Some(event) = self.events.recv().await else {
                warn!("all streams gone, terminating");
                self.broadcast_exit().await;
                break;
            };
            match event {
                Event::Message(Source::Client, message) => self.on_client_message(message).await?,
                Event::Message(Source::Backend(index), message) => {
                    self.on_backend_message(index, message).await?
                }
                Event::Closed(Source::Client) => {
                    info!("client stream closed without exit");
                    self.broadcast_exit().await;
                    self.phase = Phase::Exited;
                }
                Event::Failed(Source::Client, err) => {
                    error!(error = %err, "client stream failed");
                    self.broadcast_exit().await;
                    self.phase = Phase::Exited;
                }
                Event::Closed(Source::Backend(index)) => {
                    self.on_backend_failure(index, None).await?
                }
                Event::Failed(Source::Backend(index), err) => {
                    self.on_backend_failure(index, Some(err)).await?
                }
            }
        }
        Ok(if self.clean_exit { 0 } else { 1 })
    }

    // ------------------------------------------------------------------
    // client -> proxy
    // ------------------------------------------------------------------

    async fn on_client_message(&mut self, message: Message) -> Result<(), ProxyError> {
        match message {
            Message::Request(request) => self.on_client_request(request).await,
            Message::Notification(notification) => {
                self.on_client_notification(notification).await
            }
            Message::Response(response) => self.on_client_response(response).await,
        }
    }

    async fn on_client_request(&mut self, request: Request) -> Result<(), ProxyError> {
        trace!(method = %request.method, id = %request.id, "client request");
        match self.phase {
            Phase::Uninitialized if request.method == INITIALIZE => {
                self.start_initialize(request).await;
                Ok(())
            }
            Phase::Uninitialized | Phase::Initializing => {
                let err = if request.method == INITIALIZE {
                    RpcError::invalid_request("initialize already in progress")
                } else {
                    RpcError::server_not_initialized(format!(
                        "received {} before initialization completed",
                        request.method
                    ))
                };
                self.respond_err(request.id, err).await
            }
            Phase::Running => self.dispatch_request(request).await,
            Phase::ShuttingDown | Phase::ShutdownAcked | Phase::Exited => {
                self.respond_err(
                    request.id,
                    RpcError::invalid_request("server is shutting down"),
                )
                .await
            }
        }
    }

    async fn start_initialize(&mut self, request: Request) {
        info!(backends = self.backends.len(), "initializing session");
        self.phase = Phase::Initializing;
        self.aggregates.insert(
            request.id.clone(),
            Aggregate {
                kind: AggregateKind::Initialize,
                missing: self.backends.len(),
                slots: self.backends.iter().map(|_| None).collect(),
            },
        );
        for index in 0..self.backends.len() {
            let backend = &mut self.backends[index];
            let params =
                initialize_params(&backend.config, index == PRIMARY, request.params.as_ref());
            backend
                .send_request(request.id.clone(), INITIALIZE, Some(params))
                .await;
        }
    }

    async fn dispatch_request(&mut self, request: Request) -> Result<(), ProxyError> {
        match request.method.as_str() {
            INITIALIZE => {
                self.respond_err(request.id, RpcError::invalid_request("already initialized"))
                    .await
            }
            SHUTDOWN => {
                info!("shutting down session");
                self.phase = Phase::ShuttingDown;
                let live: Vec<usize> = self.live_backends();
                if live.is_empty() {
                    self.phase = Phase::ShutdownAcked;
                    return self.respond_ok(request.id, Value::Null).await;
                }
                self.aggregates.insert(
                    request.id.clone(),
                    Aggregate {
                        kind: AggregateKind::Shutdown,
                        missing: live.len(),
                        slots: self.backends.iter().map(|_| None).collect(),
                    },
                );
                for index in live {
                    self.backends[index]
                        .send_request(request.id.clone(), SHUTDOWN, None)
                        .await;
                }
                Ok(())
            }
            CODE_ACTION => self.dispatch_code_action(request).await,
            EXECUTE_COMMAND => {
                let command = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("command"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let target = match (&command, self.routes.as_mut()) {
                    (Some(cmd), Some(routes)) => {
                        routes.command_target(&self.backends, cmd).unwrap_or(PRIMARY)
                    }
                    _ => PRIMARY,
                };
                debug!(command = ?command, target, "routing executeCommand");
                self.forward_single(target, request).await
            }
            method if SINGLE_TARGET_METHODS.contains(&method) => {
                let target = self
                    .routes
                    .as_ref()
                    .and_then(|routes| routes.target_for(method))
                    .unwrap_or(PRIMARY);
                debug!(method, target, "routing request");
                self.forward_single(target, request).await
            }
            _ => self.forward_single(PRIMARY, request).await,
        }
    }

    async fn dispatch_code_action(&mut self, request: Request) -> Result<(), ProxyError> {
        let targets: Vec<usize> = self
            .routes
            .as_ref()
            .map(|routes| routes.code_action_backends().to_vec())
            .unwrap_or_default()
            .into_iter()
            .filter(|&index| self.backends[index].alive)
            .collect();

        if targets.is_empty() {
            // nobody advertises codeAction: the primary answers, probably
            // with method-not-found, relayed verbatim
            return self.forward_single(PRIMARY, request).await;
        }

        debug!(targets = ?targets, "broadcasting codeAction");
        self.aggregates.insert(
            request.id.clone(),
            Aggregate {
                kind: AggregateKind::CodeAction,
                missing: targets.len(),
                slots: self.backends.iter().map(|_| None).collect(),
            },
        );
        for index in targets {
            self.backends[index]
                .send_request(request.id.clone(), &request.method, request.params.clone())
                .await;
        }
        Ok(())
    }

    async fn forward_single(&mut self, index: usize, request: Request) -> Result<(), ProxyError> {
        let backend = &mut self.backends[index];
        if !backend.alive {
            let name = backend.name.clone();
            return self
                .respond_err(
                    request.id,
                    RpcError::internal_error(format!("backend {name} unavailable")),
                )
                .await;
        }
        backend
            .send_request(request.id, &request.method, request.params)
            .await;
        Ok(())
    }

    async fn on_client_notification(
        &mut self,
        notification: Notification,
    ) -> Result<(), ProxyError> {
        trace!(method = %notification.method, "client notification");
        match notification.method.as_str() {
            EXIT => {
                self.clean_exit = self.phase == Phase::ShutdownAcked;
                if !self.clean_exit {
                    warn!("exit received without completed shutdown");
                }
                self.broadcast_exit().await;
                self.phase = Phase::Exited;
                Ok(())
            }
            CANCEL_REQUEST => {
                self.forward_cancel(notification.params.as_ref()).await;
                Ok(())
            }
            _ if self.phase != Phase::Running => {
                debug!(method = %notification.method, phase = ?self.phase, "dropping notification");
                Ok(())
            }
            DID_CHANGE_CONFIGURATION => {
                for index in 0..self.backends.len() {
                    let backend = &self.backends[index];
                    if !backend.alive || !backend.initialized() {
                        continue;
                    }
                    let params = configuration_params(
                        &backend.config,
                        index == PRIMARY,
                        notification.params.as_ref(),
                    );
                    backend
                        .send_notification(DID_CHANGE_CONFIGURATION, Some(params))
                        .await;
                }
                Ok(())
            }
            // document sync and everything else fans out to every backend,
            // in client order
            _ => {
                for backend in &self.backends {
                    if backend.alive && backend.initialized() {
                        backend
                            .send_notification(
                                &notification.method,
                                notification.params.clone(),
                            )
                            .await;
                    }
                }
                Ok(())
            }
        }
    }

    /// Forward `$/cancelRequest` to whichever backends hold a pending
    /// request for the cancelled client id (every participant, for
    /// aggregates).
    async fn forward_cancel(&self, params: Option<&Value>) {
        let Some(id_value) = params.and_then(|p| p.get("id")) else {
            return;
        };
        let Ok(client_id) = serde_json::from_value::<RpcId>(id_value.clone()) else {
            return;
        };
        for backend in &self.backends {
            if !backend.alive {
                continue;
            }
            for backend_id in backend.pending_ids_for(&client_id) {
                debug!(backend = %backend.name, id = backend_id, "forwarding cancel");
                backend
                    .send_notification(CANCEL_REQUEST, Some(json!({ "id": backend_id })))
                    .await;
            }
        }
    }

    /// A response from the client answers a server-initiated request; route
    /// it back with the backend's original id restored.
    async fn on_client_response(&mut self, response: Response) -> Result<(), ProxyError> {
        let origin = match &response.id {
            RpcId::Number(n) => self.server_requests.remove(n),
            RpcId::String(_) => None,
        };
        let Some(origin) = origin else {
            warn!(id = %response.id, "client response for unknown request, dropping");
            return Ok(());
        };
        let backend = &self.backends[origin.backend];
        if backend.alive {
            backend
                .send(Message::Response(Response {
                    id: origin.id,
                    payload: response.payload,
                }))
                .await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // backend -> proxy
    // ------------------------------------------------------------------

    async fn on_backend_message(
        &mut self,
        index: usize,
        message: Message,
    ) -> Result<(), ProxyError> {
        match message {
            Message::Response(response) => self.on_backend_response(index, response).await,
            Message::Notification(notification) => {
                self.on_backend_notification(index, notification).await
            }
            Message::Request(request) => self.on_backend_request(index, request).await,
        }
    }

    async fn on_backend_response(
        &mut self,
        index: usize,
        response: Response,
    ) -> Result<(), ProxyError> {
        let Some(pending) = self.backends[index].on_response(&response.id) else {
            warn!(
                backend = %self.backends[index].name,
                id = %response.id,
                "response for unknown id, dropping"
            );
            return Ok(());
        };
        trace!(
            backend = %self.backends[index].name,
            method = %pending.method,
            id = %pending.client_id,
            "backend response"
        );

        if self.aggregates.contains_key(&pending.client_id) {
            self.on_aggregate_response(index, pending.client_id, response.payload)
                .await
        } else {
            self.send_to_client(Message::Response(Response {
                id: pending.client_id,
                payload: response.payload,
            }))
            .await
        }
    }

    async fn on_aggregate_response(
        &mut self,
        index: usize,
        client_id: RpcId,
        payload: ResponsePayload,
    ) -> Result<(), ProxyError> {
        let Some(kind) = self.aggregates.get(&client_id).map(|a| a.kind) else {
            return Ok(());
        };
        match kind {
            AggregateKind::Initialize => match payload {
                ResponsePayload::Error(err) => {
                    self.abort_initialize(client_id, index, &err.message).await
                }
                ResponsePayload::Result(result) => {
                    self.backends[index].set_init_result(result);
                    if self.record_aggregate(&client_id, index, None).is_some() {
                        self.finish_initialize(client_id).await?;
                    }
                    Ok(())
                }
            },
            AggregateKind::Shutdown => {
                if let ResponsePayload::Error(err) = &payload {
                    warn!(
                        backend = %self.backends[index].name,
                        code = err.code,
                        message = %err.message,
                        "shutdown error from backend"
                    );
                }
                if self.record_aggregate(&client_id, index, None).is_some() {
                    self.finish_shutdown(client_id).await?;
                }
                Ok(())
            }
            AggregateKind::CodeAction => {
                let value = match payload {
                    ResponsePayload::Result(value) => Some(value),
                    ResponsePayload::Error(err) => {
                        warn!(
                            backend = %self.backends[index].name,
                            code = err.code,
                            message = %err.message,
                            "codeAction error from backend, contributing nothing"
                        );
                        None
                    }
                };
                if let Some(aggregate) = self.record_aggregate(&client_id, index, value) {
                    let merged = routing::merge_code_actions(&aggregate.slots);
                    self.respond_ok(client_id, merged).await?;
                }
                Ok(())
            }
        }
    }

    /// Record one backend's contribution; the finished aggregate comes back
    /// when the last one lands.
    fn record_aggregate(
        &mut self,
        client_id: &RpcId,
        index: usize,
        value: Option<Value>,
    ) -> Option<Aggregate> {
        let aggregate = self.aggregates.get_mut(client_id)?;
        if let Some(slot) = aggregate.slots.get_mut(index) {
            *slot = value;
        }
        aggregate.missing = aggregate.missing.saturating_sub(1);
        if aggregate.missing == 0 {
            self.aggregates.remove(client_id)
        } else {
            None
        }
    }

    async fn finish_initialize(&mut self, client_id: RpcId) -> Result<(), ProxyError> {
        let table = RoutingTable::resolve(&self.backends);
        let result = routing::synthesize_initialize_result(&self.backends, &table);
        self.routes = Some(table);
        self.phase = Phase::Running;
        info!("session initialized");
        self.respond_ok(client_id, result).await
    }

    async fn finish_shutdown(&mut self, client_id: RpcId) -> Result<(), ProxyError> {
        self.phase = Phase::ShutdownAcked;
        info!("shutdown acknowledged by all backends");
        self.respond_ok(client_id, Value::Null).await
    }

    async fn abort_initialize(
        &mut self,
        client_id: RpcId,
        index: usize,
        reason: &str,
    ) -> Result<(), ProxyError> {
        let name = self.backends[index].name.clone();
        error!(backend = %name, reason, "backend failed during initialize, aborting session");
        self.aggregates.remove(&client_id);
        self.respond_err(
            client_id,
            RpcError::internal_error(format!("backend {name} failed to initialize: {reason}")),
        )
        .await?;
        self.broadcast_exit().await;
        self.phase = Phase::Exited;
        Ok(())
    }

    async fn on_backend_notification(
        &mut self,
        index: usize,
        notification: Notification,
    ) -> Result<(), ProxyError> {
        if notification.method == PUBLISH_DIAGNOSTICS {
            if !self.backends[index].config.use_diagnostics {
                debug!(backend = %self.backends[index].name, "dropping diagnostics");
                return Ok(());
            }
            if let Some(uri) = notification
                .params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str)
            {
                let diagnostics = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("diagnostics"))
                    .cloned()
                    .unwrap_or_else(|| json!([]));
                self.diagnostics[index].insert(uri.to_string(), diagnostics);
            }
        }
        // logMessage, showMessage, $/progress, telemetry and anything
        // unknown pass through unchanged
        self.send_to_client(Message::Notification(notification)).await
    }

    /// Server-initiated request (workspace/configuration,
    /// window/workDoneProgress/create, ...): mint a client-facing id and
    /// remember the way back.
    async fn on_backend_request(
        &mut self,
        index: usize,
        request: Request,
    ) -> Result<(), ProxyError> {
        let proxy_id = self.next_client_facing_id;
        self.next_client_facing_id += 1;
        debug!(
            backend = %self.backends[index].name,
            method = %request.method,
            proxy_id,
            "forwarding server-initiated request"
        );
        self.server_requests.insert(
            proxy_id,
            ServerRequestOrigin {
                backend: index,
                id: request.id,
            },
        );
        self.send_to_client(Message::request(
            RpcId::Number(proxy_id),
            request.method,
            request.params,
        ))
        .await
    }

    // ------------------------------------------------------------------
    // failures
    // ------------------------------------------------------------------

    async fn on_backend_failure(
        &mut self,
        index: usize,
        error: Option<lspmux_protocol::ProtocolError>,
    ) -> Result<(), ProxyError> {
        if self.phase == Phase::Exited || !self.backends[index].alive {
            return Ok(());
        }
        self.backends[index].mark_dead();
        let name = self.backends[index].name.clone();
        match &error {
            Some(err) => error!(backend = %name, error = %err, "backend stream failed"),
            None => warn!(backend = %name, "backend stream closed"),
        }

        if self.phase == Phase::Uninitialized {
            // nothing to answer yet, but the session cannot start anymore
            error!(backend = %name, "backend died before initialization, terminating");
            self.broadcast_exit().await;
            self.phase = Phase::Exited;
            return Ok(());
        }

        // answer everything the dead backend still owed
        for entry in self.backends[index].drain_pending() {
            if self.aggregates.contains_key(&entry.client_id) {
                self.fail_aggregate_slot(index, entry).await?;
            } else {
                self.respond_err(
                    entry.client_id,
                    RpcError::internal_error(format!("backend {name} terminated")),
                )
                .await?;
            }
            if self.phase == Phase::Exited {
                return Ok(());
            }
        }

        // retract the dead backend's diagnostics
        let uris: Vec<String> = self.diagnostics[index].drain().map(|(uri, _)| uri).collect();
        for uri in uris {
            self.send_to_client(Message::notification(
                PUBLISH_DIAGNOSTICS,
                Some(json!({ "uri": uri, "diagnostics": [] })),
            ))
            .await?;
        }

        if index == PRIMARY {
            error!("primary backend died, terminating session");
            for i in 0..self.backends.len() {
                for entry in self.backends[i].drain_pending() {
                    self.aggregates.remove(&entry.client_id);
                    self.respond_err(
                        entry.client_id,
                        RpcError::internal_error("primary backend terminated"),
                    )
                    .await?;
                }
            }
            self.broadcast_exit().await;
            self.phase = Phase::Exited;
            return Ok(());
        }

        // exclude the dead backend from future routing decisions
        if self.routes.is_some() {
            self.routes = Some(RoutingTable::resolve(&self.backends));
        }
        Ok(())
    }

    /// A dead backend counts as having answered its share of an aggregate.
    async fn fail_aggregate_slot(
        &mut self,
        index: usize,
        entry: PendingRequest,
    ) -> Result<(), ProxyError> {
        let Some(kind) = self.aggregates.get(&entry.client_id).map(|a| a.kind) else {
            return Ok(());
        };
        match kind {
            AggregateKind::Initialize => {
                self.abort_initialize(entry.client_id, index, "backend terminated")
                    .await
            }
            AggregateKind::Shutdown => {
                if self
                    .record_aggregate(&entry.client_id, index, None)
                    .is_some()
                {
                    self.finish_shutdown(entry.client_id).await?;
                }
                Ok(())
            }
            AggregateKind::CodeAction => {
                if let Some(aggregate) = self.record_aggregate(&entry.client_id, index, None) {
                    let merged = routing::merge_code_actions(&aggregate.slots);
                    self.respond_ok(entry.client_id, merged).await?;
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // plumbing
    // ------------------------------------------------------------------

    fn live_backends(&self) -> Vec<usize> {
        self.backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.alive)
            .map(|(index, _)| index)
            .collect()
    }

    async fn broadcast_exit(&mut self) {
        for backend in &mut self.backends {
            if backend.alive {
                backend.send_exit().await;
            }
        }
    }

    async fn respond_ok(&mut self, id: RpcId, result: Value) -> Result<(), ProxyError> {
        self.send_to_client(Message::response_ok(id, result)).await
    }

    async fn respond_err(&mut self, id: RpcId, error: RpcError) -> Result<(), ProxyError> {
        self.send_to_client(Message::response_err(id, error)).await
    }

    async fn send_to_client(&self, message: Message) -> Result<(), ProxyError> {
        self.client_tx
            .send(message)
            .await
            .map_err(|_| ProxyError::ChannelClosed)
    }
}

/// Per-backend `initialize` params: the client's params with
/// `initializationOptions` substituted. A configured value always wins; with
/// none configured the primary keeps the client's value and everyone else
/// gets null.
fn initialize_params(
    config: &ServerConfig,
    primary: bool,
    client_params: Option<&Value>,
) -> Value {
    substituted_params(config, primary, client_params, "initializationOptions")
}

/// Per-backend `workspace/didChangeConfiguration` params, same substitution
/// policy applied to the `settings` field.
fn configuration_params(
    config: &ServerConfig,
    primary: bool,
    client_params: Option<&Value>,
) -> Value {
    substituted_params(config, primary, client_params, "settings")
}

fn substituted_params(
    config: &ServerConfig,
    primary: bool,
    client_params: Option<&Value>,
    field: &str,
) -> Value {
    let mut params = client_params.cloned().unwrap_or_else(|| json!({}));
    if !params.is_object() {
        params = json!({});
    }
    if let Some(map) = params.as_object_mut() {
        if let Some(options) = &config.initialization_options {
            map.insert(field.to_string(), options.clone());
        } else if !primary {
            map.insert(field.to_string(), Value::Null);
        }
    }
    params
}
