//! End-to-end proxy scenarios over in-memory pipes.
//!
//! Each test runs the real router with fake peers on both sides: a scripted
//! editor client and one scripted language server per configured backend,
//! all speaking framed LSP over `tokio::io::duplex` streams.

use lspmux::backend::Backend;
use lspmux::config::ServerConfig;
use lspmux::router::Router;
use lspmux::transport::{self, Endpoint, Source, QUEUE_DEPTH};
use lspmux_protocol::{
    Message, MessageReader, MessageWriter, Request, ResponsePayload, RpcError, RpcId,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn within<T, F: std::future::Future<Output = T>>(future: F) -> T {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("timed out waiting for proxy")
}

/// One scripted end of a framed LSP stream.
struct Peer {
    reader: MessageReader<BufReader<ReadHalf<DuplexStream>>>,
    writer: MessageWriter<WriteHalf<DuplexStream>>,
}

impl Peer {
    fn new(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(BufReader::new(read)),
            writer: MessageWriter::new(write),
        }
    }

    async fn send(&mut self, message: Message) {
        within(self.writer.write(&message)).await.expect("write failed");
    }

    async fn recv(&mut self) -> Message {
        within(self.reader.read())
            .await
            .expect("read failed")
            .expect("stream closed unexpectedly")
    }

    async fn request(&mut self, id: i64, method: &str, params: Value) {
        self.send(Message::request(RpcId::Number(id), method, Some(params)))
            .await;
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) {
        self.send(Message::notification(method, params)).await;
    }

    async fn expect_request(&mut self, method: &str) -> Request {
        match self.recv().await {
            Message::Request(request) => {
                assert_eq!(request.method, method, "unexpected request method");
                request
            }
            other => panic!("expected {method} request, got {other:?}"),
        }
    }

    async fn expect_notification(&mut self, method: &str) -> Option<Value> {
        match self.recv().await {
            Message::Notification(notification) => {
                assert_eq!(notification.method, method, "unexpected notification");
                notification.params
            }
            other => panic!("expected {method} notification, got {other:?}"),
        }
    }

    async fn expect_response(&mut self, id: RpcId) -> ResponsePayload {
        match self.recv().await {
            Message::Response(response) => {
                assert_eq!(response.id, id, "response for unexpected id");
                response.payload
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    async fn expect_result(&mut self, id: i64) -> Value {
        match self.expect_response(RpcId::Number(id)).await {
            ResponsePayload::Result(value) => value,
            ResponsePayload::Error(error) => panic!("expected result, got error {error:?}"),
        }
    }

    async fn expect_error(&mut self, id: i64) -> RpcError {
        match self.expect_response(RpcId::Number(id)).await {
            ResponsePayload::Error(error) => error,
            ResponsePayload::Result(value) => panic!("expected error, got result {value}"),
        }
    }

    async fn expect_silence(&mut self) {
        let outcome = tokio::time::timeout(Duration::from_millis(100), self.reader.read()).await;
        assert!(outcome.is_err(), "expected no message, got {outcome:?}");
    }

    async fn respond_ok(&mut self, id: RpcId, result: Value) {
        self.send(Message::response_ok(id, result)).await;
    }

    async fn respond_err(&mut self, id: RpcId, error: RpcError) {
        self.send(Message::response_err(id, error)).await;
    }

    /// Answer the proxy's `initialize` with the given capabilities.
    async fn serve_initialize(&mut self, capabilities: Value) {
        let request = self.expect_request("initialize").await;
        self.respond_ok(request.id, json!({ "capabilities": capabilities }))
            .await;
    }
}

struct TestProxy {
    client: Peer,
    backends: Vec<Peer>,
    handle: JoinHandle<Result<i32, lspmux::ProxyError>>,
}

impl TestProxy {
    /// Wire up the router with in-memory streams instead of processes and
    /// sockets.
    fn start(configs: Vec<ServerConfig>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);

        let (client_stream, proxy_side) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(proxy_side);
        let client_tx = transport::start_io(
            Source::Client,
            Endpoint::from_pair(Box::new(read), Box::new(write)),
            event_tx.clone(),
        );

        let mut backends = Vec::new();
        let mut peers = Vec::new();
        for (index, config) in configs.into_iter().enumerate() {
            let (backend_stream, proxy_side) = tokio::io::duplex(64 * 1024);
            let (read, write) = tokio::io::split(proxy_side);
            let tx = transport::start_io(
                Source::Backend(index),
                Endpoint::from_pair(Box::new(read), Box::new(write)),
                event_tx.clone(),
            );
            backends.push(Backend::new(config, tx));
            peers.push(Peer::new(backend_stream));
        }
        drop(event_tx);

        let handle = tokio::spawn(Router::new(backends, client_tx, event_rx).run());
        Self {
            client: Peer::new(client_stream),
            backends: peers,
            handle,
        }
    }

    /// Run the full initialize handshake and return the synthesized result.
    async fn initialize(&mut self, capabilities: Vec<Value>) -> Value {
        self.client
            .request(1, "initialize", json!({ "processId": 4242 }))
            .await;
        for (peer, caps) in self.backends.iter_mut().zip(capabilities) {
            peer.serve_initialize(caps).await;
        }
        let result = self.client.expect_result(1).await;

        self.client.notify("initialized", Some(json!({}))).await;
        for peer in &mut self.backends {
            peer.expect_notification("initialized").await;
        }
        result
    }

    async fn exit_code(self) -> i32 {
        within(self.handle)
            .await
            .expect("router task panicked")
            .expect("router failed")
    }
}

fn cmd(name: &str) -> ServerConfig {
    ServerConfig {
        cmd: Some(name.to_string()),
        ..Default::default()
    }
}

// ----------------------------------------------------------------------
// scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn completion_routed_to_flagged_backend() {
    let mut b = cmd("b");
    b.use_completion = true;
    let mut proxy = TestProxy::start(vec![cmd("a"), b]);

    let result = proxy
        .initialize(vec![
            json!({ "completionProvider": {} }),
            json!({ "completionProvider": { "triggerCharacters": ["."] } }),
        ])
        .await;

    // synthesized initialize result carries the flagged backend's provider
    assert_eq!(
        result["capabilities"]["completionProvider"],
        json!({ "triggerCharacters": ["."] })
    );

    proxy
        .client
        .request(7, "textDocument/completion", json!({ "position": {} }))
        .await;

    let forwarded = proxy.backends[1].expect_request("textDocument/completion").await;
    assert_ne!(forwarded.id, RpcId::Number(7), "backend ids are proxy-local");
    proxy.backends[1]
        .respond_ok(forwarded.id, json!([{ "label": "from_b" }]))
        .await;

    assert_eq!(
        proxy.client.expect_result(7).await,
        json!([{ "label": "from_b" }])
    );

    // the primary never saw the completion: the next thing on its stream is
    // this broadcast
    proxy
        .client
        .notify("textDocument/didOpen", Some(json!({ "textDocument": { "uri": "file:///x" } })))
        .await;
    proxy.backends[0].expect_notification("textDocument/didOpen").await;
}

#[tokio::test]
async fn formatting_falls_back_past_incapable_primary() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);
    proxy
        .initialize(vec![
            json!({}),
            json!({ "documentFormattingProvider": true }),
        ])
        .await;

    proxy
        .client
        .request(11, "textDocument/formatting", json!({ "options": {} }))
        .await;

    let forwarded = proxy.backends[1].expect_request("textDocument/formatting").await;
    proxy.backends[1].respond_ok(forwarded.id, json!([])).await;
    assert_eq!(proxy.client.expect_result(11).await, json!([]));
}

#[tokio::test]
async fn formatting_unsupported_everywhere_goes_to_primary() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);
    proxy.initialize(vec![json!({}), json!({})]).await;

    proxy
        .client
        .request(12, "textDocument/formatting", json!({}))
        .await;

    // the primary answers, presumably with method-not-found, relayed as-is
    let forwarded = proxy.backends[0].expect_request("textDocument/formatting").await;
    proxy.backends[0]
        .respond_err(forwarded.id, RpcError::method_not_found("unhandled method"))
        .await;

    let error = proxy.client.expect_error(12).await;
    assert_eq!(error.code, -32601);
}

#[tokio::test]
async fn diagnostics_filtered_by_backend_flag() {
    let mut b = cmd("b");
    b.use_diagnostics = false;
    let mut proxy = TestProxy::start(vec![cmd("a"), b]);
    proxy.initialize(vec![json!({}), json!({})]).await;

    let muted = json!({ "uri": "file:///x", "diagnostics": [{ "message": "from b" }] });
    proxy.backends[1]
        .notify("textDocument/publishDiagnostics", Some(muted))
        .await;

    let kept = json!({ "uri": "file:///x", "diagnostics": [{ "message": "from a" }] });
    proxy.backends[0]
        .notify("textDocument/publishDiagnostics", Some(kept.clone()))
        .await;

    // only the primary's publication comes through, unchanged
    let params = proxy
        .client
        .expect_notification("textDocument/publishDiagnostics")
        .await;
    assert_eq!(params, Some(kept));
    proxy.client.expect_silence().await;
}

#[tokio::test]
async fn code_action_results_merge_in_configured_order() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);
    proxy
        .initialize(vec![
            json!({ "codeActionProvider": true }),
            json!({ "codeActionProvider": true }),
        ])
        .await;

    proxy
        .client
        .request(9, "textDocument/codeAction", json!({ "range": {} }))
        .await;

    let to_a = proxy.backends[0].expect_request("textDocument/codeAction").await;
    let to_b = proxy.backends[1].expect_request("textDocument/codeAction").await;

    // respond out of order; the merge is still in configured order
    proxy.backends[1]
        .respond_ok(to_b.id, json!([{ "title": "b1" }]))
        .await;
    proxy.backends[0]
        .respond_ok(to_a.id, json!([{ "title": "a1" }, { "title": "a2" }]))
        .await;

    assert_eq!(
        proxy.client.expect_result(9).await,
        json!([{ "title": "a1" }, { "title": "a2" }, { "title": "b1" }])
    );
}

#[tokio::test]
async fn execute_command_routed_by_command_name() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);
    proxy
        .initialize(vec![
            json!({ "executeCommandProvider": { "commands": ["fmt"] } }),
            json!({ "executeCommandProvider": { "commands": ["lint"] } }),
        ])
        .await;

    proxy
        .client
        .request(20, "workspace/executeCommand", json!({ "command": "lint" }))
        .await;
    let to_b = proxy.backends[1].expect_request("workspace/executeCommand").await;
    proxy.backends[1].respond_ok(to_b.id, json!(null)).await;
    assert_eq!(proxy.client.expect_result(20).await, Value::Null);

    proxy
        .client
        .request(21, "workspace/executeCommand", json!({ "command": "fmt" }))
        .await;
    let to_a = proxy.backends[0].expect_request("workspace/executeCommand").await;
    proxy.backends[0].respond_ok(to_a.id, json!(null)).await;
    assert_eq!(proxy.client.expect_result(21).await, Value::Null);

    // unknown command falls through to the primary, whose error is relayed
    proxy
        .client
        .request(22, "workspace/executeCommand", json!({ "command": "unknown" }))
        .await;
    let to_a = proxy.backends[0].expect_request("workspace/executeCommand").await;
    proxy.backends[0]
        .respond_err(to_a.id, RpcError::method_not_found("unknown command"))
        .await;
    assert_eq!(proxy.client.expect_error(22).await.code, -32601);
}

#[tokio::test]
async fn shutdown_waits_for_every_backend() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);
    proxy.initialize(vec![json!({}), json!({})]).await;

    proxy.client.request(99, "shutdown", json!(null)).await;

    let to_a = proxy.backends[0].expect_request("shutdown").await;
    let to_b = proxy.backends[1].expect_request("shutdown").await;

    proxy.backends[0].respond_ok(to_a.id, Value::Null).await;
    proxy.client.expect_silence().await;

    proxy.backends[1].respond_ok(to_b.id, Value::Null).await;
    assert_eq!(proxy.client.expect_result(99).await, Value::Null);

    proxy.client.notify("exit", None).await;
    proxy.backends[0].expect_notification("exit").await;
    proxy.backends[1].expect_notification("exit").await;

    assert_eq!(proxy.exit_code().await, 0);
}

// ----------------------------------------------------------------------
// lifecycle and substitution
// ----------------------------------------------------------------------

#[tokio::test]
async fn requests_before_initialize_are_rejected() {
    let mut proxy = TestProxy::start(vec![cmd("a")]);
    proxy
        .client
        .request(5, "textDocument/hover", json!({}))
        .await;
    assert_eq!(proxy.client.expect_error(5).await.code, -32002);
}

#[tokio::test]
async fn requests_after_shutdown_are_rejected() {
    let mut proxy = TestProxy::start(vec![cmd("a")]);
    proxy.initialize(vec![json!({})]).await;

    proxy.client.request(50, "shutdown", json!(null)).await;
    let to_a = proxy.backends[0].expect_request("shutdown").await;
    proxy.backends[0].respond_ok(to_a.id, Value::Null).await;
    proxy.client.expect_result(50).await;

    proxy
        .client
        .request(51, "textDocument/hover", json!({}))
        .await;
    assert_eq!(proxy.client.expect_error(51).await.code, -32600);
}

#[tokio::test]
async fn initialization_options_substituted_per_backend() {
    let mut b = cmd("b");
    b.initialization_options = Some(json!({ "configured": true }));
    let mut proxy = TestProxy::start(vec![cmd("a"), b, cmd("c")]);

    proxy
        .client
        .request(
            1,
            "initialize",
            json!({ "processId": 1, "initializationOptions": { "from": "client" } }),
        )
        .await;

    let to_a = proxy.backends[0].expect_request("initialize").await;
    assert_eq!(
        to_a.params.as_ref().unwrap()["initializationOptions"],
        json!({ "from": "client" }),
        "primary keeps the client's value"
    );

    let to_b = proxy.backends[1].expect_request("initialize").await;
    assert_eq!(
        to_b.params.as_ref().unwrap()["initializationOptions"],
        json!({ "configured": true }),
        "configured value wins"
    );

    let to_c = proxy.backends[2].expect_request("initialize").await;
    assert_eq!(
        to_c.params.as_ref().unwrap()["initializationOptions"],
        Value::Null,
        "unconfigured non-primary gets null"
    );

    for (peer, id) in proxy
        .backends
        .iter_mut()
        .zip([to_a.id, to_b.id, to_c.id])
    {
        peer.respond_ok(id, json!({ "capabilities": {} })).await;
    }
    proxy.client.expect_result(1).await;
}

#[tokio::test]
async fn did_change_configuration_substitutes_settings() {
    let mut b = cmd("b");
    b.initialization_options = Some(json!({ "lint": "strict" }));
    let mut proxy = TestProxy::start(vec![cmd("a"), b]);
    proxy.initialize(vec![json!({}), json!({})]).await;

    proxy
        .client
        .notify(
            "workspace/didChangeConfiguration",
            Some(json!({ "settings": { "from": "client" } })),
        )
        .await;

    let to_a = proxy.backends[0]
        .expect_notification("workspace/didChangeConfiguration")
        .await;
    assert_eq!(to_a.unwrap()["settings"], json!({ "from": "client" }));

    let to_b = proxy.backends[1]
        .expect_notification("workspace/didChangeConfiguration")
        .await;
    assert_eq!(to_b.unwrap()["settings"], json!({ "lint": "strict" }));
}

#[tokio::test]
async fn document_sync_broadcasts_in_client_order() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);
    proxy.initialize(vec![json!({}), json!({})]).await;

    for version in 1..=3 {
        proxy
            .client
            .notify(
                "textDocument/didChange",
                Some(json!({ "textDocument": { "uri": "file:///x", "version": version } })),
            )
            .await;
    }

    for peer in &mut proxy.backends {
        for version in 1..=3 {
            let params = peer.expect_notification("textDocument/didChange").await;
            assert_eq!(params.unwrap()["textDocument"]["version"], json!(version));
        }
    }
}

#[tokio::test]
async fn string_request_ids_preserved_for_client() {
    let mut proxy = TestProxy::start(vec![cmd("a")]);
    proxy.initialize(vec![json!({})]).await;

    proxy
        .client
        .send(Message::request(
            RpcId::String("q-1".to_string()),
            "textDocument/hover",
            Some(json!({})),
        ))
        .await;

    let forwarded = proxy.backends[0].expect_request("textDocument/hover").await;
    assert!(
        matches!(forwarded.id, RpcId::Number(_)),
        "backend side uses proxy-local integer ids"
    );
    proxy.backends[0]
        .respond_ok(forwarded.id, json!({ "contents": "doc" }))
        .await;

    let payload = proxy
        .client
        .expect_response(RpcId::String("q-1".to_string()))
        .await;
    assert_eq!(
        payload,
        ResponsePayload::Result(json!({ "contents": "doc" }))
    );
}

#[tokio::test]
async fn server_initiated_request_round_trips() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);
    proxy.initialize(vec![json!({}), json!({})]).await;

    proxy.backends[1]
        .send(Message::request(
            RpcId::Number(55),
            "workspace/configuration",
            Some(json!({ "items": [] })),
        ))
        .await;

    let seen = proxy.client.expect_request("workspace/configuration").await;
    proxy
        .client
        .send(Message::response_ok(seen.id, json!([{ "setting": 1 }])))
        .await;

    // the answer lands on the originating backend with its own id restored
    match proxy.backends[1].recv().await {
        Message::Response(response) => {
            assert_eq!(response.id, RpcId::Number(55));
            assert_eq!(
                response.payload,
                ResponsePayload::Result(json!([{ "setting": 1 }]))
            );
        }
        other => panic!("expected response, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_forwarded_to_owning_backend() {
    let mut b = cmd("b");
    b.use_completion = true;
    let mut proxy = TestProxy::start(vec![cmd("a"), b]);
    proxy
        .initialize(vec![json!({}), json!({ "completionProvider": {} })])
        .await;

    proxy
        .client
        .request(7, "textDocument/completion", json!({}))
        .await;
    let forwarded = proxy.backends[1].expect_request("textDocument/completion").await;

    proxy
        .client
        .notify("$/cancelRequest", Some(json!({ "id": 7 })))
        .await;
    let cancel = proxy.backends[1].expect_notification("$/cancelRequest").await;
    assert_eq!(cancel.unwrap()["id"], json!(forwarded_id_value(&forwarded.id)));

    proxy.backends[1]
        .respond_err(forwarded.id, RpcError::request_cancelled("cancelled"))
        .await;
    assert_eq!(proxy.client.expect_error(7).await.code, -32800);
}

fn forwarded_id_value(id: &RpcId) -> i64 {
    match id {
        RpcId::Number(n) => *n,
        RpcId::String(s) => panic!("expected numeric backend id, got {s:?}"),
    }
}

// ----------------------------------------------------------------------
// failure handling
// ----------------------------------------------------------------------

#[tokio::test]
async fn dead_backend_fails_pending_and_is_rerouted_around() {
    let mut b = cmd("b");
    b.use_completion = true;
    let mut proxy = TestProxy::start(vec![cmd("a"), b]);
    proxy
        .initialize(vec![
            json!({ "completionProvider": {} }),
            json!({ "completionProvider": {} }),
        ])
        .await;

    // b owns completion and has published diagnostics
    proxy.backends[1]
        .notify(
            "textDocument/publishDiagnostics",
            Some(json!({ "uri": "file:///x", "diagnostics": [{ "message": "stale" }] })),
        )
        .await;
    proxy
        .client
        .expect_notification("textDocument/publishDiagnostics")
        .await;

    proxy
        .client
        .request(30, "textDocument/completion", json!({}))
        .await;
    proxy.backends[1].expect_request("textDocument/completion").await;

    // b dies with the request in flight
    let dead = proxy.backends.remove(1);
    drop(dead);

    assert_eq!(proxy.client.expect_error(30).await.code, -32603);

    // its stale diagnostics are retracted
    let cleared = proxy
        .client
        .expect_notification("textDocument/publishDiagnostics")
        .await
        .unwrap();
    assert_eq!(cleared["uri"], json!("file:///x"));
    assert_eq!(cleared["diagnostics"], json!([]));

    // completion now routes to the surviving primary
    proxy
        .client
        .request(31, "textDocument/completion", json!({}))
        .await;
    let forwarded = proxy.backends[0].expect_request("textDocument/completion").await;
    proxy.backends[0].respond_ok(forwarded.id, json!([])).await;
    assert_eq!(proxy.client.expect_result(31).await, json!([]));
}

#[tokio::test]
async fn primary_death_terminates_session() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);
    proxy.initialize(vec![json!({}), json!({})]).await;

    let dead = proxy.backends.remove(0);
    drop(dead);

    // survivor is told to exit and the proxy leaves with a failure code
    proxy.backends[0].expect_notification("exit").await;
    assert_eq!(proxy.exit_code().await, 1);
}

#[tokio::test]
async fn backend_error_during_initialize_aborts_session() {
    let mut proxy = TestProxy::start(vec![cmd("a"), cmd("b")]);

    proxy.client.request(1, "initialize", json!({})).await;
    let to_a = proxy.backends[0].expect_request("initialize").await;
    let to_b = proxy.backends[1].expect_request("initialize").await;

    proxy.backends[0]
        .respond_ok(to_a.id, json!({ "capabilities": {} }))
        .await;
    proxy.backends[1]
        .respond_err(to_b.id, RpcError::internal_error("no workspace"))
        .await;

    let error = proxy.client.expect_error(1).await;
    assert_eq!(error.code, -32603);
    assert!(error.message.contains('b'), "error names the backend: {}", error.message);

    proxy.backends[0].expect_notification("exit").await;
    assert_eq!(proxy.exit_code().await, 1);
}

#[tokio::test]
async fn client_eof_broadcasts_exit() {
    let mut proxy = TestProxy::start(vec![cmd("a")]);
    proxy.initialize(vec![json!({})]).await;

    let TestProxy {
        client,
        mut backends,
        handle,
    } = proxy;
    drop(client);

    backends[0].expect_notification("exit").await;
    let code = within(handle)
        .await
        .expect("router task panicked")
        .expect("router failed");
    assert_eq!(code, 1);
}
