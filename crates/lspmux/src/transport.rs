//! Byte-stream endpoints and the pump tasks around them.
//!
//! Every stream (the client's stdio plus one per backend) gets a reader task
//! that decodes frames into the router's single event channel and a writer
//! task that drains a bounded FIFO queue. The queue bound is what applies
//! backpressure to the router when a peer is slow to read; the FIFO order is
//! what keeps broadcast notifications in client order per backend.

use crate::config::ServerConfig;
use crate::error::ProxyError;
use lspmux_protocol::{Message, MessageReader, MessageWriter, ProtocolError};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bound of every message queue (write FIFOs and the event channel).
pub const QUEUE_DEPTH: usize = 100;

/// How long a spawned server gets to exit on its own before being killed.
const CHILD_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Client,
    Backend(usize),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Client => f.write_str("client"),
            Source::Backend(index) => write!(f, "backend {index}"),
        }
    }
}

/// One entry of the router's totally ordered event stream.
#[derive(Debug)]
pub enum Event {
    /// A decoded message.
    Message(Source, Message),
    /// The stream ended cleanly at a frame boundary.
    Closed(Source),
    /// The stream produced garbage or died mid-frame.
    Failed(Source, ProtocolError),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected bidirectional byte stream, before the pump tasks take over.
pub struct Endpoint {
    reader: BoxedReader,
    writer: BoxedWriter,
    child: Option<Child>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("child", &self.child)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Open the endpoint a server entry describes: spawn the command or
    /// connect to the TCP address.
    pub async fn open(config: &ServerConfig) -> Result<Self, ProxyError> {
        match (&config.cmd, config.port) {
            (Some(cmd), _) => Self::spawn(cmd, &config.args),
            (None, Some(port)) => Self::connect(&config.host, port).await,
            // load() validation rules this out
            (None, None) => Err(ProxyError::BackendStart {
                name: config.name(),
                reason: "neither cmd nor port configured".to_string(),
            }),
        }
    }

    /// Spawn a child language server speaking LSP on its stdio. Its stderr
    /// passes through to ours.
    pub fn spawn(cmd: &str, args: &[String]) -> Result<Self, ProxyError> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ProxyError::BackendStart {
                name: cmd.to_string(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ProxyError::BackendStart {
            name: cmd.to_string(),
            reason: "no stdin handle".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ProxyError::BackendStart {
            name: cmd.to_string(),
            reason: "no stdout handle".to_string(),
        })?;

        debug!(command = cmd, ?args, "spawned backend");

        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    /// Connect to an externally started server over TCP.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ProxyError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProxyError::BackendStart {
                name: format!("{host}:{port}"),
                reason: e.to_string(),
            })?;
        let (reader, writer) = stream.into_split();

        debug!(host, port, "connected to backend");

        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        })
    }

    /// The client endpoint: our own stdin/stdout.
    pub fn stdio() -> Self {
        Self {
            reader: Box::new(tokio::io::stdin()),
            writer: Box::new(tokio::io::stdout()),
            child: None,
        }
    }

    /// Wrap an arbitrary stream pair (tests use in-memory pipes).
    pub fn from_pair(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            child: None,
        }
    }
}

/// Start the reader and writer tasks for one endpoint. Decoded messages and
/// the terminal condition go to `events`; the returned sender is the
/// endpoint's FIFO write queue.
pub fn start_io(
    source: Source,
    endpoint: Endpoint,
    events: mpsc::Sender<Event>,
) -> mpsc::Sender<Message> {
    let Endpoint {
        reader,
        writer,
        child,
    } = endpoint;

    tokio::spawn(async move {
        let mut reader = MessageReader::new(BufReader::new(reader));
        loop {
            match reader.read().await {
                Ok(Some(message)) => {
                    if events.send(Event::Message(source, message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = events.send(Event::Closed(source)).await;
                    break;
                }
                Err(error) => {
                    let _ = events.send(Event::Failed(source, error)).await;
                    break;
                }
            }
        }
    });

    let (tx, mut rx) = mpsc::channel::<Message>(QUEUE_DEPTH);
    tokio::spawn(async move {
        let mut writer = MessageWriter::new(writer);
        while let Some(message) = rx.recv().await {
            if let Err(error) = writer.write(&message).await {
                warn!(%source, error = %error, "write failed");
                break;
            }
        }
        // Queue closed: the session is done with this stream. A spawned
        // server just saw its stdin close (or an exit notification); give it
        // a moment before the kill.
        if let Some(mut child) = child {
            let _ = tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await;
            let _ = child.kill().await;
        }
    });

    tx
}
