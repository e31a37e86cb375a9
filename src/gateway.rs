// Gateway
// Accepts connections, parses envelopes, dispatches on method, and maps
// broker errors to status codes. This is the only layer that turns a
// `BrokerError` into a number: the core raises kinds, the gateway speaks
// HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::errors::{BrokerError, BrokerResult};
use crate::ledger::CsvLedgerStore;
use crate::request::{Method, Request};
use crate::root_authority::RootAuthority;
use crate::tree_builder::TreeBuilder;

/// Upper bound on an accepted envelope; anything larger is a framing error.
const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub data_root: PathBuf,
    /// How long the accept loop waits before re-checking the shutdown flag.
    pub poll_interval: Duration,
}

/// A uniform JSON response: `statusCode` plus either `data` or `error`.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    body: Value,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            status: 200,
            body: json!({ "statusCode": 200, "data": data }),
        }
    }

    pub fn error(err: &BrokerError) -> Self {
        let status = err.status_code();
        Self {
            status,
            body: json!({ "statusCode": status, "error": err.to_string() }),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Serialize with the fixed response framing: the status line echoes
    /// the numeric code and the body is always JSON.
    pub fn to_bytes(&self) -> Vec<u8> {
        let data = serde_json::to_string_pretty(&self.body)
            .unwrap_or_else(|_| "{}".to_string());
        let mut header = format!("HTTP/1.1 {} SEE_BODY\r\n", self.status);
        header.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc3339()));
        header.push_str("Server: reserva\r\n");
        header.push_str(&format!("Content-Length: {}\r\n", data.len()));
        header.push_str("Connection: close\r\n");
        header.push_str("Content-Type: application/json\r\n");
        format!("{header}\r\n{data}").into_bytes()
    }
}

/// Method dispatch over a shared ledger store.
pub struct Gateway {
    store: Arc<CsvLedgerStore>,
}

impl Gateway {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            store: Arc::new(CsvLedgerStore::new(data_root.into())),
        }
    }

    pub fn store(&self) -> &CsvLedgerStore {
        &self.store
    }

    /// Parse and dispatch one raw envelope, normalizing every failure into
    /// a response.
    pub async fn handle(&self, bytes: &[u8]) -> Response {
        let mut request = match Request::parse(bytes) {
            Ok(request) => request,
            Err(err) => return Response::error(&err),
        };
        match self.dispatch(&mut request).await {
            Ok(data) => Response::success(data),
            Err(err) => {
                debug!(%err, method = request.method().as_str(), "request failed");
                Response::error(&err)
            }
        }
    }

    /// POST allocates, PUT builds an organization, GET queries a subtree.
    pub async fn dispatch(&self, request: &mut Request) -> BrokerResult<Value> {
        match request.method() {
            Method::Post => {
                request.validate()?;
                let root = RootAuthority::new(self.store.root())
                    .get_root(request)
                    .await?;
                root.call(request, self.store.as_ref()).await
            }
            Method::Put => TreeBuilder::new(&self.store).build(request).await,
            Method::Get => {
                request.validate()?;
                let recursive = request
                    .raw_request()
                    .get("recursive")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let entity_path = request.entity_path()?.to_string();
                let root = RootAuthority::new(self.store.root())
                    .get_root(request)
                    .await?;
                let entities = root.get_children_of(&entity_path, recursive)?;

                let mut results = Map::new();
                for entity in entities {
                    let value = match entity.query_data(self.store.as_ref()).await {
                        Ok((info, expended)) => {
                            json!({ "info": info, "expended": expended })
                        }
                        // Routing nodes cannot be queried; the reason is
                        // recorded inline instead of failing the subtree.
                        Err(err @ BrokerError::InvalidRequest(_)) => json!(err.to_string()),
                        Err(err) => return Err(err),
                    };
                    results.insert(entity.name().to_string(), value);
                }
                Ok(Value::Object(results))
            }
        }
    }
}

/// The accept loop: one tokio task per connection, a bounded accept
/// timeout so the shutdown flag is polled even when the listener is idle.
pub struct Server {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let gateway = Arc::new(Gateway::new(config.data_root.clone()));
        Self {
            config,
            gateway,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked once per poll interval; setting it stops the accept
    /// loop cooperatively.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub async fn serve(&self) -> Result<()> {
        let address = format!("{}:{}", self.config.ip, self.config.port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        self.run_on(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        info!(address = %listener.local_addr()?, "listening");
        while !self.shutdown.load(Ordering::Relaxed) {
            let accepted =
                match tokio::time::timeout(self.config.poll_interval, listener.accept()).await
                {
                    Err(_elapsed) => continue,
                    Ok(Err(err)) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                    Ok(Ok(accepted)) => accepted,
                };
            let (stream, peer) = accepted;
            debug!(%peer, "connection accepted");
            let gateway = Arc::clone(&self.gateway);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(gateway, stream, peer).await {
                    warn!(%peer, %err, "connection failed");
                }
            });
        }
        info!("server terminated");
        Ok(())
    }
}

async fn handle_connection(
    gateway: Arc<Gateway>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let bytes = read_envelope(&mut stream).await?;
    let response = gateway.handle(&bytes).await;
    debug!(%peer, status = response.status(), "responding");
    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read the head up to the blank line, then honor `Content-Length` when the
/// client sent one.
async fn read_envelope(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buffer);
        }
        buffer.extend_from_slice(&chunk[..n]);
        anyhow::ensure!(
            buffer.len() <= MAX_REQUEST_BYTES,
            "request exceeds {MAX_REQUEST_BYTES} bytes"
        );

        let Some(head_end) = find_blank_line(&buffer) else {
            continue;
        };
        let body_received = buffer.len() - head_end;
        match content_length(&buffer[..head_end]) {
            Some(expected) if body_received < expected => continue,
            _ => return Ok(buffer),
        }
    }
}

/// Byte offset just past the first `\r\n\r\n`.
fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn content_length(head: &[u8]) -> Option<usize> {
    let head = std::str::from_utf8(head).ok()?;
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
