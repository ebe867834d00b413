//! Unix socket JSON-RPC control server.
//!
//! Listens on ~/.keypool/keypool.sock for JSON-RPC 2.0 requests, one
//! object per line, each line at most 1 MiB. Local-only; the socket is
//! created owner-only (0600).
//!
//! Methods:
//! - `kp.stats`    — per-pool and aggregate usage
//! - `kp.keys`     — masked per-key snapshots, optionally for one `provider`
//! - `kp.generate` — run a generation request through a pool with failover

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::adapters::GenerateRequest;
use crate::pool::dispatch::{DispatchError, Dispatcher};
use crate::pool::registry::PoolRegistry;

/// Bound on a single request line; longer lines close the connection.
const MAX_REQUEST_BYTES: u64 = 1_048_576;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }
    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0".into(), result: None, error: Some(JsonRpcError { code, message }), id }
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct Server {
    socket_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    pulse_interval: Duration,
}

impl Server {
    pub fn new(socket_path: PathBuf, dispatcher: Arc<Dispatcher>, pulse_interval: Duration) -> Self {
        Self {
            socket_path,
            dispatcher,
            pulse_interval,
        }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "Control server listening");

        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let every = self.pulse_interval;
            tokio::spawn(async move { run_pulse(dispatcher, every).await });
        }

        loop {
            let (stream, _) = listener.accept().await?;
            let dispatcher = Arc::clone(&self.dispatcher);

            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                serve_connection(reader, writer, &dispatcher).await;
            });
        }
    }
}

/// Answer newline-delimited requests until EOF, an I/O error or an
/// oversized line.
async fn serve_connection<R, W>(reader: R, mut writer: W, dispatcher: &Dispatcher)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_REQUEST_BYTES);
        let response = match limited.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(n) if n as u64 >= MAX_REQUEST_BYTES && !line.ends_with('\n') => {
                warn!(bytes = n, "Request line too long, closing connection");
                let response = JsonRpcResponse::error(None, -32600, "Request too large".into());
                let _ = write_response(&mut writer, &response).await;
                break;
            }
            Ok(_) => handle_request(&line, dispatcher).await,
            Err(_) => break,
        };
        if write_response(&mut writer, &response).await.is_err() {
            break;
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &JsonRpcResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut resp_json = serde_json::to_string(response).unwrap_or_default();
    resp_json.push('\n');
    writer.write_all(resp_json.as_bytes()).await
}

/// Log every pool's stats on a fixed interval.
async fn run_pulse(dispatcher: Arc<Dispatcher>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip the immediate tick (no traffic yet)
    loop {
        interval.tick().await;
        for stats in dispatcher.registry().stats() {
            info!(
                provider = %stats.provider_class,
                keys = stats.key_count,
                requests_today = stats.total_requests_today,
                capacity = stats.total_daily_capacity,
                "Pool pulse"
            );
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

pub async fn handle_request(raw: &str, dispatcher: &Dispatcher) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)),
    };

    let params = req.params.unwrap_or(Value::Null);

    match req.method.as_str() {
        "kp.stats" => handle_stats(req.id, dispatcher.registry()),
        "kp.keys" => handle_keys(req.id, params, dispatcher.registry()),
        "kp.generate" => handle_generate(req.id, params, dispatcher).await,
        _ => {
            warn!(method = %req.method, "Unknown method");
            JsonRpcResponse::error(req.id, -32601, format!("Unknown method: {}", req.method))
        }
    }
}

fn handle_stats(id: Option<Value>, registry: &PoolRegistry) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        serde_json::json!({
            "pools": registry.stats(),
            "total": registry.aggregate(),
        }),
    )
}

fn handle_keys(id: Option<Value>, params: Value, registry: &PoolRegistry) -> JsonRpcResponse {
    let names = match params.get("provider").and_then(|v| v.as_str()) {
        Some(p) if registry.get(p).is_none() => {
            return JsonRpcResponse::error(id, -32602, format!("Unknown provider: {}", p));
        }
        Some(p) => vec![p.to_string()],
        None => registry.names(),
    };

    let mut pools = serde_json::Map::new();
    for name in names {
        if let Some(pool) = registry.get(&name) {
            pools.insert(name, serde_json::json!(pool.snapshot()));
        }
    }
    JsonRpcResponse::success(id, serde_json::json!({ "pools": pools }))
}

async fn handle_generate(id: Option<Value>, params: Value, dispatcher: &Dispatcher) -> JsonRpcResponse {
    let provider = match params.get("provider").and_then(|v| v.as_str()) {
        Some(p) => p.to_string(),
        None => return JsonRpcResponse::error(id, -32602, "Missing param: provider".into()),
    };
    let gen_req: GenerateRequest = match serde_json::from_value(params) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };

    match dispatcher.generate(&provider, &gen_req).await {
        Ok(resp) => match serde_json::to_value(resp) {
            Ok(v) => JsonRpcResponse::success(id, v),
            Err(e) => JsonRpcResponse::error(id, -32603, e.to_string()),
        },
        Err(e @ (DispatchError::UnknownProvider(_) | DispatchError::NoAdapter(_))) => {
            JsonRpcResponse::error(id, -32602, e.to_string())
        }
        Err(e) => JsonRpcResponse::error(id, -32000, e.to_string()),
    }
}
