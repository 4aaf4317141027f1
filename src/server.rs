//! Server host: MCP over stdio, utility HTTP, and single-instance
//! coordination.
//!
//! stdout carries line-delimited JSON-RPC 2.0 exclusively; all logging goes
//! to stderr. The stdio loop runs on a blocking thread and enters the
//! shared tokio runtime per request; the HTTP server and the indexing
//! pipeline run as background tasks on that runtime.
//!
//! Port-conflict protocol: if the utility port is taken, ping it with a
//! short deadline. A CodeCompass peer gets reported (with its indexing
//! status) and this process exits 0 — or, when requested, stays alive as a
//! relay proxy on a free port. Anything else holding the port is a fatal
//! startup error.

use anyhow::{anyhow, bail, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::io::BufRead;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::agent::AgentLimits;
use crate::config;
use crate::git::{self, GitInspector};
use crate::indexer;
use crate::llm;
use crate::session::SessionStore;
use crate::tools::{self, ToolContext};
use crate::vector_store::{VectorStore, VectorStoreError};

/// Peer-detection ping deadline; a peer still starting up that cannot
/// answer within this window is treated as a non-peer.
const PEER_PING_TIMEOUT: Duration = Duration::from_millis(500);

/// Deadline for a non-agentic tool invocation arriving directly over MCP.
/// `agent_query` budgets its own steps, so its deadline is derived from the
/// agent limits instead — see `tool_deadline`.
const MCP_TOOL_TIMEOUT: Duration = Duration::from_secs(90);

/// The outer deadline for one MCP `tools/call`. For `agent_query` the loop
/// may legitimately spend `absolute_max_steps` iterations of reasoning plus
/// tool dispatch, with a warm-up and a final-response generation on top, so
/// the wrapper is sized from the same config knobs the loop itself uses.
fn tool_deadline(name: &str) -> Duration {
    if name != "agent_query" {
        return MCP_TOOL_TIMEOUT;
    }
    let limits = AgentLimits::from_config(&config::get());
    let per_step = limits.reasoning_timeout.saturating_add(limits.tool_timeout);
    per_step
        .saturating_mul(limits.absolute_max_steps.min(u32::MAX as usize) as u32)
        .saturating_add(limits.reasoning_timeout.saturating_mul(2))
}

const SERVICE_NAME: &str = "CodeCompass";
const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub repo_path: PathBuf,
    /// Stay alive as a relay proxy when a peer already owns the port.
    pub proxy_on_conflict: bool,
}

/// Entry point called by `main`. `Err` means exit code 1; a detected peer
/// returns `Ok` so the process exits 0.
pub fn run(opts: ServerOptions) -> Result<()> {
    let cfg = config::load().map_err(|e| anyhow!("configuration error: {e}"))?;
    config::init(cfg.clone());

    let repo_path = opts
        .repo_path
        .canonicalize()
        .with_context(|| format!("repository path '{}' not found", opts.repo_path.display()))?;
    if !git::validate_repository(&repo_path) {
        bail!("'{}' is not a Git repository", repo_path.display());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(cfg, repo_path, opts.proxy_on_conflict))
}

async fn run_async(cfg: config::Config, repo_path: PathBuf, proxy_on_conflict: bool) -> Result<()> {
    // Bind first: the utility port doubles as the single-instance lock.
    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.http_port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            return on_port_conflict(cfg.http_port, proxy_on_conflict).await;
        }
        Err(e) => bail!("failed to bind utility port {}: {e}", cfg.http_port),
    };
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "utility HTTP listening");

    let store = Arc::new(VectorStore::new(
        &cfg.qdrant_host,
        &cfg.collection_name,
        cfg.embedding_dimension,
    ));
    match store.initialize().await {
        Ok(()) => {}
        Err(e @ VectorStoreError::ConfigMismatch { .. }) => {
            // Indexing into a collection built for another embedding space
            // would corrupt it; refuse to start.
            bail!("{e}");
        }
        Err(e) => {
            tracing::warn!(error = %e, "vector store not ready; indexing will retry");
        }
    }

    let inspector = GitInspector::new(&repo_path, cfg.indexing.diff_lines_of_context);
    let sessions = Arc::new(SessionStore::new());
    let ctx = Arc::new(ToolContext::new(
        Arc::clone(&store),
        sessions,
        inspector.clone(),
    ));

    // Probe the suggestion model once; tools gate themselves on the result.
    match llm::suggestion_provider() {
        Ok(provider) => {
            let available = provider.check_connection().await;
            ctx.set_model_available(available);
            tracing::info!(provider = provider.name(), available, "suggestion model probe");
        }
        Err(e) => tracing::warn!(error = %e, "suggestion provider unavailable"),
    }

    // Kick off the initial index in the background.
    if let Err(busy) = indexer::try_spawn(Arc::clone(&store), inspector) {
        tracing::warn!(error = %busy, "initial index not started");
    }

    let http_ctx = Arc::clone(&ctx);
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, http_router(http_ctx)).await {
            tracing::error!(error = %e, "utility HTTP server stopped");
        }
    });

    // MCP stdio loop on a blocking thread; handlers enter the runtime.
    let handle = tokio::runtime::Handle::current();
    let mcp_ctx = Arc::clone(&ctx);
    let mcp_task = tokio::task::spawn_blocking(move || run_stdio_loop(mcp_ctx, handle));

    tokio::select! {
        result = mcp_task => {
            match result {
                Ok(Ok(())) => tracing::info!("stdin closed; shutting down"),
                Ok(Err(e)) => tracing::error!(error = %e, "MCP loop failed"),
                Err(e) => tracing::error!(error = %e, "MCP loop panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received; stopping background work");
        }
    }

    http_task.abort();
    Ok(())
}

// ── Single-instance coordination ─────────────────────────────────────────

async fn on_port_conflict(port: u16, proxy_on_conflict: bool) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(PEER_PING_TIMEOUT)
        .build()
        .unwrap_or_default();

    let ping: Option<Value> = match client
        .get(format!("http://127.0.0.1:{port}/api/ping"))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
        _ => None,
    };

    let Some(body) = ping.filter(|b| b.get("service").and_then(Value::as_str) == Some(SERVICE_NAME))
    else {
        // Held by something that is not (or not yet) a CodeCompass peer.
        bail!(
            "utility port {port} is already in use by a process that is not {SERVICE_NAME}. \
             Stop it or set HTTP_PORT to a free port."
        );
    };

    let peer_version = body.get("version").and_then(Value::as_str).unwrap_or("unknown");
    let peer_status: Value = match client
        .get(format!("http://127.0.0.1:{port}/api/indexing-status"))
        .send()
        .await
    {
        Ok(resp) => resp.json().await.unwrap_or(json!({})),
        Err(_) => json!({}),
    };
    tracing::info!(
        peer_version,
        peer_status = %peer_status,
        "another {SERVICE_NAME} instance already owns port {port}"
    );

    if proxy_on_conflict {
        return run_relay_proxy(port).await;
    }

    eprintln!(
        "{SERVICE_NAME} v{peer_version} is already running on port {port}; this instance will exit."
    );
    Ok(())
}

struct ProxyState {
    client: reqwest::Client,
    peer_base: String,
}

/// Relay `/mcp`, `/api/ping`, and `/api/indexing-status` from a fresh
/// OS-assigned port to the detected peer.
async fn run_relay_proxy(peer_port: u16) -> Result<()> {
    let state = Arc::new(ProxyState {
        client: reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default(),
        peer_base: format!("http://127.0.0.1:{peer_port}"),
    });

    let app = Router::new()
        .route("/api/ping", get(proxy_ping))
        .route("/api/indexing-status", get(proxy_indexing_status))
        .route("/mcp", post(proxy_mcp))
        .with_state(state);

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, peer_port, "relay proxy forwarding to peer");
    eprintln!("Relay proxy listening on {local_addr}, forwarding to port {peer_port}.");

    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            result.context("relay proxy stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received; relay proxy shutting down");
        }
    }
    Ok(())
}

async fn proxy_forward_get(state: &ProxyState, path: &str) -> (StatusCode, String) {
    match state.client.get(format!("{}{path}", state.peer_base)).send().await {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, resp.text().await.unwrap_or_default())
        }
        Err(e) => (StatusCode::BAD_GATEWAY, format!("peer unreachable: {e}")),
    }
}

async fn proxy_ping(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    proxy_forward_get(&state, "/api/ping").await
}

async fn proxy_indexing_status(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    proxy_forward_get(&state, "/api/indexing-status").await
}

async fn proxy_mcp(State(state): State<Arc<ProxyState>>, body: String) -> impl IntoResponse {
    match state
        .client
        .post(format!("{}/mcp", state.peer_base))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, resp.text().await.unwrap_or_default())
        }
        Err(e) => (StatusCode::BAD_GATEWAY, format!("peer unreachable: {e}")),
    }
}

// ── Utility HTTP ─────────────────────────────────────────────────────────

fn http_router(ctx: Arc<ToolContext>) -> Router {
    Router::new()
        .route("/api/ping", get(api_ping))
        .route("/api/indexing-status", get(api_indexing_status))
        .route("/api/repository/notify-update", post(api_notify_update))
        .with_state(ctx)
}

async fn api_ping() -> Json<Value> {
    let status = indexer::status_snapshot();
    Json(json!({
        "service": SERVICE_NAME,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "indexing": status.status,
    }))
}

async fn api_indexing_status() -> Json<indexer::IndexingStatus> {
    Json(indexer::status_snapshot())
}

async fn api_notify_update(State(ctx): State<Arc<ToolContext>>) -> impl IntoResponse {
    match indexer::try_spawn(Arc::clone(&ctx.store), ctx.inspector.clone()) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": true, "message": "re-indexing started" })),
        ),
        Err(busy) => (
            StatusCode::CONFLICT,
            Json(json!({ "accepted": false, "error": busy.to_string() })),
        ),
    }
}

// ── MCP stdio ────────────────────────────────────────────────────────────

pub struct ServerState {
    ctx: Arc<ToolContext>,
    handle: tokio::runtime::Handle,
}

fn run_stdio_loop(ctx: Arc<ToolContext>, handle: tokio::runtime::Handle) -> Result<()> {
    let state = ServerState { ctx, handle };
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        // Notifications carry no "id" and get no reply.
        if msg.get("id").is_none() {
            continue;
        }

        let reply = state.handle_message(&msg);
        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }
    Ok(())
}

impl ServerState {
    fn handle_message(&self, msg: &Value) -> Value {
        let id = msg.get("id").cloned().unwrap_or(json!(null));
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
        let params = msg.get("params").cloned().unwrap_or(json!({}));

        match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": params
                        .get("protocolVersion")
                        .cloned()
                        .unwrap_or(json!(PROTOCOL_VERSION)),
                    "capabilities": {
                        "tools": { "listChanged": true },
                        "resources": {},
                        "prompts": {}
                    },
                    "serverInfo": {
                        "name": "codecompass",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }
            }),
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => self.tool_list(id),
            "tools/call" => self.tool_call(id, &params),
            "resources/list" => self.resource_list(id),
            "resources/read" => self.resource_read(id, &params),
            "prompts/list" => prompt_list(id),
            "prompts/get" => prompt_get(id, &params),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        }
    }

    fn tool_list(&self, id: Value) -> Value {
        let tools: Vec<Value> = tools::descriptors()
            .into_iter()
            .map(|d| {
                json!({
                    "name": d.name,
                    "description": d.description,
                    "inputSchema": d.schema,
                })
            })
            .collect();
        json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": tools } })
    }

    fn tool_call(&self, id: Value, params: &Value) -> Value {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("").to_string();
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        let ctx = Arc::clone(&self.ctx);
        let tool = name.clone();
        let deadline = tool_deadline(&name);
        let outcome = self.handle.block_on(async move {
            match tokio::time::timeout(deadline, tools::dispatch_tool(&ctx, &tool, &args)).await {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "tool '{tool}' exceeded the {}s deadline",
                    deadline.as_secs()
                )),
            }
        });

        match outcome {
            Ok(text) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [ { "type": "text", "text": text } ], "isError": false }
            }),
            Err(message) => {
                let text = format!("# Error in {name}\n\n{message}");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "content": [ { "type": "text", "text": text } ], "isError": true }
                })
            }
        }
    }

    fn resource_list(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "resources": [
                    { "uri": "repo://structure", "name": "Repository structure",
                      "description": "File paths at HEAD, one per line.", "mimeType": "text/plain" },
                    { "uri": "repo://health", "name": "Server health",
                      "description": "Liveness, indexing state, and model availability.", "mimeType": "application/json" },
                    { "uri": "repo://version", "name": "Server version", "mimeType": "text/plain" },
                    { "uri": "repo://files/{filepath}", "name": "File contents",
                      "description": "Contents of one repository file.", "mimeType": "text/plain" }
                ]
            }
        })
    }

    fn resource_read(&self, id: Value, params: &Value) -> Value {
        let uri = params.get("uri").and_then(Value::as_str).unwrap_or("");

        let outcome: Result<(&'static str, String), String> = match uri {
            "repo://structure" => self
                .ctx
                .inspector
                .list_head_files()
                .map(|files| ("text/plain", files.join("\n")))
                .map_err(|e| format!("failed to list files: {e:#}")),
            "repo://health" => {
                let status = indexer::status_snapshot();
                Ok((
                    "application/json",
                    json!({
                        "status": "ok",
                        "indexing": status.status,
                        "overallProgress": status.overall_progress,
                        "suggestionModelAvailable": self.ctx.model_available(),
                    })
                    .to_string(),
                ))
            }
            "repo://version" => Ok(("text/plain", env!("CARGO_PKG_VERSION").to_string())),
            other => match other.strip_prefix("repo://files/") {
                Some(rel) if !rel.is_empty() => {
                    tools::resolve_repo_file(self.ctx.inspector.repo_path(), rel).and_then(|abs| {
                        std::fs::read_to_string(&abs)
                            .map(|text| ("text/plain", text))
                            .map_err(|e| format!("could not read '{rel}': {e}"))
                    })
                }
                _ => Err(format!("unknown resource uri '{other}'")),
            },
        };

        match outcome {
            Ok((mime, text)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "contents": [ { "uri": uri, "mimeType": mime, "text": text } ] }
            }),
            Err(message) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32602, "message": message }
            }),
        }
    }
}

// ── Prompts ──────────────────────────────────────────────────────────────

const PROMPTS: &[(&str, &str)] = &[
    (
        "repository-context",
        "Summarize everything in the repository relevant to a question.",
    ),
    (
        "code-suggestion",
        "Generate a grounded code suggestion for a task.",
    ),
    (
        "code-analysis",
        "Analyze a code problem and plan a fix.",
    ),
];

fn render_prompt(name: &str, query: &str) -> Option<String> {
    match name {
        "repository-context" => Some(format!(
            "Use the repository tools (search_code, get_repository_context) to gather \
             context, then give a thorough overview of everything relevant to: {query}"
        )),
        "code-suggestion" => Some(format!(
            "Use search_code and generate_suggestion to produce a concrete, grounded \
             code suggestion for: {query}"
        )),
        "code-analysis" => Some(format!(
            "Use search_code and analyze_code_problem to diagnose the following issue \
             and propose an implementation plan: {query}"
        )),
        _ => None,
    }
}

fn prompt_list(id: Value) -> Value {
    let prompts: Vec<Value> = PROMPTS
        .iter()
        .map(|(name, description)| {
            json!({
                "name": name,
                "description": description,
                "arguments": [
                    { "name": "query", "description": "The question or task.", "required": true }
                ]
            })
        })
        .collect();
    json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": prompts } })
}

fn prompt_get(id: Value, params: &Value) -> Value {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let query = params
        .pointer("/arguments/query")
        .and_then(Value::as_str)
        .unwrap_or("");

    match render_prompt(name, query) {
        Some(text) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "messages": [
                    { "role": "user", "content": { "type": "text", "text": text } }
                ]
            }
        }),
        None => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32602, "message": format!("unknown prompt '{name}'") }
        }),
    }
}
