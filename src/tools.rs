//! Tool registry: typed descriptors, schema-driven parameter validation,
//! and the per-tool handlers behind MCP `tools/call`.
//!
//! Dispatch is a map from name to handler; every handler owns its parameter
//! schema. Handlers never throw across the protocol boundary — failures
//! come back as `Err(text)` which the server renders as an error result
//! with a `# Error in <tool>` heading.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{self, AgentLimits, ToolCall};
use crate::config::{self, Provider};
use crate::git::GitInspector;
use crate::indexer;
use crate::llm;
use crate::retriever;
use crate::session::SessionStore;
use crate::vector_store::{filter_adjacent_chunks, PointPayload, VectorStore};

/// Entries returned by a directory listing before the truncation note.
const DIRECTORY_LISTING_CAP: usize = 50;

/// Deadline for ad-hoc summarization calls inside tool handlers.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state handed to every tool handler.
pub struct ToolContext {
    pub store: Arc<VectorStore>,
    pub sessions: Arc<SessionStore>,
    pub inspector: GitInspector,
    /// Whether the configured suggestion model answered its last probe.
    pub suggestion_available: AtomicBool,
}

impl ToolContext {
    pub fn new(store: Arc<VectorStore>, sessions: Arc<SessionStore>, inspector: GitInspector) -> Self {
        Self {
            store,
            sessions,
            inspector,
            suggestion_available: AtomicBool::new(false),
        }
    }

    pub fn model_available(&self) -> bool {
        self.suggestion_available.load(Ordering::Acquire)
    }

    pub fn set_model_available(&self, available: bool) {
        self.suggestion_available.store(available, Ordering::Release);
    }

    fn repo_path_string(&self) -> String {
        self.inspector.repo_path().to_string_lossy().to_string()
    }
}

/// A tool as advertised over `tools/list`.
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub requires_model: bool,
    pub schema: Value,
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "search_code",
            description: "Semantic search over indexed file contents, commits, and diffs. \
                          Iteratively refines the query until results are relevant. \
                          Returns scored snippets (summarized when a suggestion model is available).",
            requires_model: false,
            schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Natural-language search query." },
                    "sessionId": { "type": "string", "description": "Optional session to record the query under." }
                },
                "required": ["query"]
            }),
        },
        ToolDescriptor {
            name: "get_repository_context",
            description: "Aggregate view for a query: relevant files, the latest repository diff, \
                          and recent session queries. Summarized when a suggestion model is available.",
            requires_model: false,
            schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "sessionId": { "type": "string" }
                },
                "required": ["query"]
            }),
        },
        ToolDescriptor {
            name: "generate_suggestion",
            description: "Retrieval-augmented code suggestion for the query, grounded in the \
                          most relevant indexed snippets and the latest repository diff.",
            requires_model: true,
            schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "sessionId": { "type": "string" }
                },
                "required": ["query"]
            }),
        },
        ToolDescriptor {
            name: "get_changelog",
            description: "Return the repository's CHANGELOG.md verbatim, if present.",
            requires_model: false,
            schema: json!({ "type": "object", "properties": {}, "required": [] }),
        },
        ToolDescriptor {
            name: "analyze_code_problem",
            description: "Two-pass analysis of a code problem: root-cause analysis first, \
                          then a step-by-step implementation plan.",
            requires_model: true,
            schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Description of the problem." },
                    "sessionId": { "type": "string" }
                },
                "required": ["query"]
            }),
        },
        ToolDescriptor {
            name: "agent_query",
            description: "Run the multi-step agent loop: the model plans, calls tools, and \
                          synthesizes an answer with full session context.",
            requires_model: true,
            schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "sessionId": { "type": "string" }
                },
                "required": ["query"]
            }),
        },
        ToolDescriptor {
            name: "request_additional_context",
            description: "Fetch more context mid-reasoning. context_type selects the expansion: \
                          MORE_SEARCH_RESULTS (re-search with an elevated limit), \
                          FULL_FILE_CONTENT (read one file, summarized/truncated past the threshold), \
                          DIRECTORY_LISTING (entries with type tags, capped at 50), \
                          ADJACENT_FILE_CHUNKS (the indexed chunks neighboring chunk_index).",
            requires_model: false,
            schema: json!({
                "type": "object",
                "properties": {
                    "context_type": {
                        "type": "string",
                        "enum": ["MORE_SEARCH_RESULTS", "FULL_FILE_CONTENT", "DIRECTORY_LISTING", "ADJACENT_FILE_CHUNKS"]
                    },
                    "query_or_path": { "type": "string", "description": "Search query or repo-relative path, per context_type." },
                    "chunk_index": { "type": "integer", "description": "Required for ADJACENT_FILE_CHUNKS." },
                    "reasoning": { "type": "string", "description": "Why the extra context is needed." },
                    "sessionId": { "type": "string" }
                },
                "required": ["context_type", "query_or_path"]
            }),
        },
        ToolDescriptor {
            name: "request_more_processing_steps",
            description: "Ask the agent loop to raise its step budget up to the absolute maximum. \
                          Only meaningful inside an agent run.",
            requires_model: false,
            schema: json!({
                "type": "object",
                "properties": {
                    "reasoning": { "type": "string", "description": "Why more steps are needed." }
                },
                "required": ["reasoning"]
            }),
        },
        ToolDescriptor {
            name: "switch_suggestion_model",
            description: "Point the suggestion capability at a different model (and optionally \
                          provider). Clears cached provider instances and verifies the new \
                          configuration.",
            requires_model: false,
            schema: json!({
                "type": "object",
                "properties": {
                    "model": { "type": "string" },
                    "provider": { "type": "string", "description": "ollama | openai | deepseek | gemini | claude" }
                },
                "required": ["model"]
            }),
        },
        ToolDescriptor {
            name: "get_indexing_status",
            description: "Snapshot of the background indexing pipeline's progress.",
            requires_model: false,
            schema: json!({ "type": "object", "properties": {}, "required": [] }),
        },
        ToolDescriptor {
            name: "trigger_repository_update",
            description: "Start a re-index of the repository. Rejected while a run is active.",
            requires_model: false,
            schema: json!({ "type": "object", "properties": {}, "required": [] }),
        },
    ]
}

// ── Schema validation ────────────────────────────────────────────────────

/// Validate `args` against a descriptor schema: required keys must be
/// present and every provided property must match its declared JSON type.
pub fn validate_params(schema: &Value, args: &Value) -> Result<(), String> {
    let empty = serde_json::Map::new();
    let args_obj = args.as_object().unwrap_or(&empty);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(key) {
                return Err(format!("missing required parameter '{key}'"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args_obj {
            let Some(prop) = props.get(key) else {
                continue; // tolerate extra parameters
            };
            let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !ok {
                return Err(format!("parameter '{key}' must be of type {expected}"));
            }
            if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
                if !allowed.contains(value) {
                    let options: Vec<String> =
                        allowed.iter().filter_map(|v| v.as_str().map(String::from)).collect();
                    return Err(format!(
                        "parameter '{key}' must be one of: {}",
                        options.join(", ")
                    ));
                }
            }
        }
    }
    Ok(())
}

// ── Dispatch ─────────────────────────────────────────────────────────────

/// Entry point used by the MCP server. Handles every tool, including
/// `agent_query`, which spins up the agent loop with a recursion-safe
/// dispatcher.
pub async fn dispatch_tool(ctx: &Arc<ToolContext>, name: &str, args: &Value) -> Result<String, String> {
    let descriptor = descriptors()
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| {
            format!(
                "Unknown tool '{name}'. Available tools: {}.",
                descriptors().iter().map(|d| d.name).collect::<Vec<_>>().join(", ")
            )
        })?;

    if descriptor.requires_model && !ctx.model_available() {
        return Err(format!(
            "Tool '{name}' requires a suggestion model, but none is reachable. \
             Check the provider configuration or use switch_suggestion_model."
        ));
    }
    validate_params(&descriptor.schema, args)?;

    if name == "agent_query" {
        return handle_agent_query(ctx, args).await;
    }
    dispatch_tool_inner(ctx, name, args).await
}

/// Dispatch for every tool except `agent_query` — also the surface the
/// agent loop itself uses, so an agent cannot recurse into itself.
async fn dispatch_tool_inner(
    ctx: &Arc<ToolContext>,
    name: &str,
    args: &Value,
) -> Result<String, String> {
    match name {
        "search_code" => handle_search_code(ctx, args).await,
        "get_repository_context" => handle_repository_context(ctx, args).await,
        "generate_suggestion" => handle_generate_suggestion(ctx, args).await,
        "get_changelog" => Ok(read_changelog(ctx.inspector.repo_path())),
        "analyze_code_problem" => handle_analyze_code_problem(ctx, args).await,
        "request_additional_context" => handle_additional_context(ctx, args).await,
        "request_more_processing_steps" => {
            let reasoning = args.get("reasoning").and_then(Value::as_str).unwrap_or("");
            Ok(format!(
                "Acknowledged: processing step budget raised toward the absolute maximum. \
                 Reason given: {reasoning}"
            ))
        }
        "switch_suggestion_model" => handle_switch_model(ctx, args).await,
        "get_indexing_status" => serde_json::to_string_pretty(&indexer::status_snapshot())
            .map_err(|e| format!("failed to serialize indexing status: {e}")),
        "trigger_repository_update" => match indexer::try_spawn(
            Arc::clone(&ctx.store),
            ctx.inspector.clone(),
        ) {
            Ok(()) => Ok("Re-indexing started in the background. \
                          Poll get_indexing_status for progress."
                .to_string()),
            Err(busy) => Err(busy.to_string()),
        },
        other => Err(format!("Unknown tool '{other}'.")),
    }
}

/// Production bridge between the agent loop and the registry.
pub struct RegistryDispatcher {
    ctx: Arc<ToolContext>,
}

impl RegistryDispatcher {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl agent::ToolDispatcher for RegistryDispatcher {
    fn render_tool_guide(&self, model_available: bool) -> String {
        let mut out = String::new();
        for d in descriptors() {
            if d.name == "agent_query" {
                continue; // the loop must not spawn nested loops
            }
            if d.requires_model && !model_available {
                continue;
            }
            let params = d
                .schema
                .get("properties")
                .and_then(Value::as_object)
                .map(|p| p.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            out.push_str(&format!("- {} ({}): {}\n", d.name, params, d.description));
        }
        out
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<String, String> {
        if call.tool == "agent_query" {
            return Err("agent_query cannot be invoked from inside the agent loop".to_string());
        }
        let descriptor = descriptors()
            .into_iter()
            .find(|d| d.name == call.tool)
            .ok_or_else(|| format!("Unknown tool '{}'.", call.tool))?;
        if descriptor.requires_model && !self.ctx.model_available() {
            return Err(format!("Tool '{}' requires a suggestion model.", call.tool));
        }
        validate_params(&descriptor.schema, &call.parameters)?;
        dispatch_tool_inner(&self.ctx, &call.tool, &call.parameters).await
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn result_lines(results: &[crate::vector_store::ScoredPoint]) -> Vec<String> {
    results
        .iter()
        .filter_map(|r| {
            let payload = r.payload.as_ref()?;
            let label = match payload {
                PointPayload::FileChunk { filepath, .. } => filepath.clone(),
                PointPayload::CommitInfo { commit_oid, .. } => format!("commit {commit_oid}"),
                PointPayload::DiffChunk { commit_oid, filepath, .. } => {
                    format!("diff {filepath} @ {commit_oid}")
                }
            };
            Some(format!("{label} (score {:.3})", r.score))
        })
        .collect()
}

/// Summarize `text` through the suggestion model when available, otherwise
/// truncate at `threshold`. Used for long snippets, files, and diffs.
async fn summarize_or_truncate(ctx: &ToolContext, text: &str, threshold: usize) -> String {
    if text.chars().count() <= threshold {
        return text.to_string();
    }
    if ctx.model_available() {
        if let Ok(provider) = llm::suggestion_provider() {
            let prompt = format!(
                "Summarize the following content in a few sentences, keeping identifiers \
                 and file names intact:\n\n{text}"
            );
            if let Ok(Ok(summary)) =
                tokio::time::timeout(SUMMARY_TIMEOUT, provider.generate_text(&prompt)).await
            {
                return format!("[Summarized] {summary}");
            }
        }
    }
    let truncated: String = text.chars().take(threshold).collect();
    format!("{truncated}\n... [truncated]")
}

async fn handle_search_code(ctx: &Arc<ToolContext>, args: &Value) -> Result<String, String> {
    let query = arg_str(args, "query").ok_or("parameter 'query' must be a non-empty string")?;
    let session = ctx
        .sessions
        .get_or_create(arg_str(args, "sessionId"), Some(ctx.repo_path_string().as_str()))
        .map_err(|e| e.to_string())?;

    let refined = retriever::search_with_refinement(&ctx.store, query, None, None, None, 0.7)
        .await
        .map_err(|e| format!("search failed: {e:#}"))?;

    let lines = result_lines(&refined.results);
    ctx.sessions
        .add_query(&session.id, query, lines.clone(), refined.relevance_score)
        .map_err(|e| e.to_string())?;
    let files: Vec<String> = refined
        .results
        .iter()
        .filter_map(|r| r.payload.as_ref().and_then(|p| p.filepath()).map(String::from))
        .collect();
    let _ = ctx.sessions.update_context(&session.id, files, None);

    let cfg = config::get();
    let mut out = format!(
        "# Search Results for: {query}\n\nRefined query: {}\nRelevance: {:.3} \
         ({} refinement(s))\n",
        refined.refined_query, refined.relevance_score, refined.refinement_count
    );
    if refined.results.is_empty() {
        out.push_str("\nNo results. The index may still be building — check get_indexing_status.\n");
    }
    for result in &refined.results {
        let Some(payload) = result.payload.as_ref() else {
            continue;
        };
        let heading = match payload {
            PointPayload::FileChunk { filepath, chunk_index, total_chunks, .. } => {
                format!("{} (chunk {}/{})", filepath, chunk_index + 1, total_chunks)
            }
            PointPayload::CommitInfo { commit_oid, commit_date, .. } => {
                format!("commit {commit_oid} ({commit_date})")
            }
            PointPayload::DiffChunk { filepath, commit_oid, change_type, .. } => {
                format!("diff {} @ {} ({})", filepath, commit_oid, change_type.as_str())
            }
        };
        let snippet = summarize_or_truncate(
            ctx,
            payload.content_text(),
            cfg.query.max_snippet_length_no_summary,
        )
        .await;
        out.push_str(&format!("\n## {heading} — score {:.3}\n{snippet}\n", result.score));
    }
    out.push_str(&format!("\nSession: {}\n", session.id));
    Ok(out)
}

async fn handle_repository_context(ctx: &Arc<ToolContext>, args: &Value) -> Result<String, String> {
    let query = arg_str(args, "query").ok_or("parameter 'query' must be a non-empty string")?;
    let session = ctx
        .sessions
        .get_or_create(arg_str(args, "sessionId"), Some(ctx.repo_path_string().as_str()))
        .map_err(|e| e.to_string())?;
    let cfg = config::get();

    let refined = retriever::search_with_refinement(&ctx.store, query, None, None, None, 0.7)
        .await
        .map_err(|e| format!("search failed: {e:#}"))?;
    let diff = ctx.inspector.repository_diff(cfg.query.max_diff_length_for_context);
    let recent = ctx
        .sessions
        .recent_queries(&session.id, 5)
        .unwrap_or_default();

    ctx.sessions
        .add_query(&session.id, query, result_lines(&refined.results), refined.relevance_score)
        .map_err(|e| e.to_string())?;
    let _ = ctx.sessions.update_context(&session.id, Vec::new(), Some(diff.clone()));

    let mut out = format!("# Repository Context for: {query}\n");

    out.push_str("\n## Recent Changes\n");
    out.push_str(&summarize_or_truncate(ctx, &diff, cfg.query.max_diff_length_for_context).await);
    out.push('\n');

    out.push_str("\n## Relevant Files\n");
    if refined.results.is_empty() {
        out.push_str("(no indexed content matched)\n");
    }
    for line in result_lines(&refined.results) {
        out.push_str(&format!("- {line}\n"));
    }

    if !recent.is_empty() {
        out.push_str("\n## Recent Queries\n");
        for q in &recent {
            out.push_str(&format!("- {} (relevance {:.3})\n", q.query, q.relevance_score));
        }
    }

    // A model, when reachable, gets the last word: a compact narrative
    // summary on top of the raw sections.
    if ctx.model_available() {
        if let Ok(provider) = llm::suggestion_provider() {
            let prompt = format!(
                "Summarize this repository context for the query \"{query}\" in one short \
                 paragraph:\n\n{out}"
            );
            if let Ok(Ok(summary)) =
                tokio::time::timeout(SUMMARY_TIMEOUT, provider.generate_text(&prompt)).await
            {
                out.push_str(&format!("\n## Summary\n{summary}\n"));
            }
        }
    }

    out.push_str(&format!("\nSession: {}\n", session.id));
    Ok(out)
}

async fn handle_generate_suggestion(ctx: &Arc<ToolContext>, args: &Value) -> Result<String, String> {
    let query = arg_str(args, "query").ok_or("parameter 'query' must be a non-empty string")?;
    let session = ctx
        .sessions
        .get_or_create(arg_str(args, "sessionId"), Some(ctx.repo_path_string().as_str()))
        .map_err(|e| e.to_string())?;
    let cfg = config::get();

    let refined = retriever::search_with_refinement(&ctx.store, query, None, None, None, 0.7)
        .await
        .map_err(|e| format!("search failed: {e:#}"))?;

    let mut context_blocks = String::new();
    for result in refined.results.iter().take(cfg.query.max_files_for_suggestion_context) {
        let Some(payload) = result.payload.as_ref() else {
            continue;
        };
        let label = payload.filepath().unwrap_or("commit metadata");
        context_blocks.push_str(&format!("--- {label} ---\n{}\n\n", payload.content_text()));
    }
    let diff = ctx.inspector.repository_diff(cfg.query.max_diff_length_for_context);

    let provider = llm::suggestion_provider().map_err(|e| e.to_string())?;
    let prompt = format!(
        "You are assisting with a code repository.\n\nQuery:\n{query}\n\n\
         Relevant code context:\n{context_blocks}\nRecent repository changes:\n{diff}\n\n\
         Provide a concrete, actionable suggestion with code where appropriate."
    );
    let suggestion = provider
        .generate_text(&prompt)
        .await
        .map_err(|e| format!("suggestion generation failed: {e}"))?;

    ctx.sessions
        .add_suggestion(&session.id, query, &suggestion)
        .map_err(|e| e.to_string())?;
    ctx.sessions
        .add_query(&session.id, query, result_lines(&refined.results), refined.relevance_score)
        .map_err(|e| e.to_string())?;

    Ok(format!(
        "# Suggestion for: {query}\n\n{suggestion}\n\nSession: {}\n",
        session.id
    ))
}

async fn handle_analyze_code_problem(ctx: &Arc<ToolContext>, args: &Value) -> Result<String, String> {
    let query = arg_str(args, "query").ok_or("parameter 'query' must be a non-empty string")?;
    let session = ctx
        .sessions
        .get_or_create(arg_str(args, "sessionId"), Some(ctx.repo_path_string().as_str()))
        .map_err(|e| e.to_string())?;
    let cfg = config::get();

    let refined = retriever::search_with_refinement(&ctx.store, query, None, None, None, 0.7)
        .await
        .map_err(|e| format!("search failed: {e:#}"))?;
    let mut context_blocks = String::new();
    for result in refined.results.iter().take(cfg.query.max_files_for_suggestion_context) {
        if let Some(payload) = result.payload.as_ref() {
            context_blocks.push_str(&format!(
                "--- {} ---\n{}\n\n",
                payload.filepath().unwrap_or("commit metadata"),
                payload.content_text()
            ));
        }
    }

    let provider = llm::suggestion_provider().map_err(|e| e.to_string())?;

    // Pass 1: analysis.
    let analysis = provider
        .generate_text(&format!(
            "Analyze this code problem. Identify likely root causes and affected \
             components. Do not propose fixes yet.\n\nProblem:\n{query}\n\n\
             Code context:\n{context_blocks}"
        ))
        .await
        .map_err(|e| format!("analysis pass failed: {e}"))?;

    // Pass 2: implementation plan grounded in the analysis.
    let plan = provider
        .generate_text(&format!(
            "Based on the following analysis, produce a step-by-step implementation \
             plan with concrete code changes.\n\nProblem:\n{query}\n\n\
             Analysis:\n{analysis}"
        ))
        .await
        .map_err(|e| format!("planning pass failed: {e}"))?;

    let out = format!(
        "# Code Problem Analysis\n\n## Analysis\n{analysis}\n\n## Implementation Plan\n{plan}\n\n\
         Session: {}\n",
        session.id
    );
    ctx.sessions
        .add_suggestion(&session.id, query, &out)
        .map_err(|e| e.to_string())?;
    Ok(out)
}

async fn handle_agent_query(ctx: &Arc<ToolContext>, args: &Value) -> Result<String, String> {
    let query = arg_str(args, "query").ok_or("parameter 'query' must be a non-empty string")?;
    let provider = llm::suggestion_provider().map_err(|e| e.to_string())?;
    let limits = AgentLimits::from_config(&config::get());
    let dispatcher = RegistryDispatcher::new(Arc::clone(ctx));

    let outcome = agent::run_agent_loop(
        &dispatcher,
        provider,
        &ctx.sessions,
        &ctx.repo_path_string(),
        query,
        arg_str(args, "sessionId"),
        ctx.model_available(),
        limits,
    )
    .await?;

    Ok(format!(
        "# Agent Response\n\n{}\n\n---\nSteps used: {}\nSession: {}\n",
        outcome.final_response,
        outcome.steps.len(),
        outcome.session_id
    ))
}

async fn handle_additional_context(ctx: &Arc<ToolContext>, args: &Value) -> Result<String, String> {
    let context_type = arg_str(args, "context_type").unwrap_or_default();
    let query_or_path =
        arg_str(args, "query_or_path").ok_or("parameter 'query_or_path' must be a non-empty string")?;
    let cfg = config::get();

    match context_type {
        "MORE_SEARCH_RESULTS" => {
            let elevated = cfg.query.search_limit_default * 3;
            let refined = retriever::search_with_refinement(
                &ctx.store,
                query_or_path,
                None,
                Some(elevated),
                None,
                0.7,
            )
            .await
            .map_err(|e| format!("search failed: {e:#}"))?;
            let mut out = format!(
                "# Additional Search Results for: {query_or_path}\n(limit raised to {elevated})\n\n"
            );
            for line in result_lines(&refined.results) {
                out.push_str(&format!("- {line}\n"));
            }
            if refined.results.is_empty() {
                out.push_str("No additional results found.\n");
            }
            Ok(out)
        }
        "FULL_FILE_CONTENT" => {
            let abs = resolve_repo_file(ctx.inspector.repo_path(), query_or_path)?;
            let content = std::fs::read_to_string(&abs)
                .map_err(|e| format!("could not read '{query_or_path}': {e}"))?;
            let body =
                summarize_or_truncate(ctx, &content, cfg.query.max_snippet_length_no_summary).await;
            Ok(format!("# File: {query_or_path}\n\n{body}\n"))
        }
        "DIRECTORY_LISTING" => directory_listing(ctx.inspector.repo_path(), query_or_path),
        "ADJACENT_FILE_CHUNKS" => {
            let Some(chunk_index) = args.get("chunk_index").and_then(Value::as_u64) else {
                return Err(
                    "ADJACENT_FILE_CHUNKS requires 'chunk_index' (the chunk whose neighbors you want)"
                        .to_string(),
                );
            };
            let chunk_index = chunk_index as usize;
            let mut wanted: Vec<usize> = Vec::new();
            if chunk_index > 0 {
                wanted.push(chunk_index - 1);
            }
            wanted.push(chunk_index + 1);

            let (points, _) = ctx
                .store
                .scroll(Some(filter_adjacent_chunks(query_or_path, &wanted)), 16, None)
                .await
                .map_err(|e| format!("scroll failed: {e}"))?;

            let mut found: Vec<(usize, String)> = points
                .into_iter()
                .filter_map(|p| match p.payload {
                    Some(PointPayload::FileChunk { chunk_index, file_content_chunk, .. }) => {
                        Some((chunk_index, file_content_chunk))
                    }
                    _ => None,
                })
                .collect();
            found.sort_by_key(|(i, _)| *i);

            let mut out = format!(
                "# Adjacent chunks of {query_or_path} around index {chunk_index}\n"
            );
            for want in &wanted {
                match found.iter().find(|(i, _)| i == want) {
                    Some((i, content)) => out.push_str(&format!("\n## Chunk {i}\n{content}\n")),
                    None => out.push_str(&format!(
                        "\n## Chunk {want}\n(not present in the index — likely past the end of the file)\n"
                    )),
                }
            }
            Ok(out)
        }
        other => Err(format!(
            "unknown context_type '{other}'. Valid values: MORE_SEARCH_RESULTS, \
             FULL_FILE_CONTENT, DIRECTORY_LISTING, ADJACENT_FILE_CHUNKS."
        )),
    }
}

async fn handle_switch_model(ctx: &Arc<ToolContext>, args: &Value) -> Result<String, String> {
    let model = arg_str(args, "model").ok_or("parameter 'model' must be a non-empty string")?;
    let provider = match arg_str(args, "provider") {
        Some(raw) => Some(Provider::parse(raw).ok_or_else(|| {
            format!("unknown provider '{raw}'. Valid: ollama, openai, deepseek, gemini, claude.")
        })?),
        None => None,
    };

    let updated = config::switch_suggestion(provider, model);
    llm::clear_provider_cache();

    let mut out = format!(
        "Suggestion model switched to {} / {}.\n",
        updated.suggestion_provider.as_str(),
        updated.suggestion_model
    );

    match llm::suggestion_provider() {
        Ok(instance) => {
            let reachable = instance.check_connection().await;
            ctx.set_model_available(reachable);
            if reachable {
                out.push_str("Provider verified: connection OK.\n");
            } else {
                out.push_str(
                    "Warning: the provider did not answer a connection probe; \
                     suggestion tools stay disabled until it does.\n",
                );
            }
        }
        Err(e @ llm::LlmError::MissingApiKey { .. }) => {
            ctx.set_model_available(false);
            out.push_str(&format!("Warning: {e}. Set the key and switch again.\n"));
        }
        Err(e) => {
            ctx.set_model_available(false);
            out.push_str(&format!("Warning: provider could not be constructed: {e}\n"));
        }
    }
    Ok(out)
}

// ── Filesystem helpers (path-guarded) ────────────────────────────────────

/// Resolve a repo-relative path, rejecting traversal and symlink escapes.
pub(crate) fn resolve_repo_file(repo_root: &Path, rel: &str) -> Result<PathBuf, String> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(format!("'{rel}' must be a repo-relative path"));
    }
    if rel_path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(format!("'{rel}' attempts to traverse outside the repository"));
    }

    let joined = repo_root.join(rel_path);
    let canonical = joined
        .canonicalize()
        .map_err(|_| format!("'{rel}' does not exist in the repository"))?;
    let canonical_root = repo_root
        .canonicalize()
        .map_err(|e| format!("repository root is unreadable: {e}"))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(format!("'{rel}' resolves outside the repository"));
    }
    if !canonical.is_file() {
        return Err(format!("'{rel}' is not a regular file"));
    }
    Ok(canonical)
}

/// Entries with type tags, capped with a truncation note.
fn directory_listing(repo_root: &Path, rel: &str) -> Result<String, String> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(format!("'{rel}' must be a repo-relative path without traversal"));
    }
    let abs = repo_root.join(rel_path);
    let canonical = abs
        .canonicalize()
        .map_err(|_| format!("directory '{rel}' does not exist"))?;
    let canonical_root = repo_root
        .canonicalize()
        .map_err(|e| format!("repository root is unreadable: {e}"))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(format!("'{rel}' resolves outside the repository"));
    }
    if !canonical.is_dir() {
        return Err(format!("'{rel}' is not a directory"));
    }

    let mut entries: Vec<String> = Vec::new();
    let read = std::fs::read_dir(&canonical).map_err(|e| format!("read_dir failed: {e}"))?;
    for entry in read.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let tag = match entry.file_type() {
            Ok(t) if t.is_dir() => "[dir] ",
            Ok(t) if t.is_symlink() => "[link]",
            _ => "[file]",
        };
        entries.push(format!("{tag} {name}"));
    }
    entries.sort();

    let total = entries.len();
    let mut out = format!("# Directory listing: {rel}\n\n");
    for entry in entries.iter().take(DIRECTORY_LISTING_CAP) {
        out.push_str(entry);
        out.push('\n');
    }
    if total > DIRECTORY_LISTING_CAP {
        out.push_str(&format!(
            "... truncated: showing {DIRECTORY_LISTING_CAP} of {total} entries\n"
        ));
    }
    Ok(out)
}

/// CHANGELOG.md verbatim, or the fixed absence message.
fn read_changelog(repo_root: &Path) -> String {
    match std::fs::read_to_string(repo_root.join("CHANGELOG.md")) {
        Ok(text) => text,
        Err(_) => "No CHANGELOG.md found in the repository root.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ToolDispatcher;

    #[test]
    fn every_required_tool_is_registered() {
        let names: Vec<&str> = descriptors().iter().map(|d| d.name).collect();
        for required in [
            "search_code",
            "get_repository_context",
            "generate_suggestion",
            "get_changelog",
            "analyze_code_problem",
            "agent_query",
            "request_additional_context",
            "request_more_processing_steps",
            "switch_suggestion_model",
            "get_indexing_status",
            "trigger_repository_update",
        ] {
            assert!(names.contains(&required), "missing tool: {required}");
        }
    }

    #[test]
    fn model_gated_tools_are_marked() {
        for d in descriptors() {
            let should_require = matches!(
                d.name,
                "generate_suggestion" | "analyze_code_problem" | "agent_query"
            );
            assert_eq!(d.requires_model, should_require, "tool {}", d.name);
        }
    }

    #[test]
    fn validation_enforces_required_and_types() {
        let schema = json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "chunk_index": { "type": "integer" }
            },
            "required": ["query"]
        });

        assert!(validate_params(&schema, &json!({ "query": "x" })).is_ok());
        assert!(validate_params(&schema, &json!({ "query": "x", "chunk_index": 2 })).is_ok());

        let missing = validate_params(&schema, &json!({})).unwrap_err();
        assert!(missing.contains("query"));

        let wrong_type = validate_params(&schema, &json!({ "query": 42 })).unwrap_err();
        assert!(wrong_type.contains("string"));

        let wrong_int =
            validate_params(&schema, &json!({ "query": "x", "chunk_index": "two" })).unwrap_err();
        assert!(wrong_int.contains("integer"));
    }

    #[test]
    fn validation_enforces_enums() {
        let schema = descriptors()
            .into_iter()
            .find(|d| d.name == "request_additional_context")
            .unwrap()
            .schema;
        let err = validate_params(
            &schema,
            &json!({ "context_type": "EVERYTHING", "query_or_path": "x" }),
        )
        .unwrap_err();
        assert!(err.contains("must be one of"), "got: {err}");
    }

    #[test]
    fn path_guard_rejects_traversal_and_absolute() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inside.txt"), "ok").unwrap();

        assert!(resolve_repo_file(dir.path(), "inside.txt").is_ok());
        assert!(resolve_repo_file(dir.path(), "../outside.txt").is_err());
        assert!(resolve_repo_file(dir.path(), "/etc/passwd").is_err());
        assert!(resolve_repo_file(dir.path(), "missing.txt").is_err());

        // Directories are not files.
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        assert!(resolve_repo_file(dir.path(), "sub").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn path_guard_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let repo = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), repo.path().join("leak"))
            .unwrap();

        let err = resolve_repo_file(repo.path(), "leak").unwrap_err();
        assert!(err.contains("outside"), "got: {err}");
    }

    #[test]
    fn directory_listing_caps_entries() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..60 {
            std::fs::write(dir.path().join(format!("f{i:03}.txt")), "x").unwrap();
        }
        let listing = directory_listing(dir.path(), ".").unwrap();
        assert!(listing.contains("f000.txt"));
        assert!(listing.contains("truncated: showing 50 of 60"));
        assert!(!listing.contains("f059.txt"), "entries past the cap must be cut");
    }

    #[test]
    fn changelog_fallback_message() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            read_changelog(dir.path()),
            "No CHANGELOG.md found in the repository root."
        );
        std::fs::write(dir.path().join("CHANGELOG.md"), "## 1.0.0\n- shipped\n").unwrap();
        assert_eq!(read_changelog(dir.path()), "## 1.0.0\n- shipped\n");
    }

    #[test]
    fn agent_tool_guide_hides_agent_query_and_model_tools() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ToolContext::new(
            Arc::new(VectorStore::new("http://127.0.0.1:6333", "test", 4)),
            Arc::new(SessionStore::new()),
            GitInspector::new(dir.path(), 3),
        ));
        let dispatcher = RegistryDispatcher::new(ctx);

        let without_model = dispatcher.render_tool_guide(false);
        assert!(without_model.contains("search_code"));
        assert!(!without_model.contains("agent_query"));
        assert!(!without_model.contains("generate_suggestion"));

        let with_model = dispatcher.render_tool_guide(true);
        assert!(with_model.contains("generate_suggestion"));
        assert!(!with_model.contains("agent_query"));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_textual_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ToolContext::new(
            Arc::new(VectorStore::new("http://127.0.0.1:6333", "test", 4)),
            Arc::new(SessionStore::new()),
            GitInspector::new(dir.path(), 3),
        ));
        let err = dispatch_tool(&ctx, "definitely_not_a_tool", &json!({})).await.unwrap_err();
        assert!(err.contains("Unknown tool"), "got: {err}");
        assert!(err.contains("search_code"), "should list available tools: {err}");
    }

    #[tokio::test]
    async fn model_required_tools_error_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ToolContext::new(
            Arc::new(VectorStore::new("http://127.0.0.1:6333", "test", 4)),
            Arc::new(SessionStore::new()),
            GitInspector::new(dir.path(), 3),
        ));
        let err = dispatch_tool(&ctx, "generate_suggestion", &json!({ "query": "x" }))
            .await
            .unwrap_err();
        assert!(err.contains("requires a suggestion model"), "got: {err}");
    }

    #[tokio::test]
    async fn step_extension_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ToolContext::new(
            Arc::new(VectorStore::new("http://127.0.0.1:6333", "test", 4)),
            Arc::new(SessionStore::new()),
            GitInspector::new(dir.path(), 3),
        ));
        let out = dispatch_tool(
            &ctx,
            "request_more_processing_steps",
            &json!({ "reasoning": "complex multi-file question" }),
        )
        .await
        .unwrap();
        assert!(out.contains("Acknowledged"));
        assert!(out.contains("complex multi-file question"));
    }

    #[tokio::test]
    async fn wrong_context_type_lists_valid_options() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ToolContext::new(
            Arc::new(VectorStore::new("http://127.0.0.1:6333", "test", 4)),
            Arc::new(SessionStore::new()),
            GitInspector::new(dir.path(), 3),
        ));
        // Bypass schema-level enum validation to exercise the handler's own
        // guard via the inner dispatcher.
        let err = handle_additional_context(
            &ctx,
            &json!({ "context_type": "EVERYTHING", "query_or_path": "x" }),
        )
        .await
        .unwrap_err();
        assert!(err.contains("MORE_SEARCH_RESULTS"), "got: {err}");
    }
}
