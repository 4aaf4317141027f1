//! Bounded agentic reasoning loop.
//!
//! Each iteration asks the suggestion model for a reasoning step, parses
//! `TOOL_CALL:` lines out of the reply, dispatches them, and folds the
//! results back into the prompt. Two budgets bound the loop: the working
//! budget (`default_max_steps`, extendable once via
//! `request_more_processing_steps`) and the hard ceiling
//! (`absolute_max_steps`), which can never be exceeded.
//!
//! Every network interaction is wrapped in a deadline. A reasoning timeout
//! degrades to a fallback `search_code` call; a tool timeout records an
//! error note and the loop continues; a final-response timeout synthesizes
//! an answer from step previews.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::llm::LlmProvider;
use crate::session::{AgentStepRecord, SessionStore};

/// Tool name that raises the working step budget.
pub const EXTEND_STEPS_TOOL: &str = "request_more_processing_steps";

/// Appended when the loop ran into the hard ceiling.
pub const ABSOLUTE_MAX_NOTE: &str =
    "[Note: The agent utilized the maximum allowed processing steps.]";

/// Per-step output text folded back into the prompt is capped at this.
const STEP_OUTPUT_PROMPT_CAP: usize = 1_500;

/// Preview length per step when synthesizing a fallback final response.
const STEP_PREVIEW_CAP: usize = 240;

/// A tool invocation parsed from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub parameters: Value,
}

/// One executed step of the loop.
#[derive(Debug, Clone)]
pub struct AgentStep {
    pub tool: String,
    pub input: Value,
    pub output: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AgentLimits {
    pub default_max_steps: usize,
    pub absolute_max_steps: usize,
    pub reasoning_timeout: Duration,
    pub tool_timeout: Duration,
}

impl AgentLimits {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            default_max_steps: cfg.query.agent_default_max_steps,
            absolute_max_steps: cfg.query.agent_absolute_max_steps,
            reasoning_timeout: Duration::from_secs(cfg.query.agent_query_timeout_secs),
            tool_timeout: Duration::from_secs(cfg.query.agent_tool_timeout_secs),
        }
    }
}

#[derive(Debug)]
pub struct AgentOutcome {
    pub session_id: String,
    pub final_response: String,
    pub steps: Vec<AgentStep>,
    pub terminated_due_to_absolute_max: bool,
}

/// How the loop reaches tools. Production wraps the tool registry; tests
/// substitute a scripted stub.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Markdown guide of the tools the agent may call, filtered by whether a
    /// suggestion model is available.
    fn render_tool_guide(&self, model_available: bool) -> String;

    /// Execute one call; `Err` carries a textual error for the prompt.
    async fn dispatch(&self, call: &ToolCall) -> Result<String, String>;
}

// ── TOOL_CALL parsing ────────────────────────────────────────────────────

/// Scan model output for `TOOL_CALL:` lines. The remainder of each line
/// must be JSON with a string `tool` and an object `parameters`; anything
/// else is ignored.
pub fn parse_tool_calls(output: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix("TOOL_CALL:") else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(rest.trim()) else {
            continue;
        };
        let Some(tool) = value.get("tool").and_then(Value::as_str) else {
            continue;
        };
        let Some(params) = value.get("parameters").filter(|p| p.is_object()) else {
            continue;
        };
        calls.push(ToolCall {
            tool: tool.to_string(),
            parameters: params.clone(),
        });
    }
    calls
}

/// Inverse of `parse_tool_calls` for a single call.
pub fn render_tool_call(call: &ToolCall) -> String {
    format!(
        "TOOL_CALL: {}",
        json!({ "tool": call.tool, "parameters": call.parameters })
    )
}

fn build_system_prompt(tool_guide: &str) -> String {
    format!(
        "You are CodeCompass, an agent answering questions about a Git repository.\n\
         Work in steps. In each step you may call tools by emitting lines of the form:\n\
         TOOL_CALL: {{\"tool\": \"<name>\", \"parameters\": {{...}}}}\n\
         Each TOOL_CALL must be alone on its own line. When you have enough information,\n\
         reply with your final answer and no TOOL_CALL lines.\n\
         If you are running out of steps but need more, call {EXTEND_STEPS_TOOL}.\n\n\
         Available tools:\n{tool_guide}"
    )
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let cut: String = text.chars().take(cap).collect();
    format!("{cut}…")
}

/// Run the loop for one query.
#[allow(clippy::too_many_arguments)]
pub async fn run_agent_loop(
    dispatcher: &dyn ToolDispatcher,
    provider: Arc<dyn LlmProvider>,
    sessions: &SessionStore,
    repo_path: &str,
    query: &str,
    session_id: Option<&str>,
    suggestion_model_available: bool,
    limits: AgentLimits,
) -> Result<AgentOutcome, String> {
    // Connection check and warm-up are advisory: a cold model should not
    // kill the run, only slow its first step.
    if !provider.check_connection().await {
        tracing::warn!(provider = provider.name(), "provider connection check failed");
    }
    match tokio::time::timeout(
        limits.reasoning_timeout,
        provider.generate_text("Reply with OK."),
    )
    .await
    {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "agent warm-up generation failed"),
        Err(_) => tracing::warn!("agent warm-up generation timed out"),
    }

    let session = sessions
        .get_or_create(session_id, Some(repo_path))
        .map_err(|e| e.to_string())?;
    let session_id = session.id;

    let system_prompt = build_system_prompt(&dispatcher.render_tool_guide(suggestion_model_available));
    let mut user_prompt = format!("User query: {query}");

    let mut steps: Vec<AgentStep> = Vec::new();
    let mut current_max_steps = limits.default_max_steps;
    let mut final_response: Option<String> = None;
    let mut terminated_due_to_absolute_max = false;
    let mut step_index = 0usize;

    loop {
        if step_index >= limits.absolute_max_steps {
            terminated_due_to_absolute_max = true;
            break;
        }
        if step_index >= current_max_steps {
            break;
        }

        let prompt = format!("{system_prompt}\n\n{user_prompt}");
        let (reasoning, calls) = match tokio::time::timeout(
            limits.reasoning_timeout,
            provider.generate_text(&prompt),
        )
        .await
        {
            Ok(Ok(output)) => {
                let calls = parse_tool_calls(&output);
                (output, calls)
            }
            outcome => {
                // Timeout or provider error: degrade to a plain code search
                // for the original query so the loop keeps making progress.
                match outcome {
                    Ok(Err(e)) => tracing::warn!(error = %e, step_index, "reasoning call failed"),
                    _ => tracing::warn!(step_index, "reasoning call timed out"),
                }
                let fallback = ToolCall {
                    tool: "search_code".to_string(),
                    parameters: json!({ "query": query, "sessionId": session_id.clone() }),
                };
                (
                    "Reasoning unavailable; falling back to code search.".to_string(),
                    vec![fallback],
                )
            }
        };

        if calls.is_empty() {
            // No tool calls: the model's output is the final answer.
            final_response = Some(reasoning);
            break;
        }

        let mut extension_only = true;
        for call in &calls {
            if call.tool == EXTEND_STEPS_TOOL {
                if current_max_steps < limits.absolute_max_steps {
                    current_max_steps = limits.absolute_max_steps;
                    tracing::info!(current_max_steps, "agent step budget extended");
                }
                let output = match tokio::time::timeout(limits.tool_timeout, dispatcher.dispatch(call))
                    .await
                {
                    Ok(Ok(text)) => text,
                    Ok(Err(e)) => e,
                    Err(_) => "Step extension acknowledged.".to_string(),
                };
                steps.push(AgentStep {
                    tool: call.tool.clone(),
                    input: call.parameters.clone(),
                    output,
                    reasoning: reasoning.clone(),
                });
                continue;
            }
            extension_only = false;

            match tokio::time::timeout(limits.tool_timeout, dispatcher.dispatch(call)).await {
                Ok(Ok(output)) => {
                    user_prompt.push_str(&format!(
                        "\n\nStep {} — {} returned:\n{}",
                        step_index + 1,
                        call.tool,
                        truncate_chars(&output, STEP_OUTPUT_PROMPT_CAP)
                    ));
                    steps.push(AgentStep {
                        tool: call.tool.clone(),
                        input: call.parameters.clone(),
                        output,
                        reasoning: reasoning.clone(),
                    });
                }
                Ok(Err(e)) => {
                    user_prompt.push_str(&format!(
                        "\n\nStep {} — {} failed: {}",
                        step_index + 1,
                        call.tool,
                        truncate_chars(&e, STEP_OUTPUT_PROMPT_CAP)
                    ));
                    steps.push(AgentStep {
                        tool: call.tool.clone(),
                        input: call.parameters.clone(),
                        output: format!("Error: {e}"),
                        reasoning: reasoning.clone(),
                    });
                }
                Err(_) => {
                    tracing::warn!(tool = %call.tool, step_index, "tool call timed out");
                    user_prompt.push_str(&format!(
                        "\n\nStep {} — {} timed out.",
                        step_index + 1,
                        call.tool
                    ));
                    steps.push(AgentStep {
                        tool: call.tool.clone(),
                        input: call.parameters.clone(),
                        output: "Error: tool call timed out".to_string(),
                        reasoning: reasoning.clone(),
                    });
                }
            }
        }

        step_index += 1;

        // Last allowed step with real work done: ask for a wrap-up rather
        // than silently dropping the accumulated context. Extension-only
        // iterations skip this so an all-extension run surfaces the
        // absolute-cap note instead.
        if step_index >= current_max_steps && !extension_only && final_response.is_none() {
            let wrap_prompt = format!(
                "{user_prompt}\n\nYou have no processing steps left. \
                 Summarize what you have learned and answer the user query now."
            );
            let wrapped = tokio::time::timeout(
                limits.reasoning_timeout,
                provider.generate_text(&wrap_prompt),
            )
            .await;
            if let Ok(Ok(text)) = wrapped {
                final_response = Some(text);
            }
            break;
        }
    }

    // No final response yet: request one, falling back to a synthesis of
    // step previews when the model cannot deliver in time.
    let mut final_text = match final_response {
        Some(text) => text,
        None => {
            let request = format!(
                "{user_prompt}\n\nProvide your final answer to the user query now, \
                 without any TOOL_CALL lines."
            );
            match tokio::time::timeout(limits.reasoning_timeout, provider.generate_text(&request))
                .await
            {
                Ok(Ok(text)) => text,
                _ => synthesize_from_steps(&steps),
            }
        }
    };

    if terminated_due_to_absolute_max {
        final_text = format!("{final_text}\n\n{ABSOLUTE_MAX_NOTE}");
    }

    for step in &steps {
        let _ = sessions.add_agent_step(
            &session_id,
            AgentStepRecord {
                tool: step.tool.clone(),
                input: step.input.to_string(),
                output: step.output.clone(),
                reasoning: step.reasoning.clone(),
            },
        );
    }
    sessions
        .add_suggestion(&session_id, query, &final_text)
        .map_err(|e| e.to_string())?;

    Ok(AgentOutcome {
        session_id,
        final_response: final_text,
        steps,
        terminated_due_to_absolute_max,
    })
}

fn synthesize_from_steps(steps: &[AgentStep]) -> String {
    if steps.is_empty() {
        return "No tool results were gathered before the response deadline.".to_string();
    }
    let mut out = String::from("Partial answer assembled from gathered context:\n");
    for (i, step) in steps.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} → {}",
            i + 1,
            step.tool,
            truncate_chars(&step.output, STEP_PREVIEW_CAP)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvider {
        outputs: Mutex<VecDeque<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn new(outputs: &[&str]) -> Self {
            Self {
                outputs: Mutex::new(outputs.iter().map(|s| s.to_string()).collect()),
                delay: None,
            }
        }

        fn stalled() -> Self {
            Self {
                outputs: Mutex::new(VecDeque::new()),
                delay: Some(Duration::from_secs(30)),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn generate_embedding(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            Ok(vec![0.0; 4])
        }

        async fn generate_text(&self, _prompt: &str) -> Result<String, LlmError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut outputs = self.outputs.lock().unwrap();
            Ok(outputs.pop_front().unwrap_or_else(|| "done".to_string()))
        }

        async fn check_connection(&self) -> bool {
            true
        }
    }

    struct StubDispatcher {
        log: Mutex<Vec<ToolCall>>,
    }

    impl StubDispatcher {
        fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<ToolCall> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolDispatcher for StubDispatcher {
        fn render_tool_guide(&self, _model_available: bool) -> String {
            "- search_code: semantic search\n- request_more_processing_steps: extend budget".to_string()
        }

        async fn dispatch(&self, call: &ToolCall) -> Result<String, String> {
            self.log.lock().unwrap().push(call.clone());
            Ok(format!("ok: {}", call.tool))
        }
    }

    fn limits(default_max: usize, absolute_max: usize) -> AgentLimits {
        AgentLimits {
            default_max_steps: default_max,
            absolute_max_steps: absolute_max,
            reasoning_timeout: Duration::from_millis(200),
            tool_timeout: Duration::from_millis(200),
        }
    }

    fn ext_call() -> String {
        render_tool_call(&ToolCall {
            tool: EXTEND_STEPS_TOOL.to_string(),
            parameters: json!({ "reasoning": "need more" }),
        })
    }

    fn search_call() -> String {
        render_tool_call(&ToolCall {
            tool: "search_code".to_string(),
            parameters: json!({ "query": "retry logic" }),
        })
    }

    #[test]
    fn tool_call_render_parse_round_trip() {
        let call = ToolCall {
            tool: "search_code".to_string(),
            parameters: json!({ "query": "foo", "sessionId": "s1" }),
        };
        let parsed = parse_tool_calls(&render_tool_call(&call));
        assert_eq!(parsed, vec![call]);
    }

    #[test]
    fn parser_ignores_malformed_lines() {
        let output = "thinking...\n\
                      TOOL_CALL: not json\n\
                      TOOL_CALL: {\"tool\": 42, \"parameters\": {}}\n\
                      TOOL_CALL: {\"tool\": \"x\"}\n\
                      TOOL_CALL: {\"tool\": \"x\", \"parameters\": []}\n\
                      TOOL_CALL: {\"tool\": \"ok\", \"parameters\": {\"a\": 1}}";
        let calls = parse_tool_calls(output);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "ok");
    }

    #[tokio::test]
    async fn extension_allows_completion_on_step_three() {
        // Warm-up consumes the first scripted output.
        let provider = Arc::new(ScriptedProvider::new(&[
            "OK",
            &ext_call(),
            &search_call(),
            "Final response.",
        ]));
        let dispatcher = StubDispatcher::new();
        let sessions = SessionStore::new();

        let outcome = run_agent_loop(
            &dispatcher,
            provider,
            &sessions,
            "/repo",
            "how does retry work?",
            None,
            true,
            limits(2, 3),
        )
        .await
        .unwrap();

        assert_eq!(outcome.final_response, "Final response.");
        assert!(!outcome.terminated_due_to_absolute_max);
        let tools: Vec<&str> = outcome.steps.iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools, vec![EXTEND_STEPS_TOOL, "search_code"]);
    }

    #[tokio::test]
    async fn absolute_cap_terminates_with_note() {
        let ext = ext_call();
        let provider = Arc::new(ScriptedProvider::new(&[
            "OK", &ext, &ext, &ext, // three extension-only iterations
            "leftover final",
        ]));
        let dispatcher = StubDispatcher::new();
        let sessions = SessionStore::new();

        let outcome = run_agent_loop(
            &dispatcher,
            provider,
            &sessions,
            "/repo",
            "loop forever",
            None,
            true,
            limits(2, 3),
        )
        .await
        .unwrap();

        assert!(outcome.terminated_due_to_absolute_max);
        assert!(outcome.final_response.contains(ABSOLUTE_MAX_NOTE));
        assert!(outcome.steps.len() <= 3, "got {} steps", outcome.steps.len());
    }

    #[tokio::test]
    async fn reasoning_timeout_falls_back_to_search() {
        let provider = Arc::new(ScriptedProvider::stalled());
        let dispatcher = StubDispatcher::new();
        let sessions = SessionStore::new();

        let outcome = run_agent_loop(
            &dispatcher,
            provider,
            &sessions,
            "/repo",
            "original question",
            None,
            true,
            limits(1, 2),
        )
        .await
        .unwrap();

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "search_code");
        assert_eq!(calls[0].parameters["query"], "original question");
        // The final generation also times out, so the response is
        // synthesized from step previews.
        assert!(
            outcome.final_response.contains("search_code"),
            "got: {}",
            outcome.final_response
        );
    }

    #[tokio::test]
    async fn plain_answer_ends_the_loop_immediately() {
        let provider = Arc::new(ScriptedProvider::new(&["OK", "Just an answer."]));
        let dispatcher = StubDispatcher::new();
        let sessions = SessionStore::new();

        let outcome = run_agent_loop(
            &dispatcher,
            provider,
            &sessions,
            "/repo",
            "simple",
            None,
            true,
            limits(3, 5),
        )
        .await
        .unwrap();

        assert_eq!(outcome.final_response, "Just an answer.");
        assert!(outcome.steps.is_empty());
        assert!(dispatcher.calls().is_empty());

        // The suggestion was persisted on the session.
        let session = sessions.snapshot(&outcome.session_id).unwrap();
        assert_eq!(session.suggestions.len(), 1);
        assert_eq!(session.suggestions[0].suggestion, "Just an answer.");
    }
}
