//! Planner and Executor model adapters (§4.5).
//!
//! Both roles call the same HTTP chat primitive: an `openai-rust2` client
//! pointed at a per-role `base_url`/`model`, built over the reference
//! codebase's own `SHARED_HTTP_CLIENT` + `send_and_track` shape
//! (`clients/common.rs`) so connection pooling is shared across both roles
//! without re-dialing per request. Output parsing follows the source
//! system's three-tier extraction: a fenced ` ```json ` block, then a
//! whole-body JSON parse, then a brace-balanced scan.

use super::config::LlmConfig;
use super::error::OrchestratorError;
use super::task::{ExecutorStep, Plan};
use lazy_static::lazy_static;
use openai_rust2 as openai_rust;
use openai_rust2::chat::{ChatArguments, Message as ChatMessage};
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

lazy_static! {
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(600))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build shared HTTP client");
}

/// Ollama (and most local OpenAI-compatible servers) ignore the API key but
/// still require the header to be present.
const DUMMY_API_KEY: &str = "unused";

fn client_for(config: &LlmConfig) -> openai_rust::Client {
    openai_rust::Client::new_with_client_and_base_url(
        DUMMY_API_KEY,
        SHARED_HTTP_CLIENT.clone(),
        &config.base_url,
    )
}

/// Post one chat-completion request to `config`'s endpoint and return the
/// raw text body, stripped of any `<think>...</think>` preamble the source
/// system's local models sometimes emit.
async fn complete(config: &LlmConfig, system_prompt: &str, user_prompt: &str) -> Result<String, String> {
    let client = client_for(config);
    let messages = vec![
        ChatMessage { role: "system".to_string(), content: system_prompt.to_string() },
        ChatMessage { role: "user".to_string(), content: user_prompt.to_string() },
    ];
    let chat_arguments = ChatArguments::new(&config.model, messages);

    log::info!("model request to {} (model={})", config.base_url, config.model);

    let response = client
        .create_chat(chat_arguments, Some("/v1/chat/completions".to_string()))
        .await
        .map_err(|e| format!("model transport error: {}", e))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| "empty choices array".to_string())?;

    Ok(strip_think_block(&content))
}

fn strip_think_block(text: &str) -> String {
    lazy_static! {
        static ref THINK_RE: Regex = Regex::new(r"(?s)<think>.*?</think>").unwrap();
    }
    THINK_RE.replace_all(text, "").trim().to_string()
}

/// Three-tier extraction of a JSON object from free-form model text.
pub fn extract_json(text: &str) -> Option<Value> {
    lazy_static! {
        static ref FENCE_RE: Regex = Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap();
        static ref BRACE_RE: Regex = Regex::new(r"(?s)\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").unwrap();
    }

    if let Some(caps) = FENCE_RE.captures(text) {
        if let Ok(value) = serde_json::from_str(&caps[1]) {
            return Some(value);
        }
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Some(value);
        }
    }

    if let Some(m) = BRACE_RE.find(text) {
        if let Ok(value) = serde_json::from_str(m.as_str()) {
            return Some(value);
        }
    }

    None
}

fn truncated_preview(s: &str) -> String {
    if s.len() > 200 {
        format!("{}...", &s[..200])
    } else {
        s.to_string()
    }
}

const PLANNER_SYSTEM_PROMPT: &str = "You are the planner.\nReturn a structured plan as a JSON object with \
    fields: goal, steps (each with title, details, expected_tools), risks, success_criteria. \
    Do not write code. Do not call tools. Do not include chain of thought, only the final JSON object.";

const EXECUTOR_SYSTEM_PROMPT_PREFIX: &str = "You are the executor.\nYou must return ONLY a JSON object with \
    fields: status (one of \"continue\", \"need_user\", \"complete\"), tool_calls, final_message, \
    user_question, note. No markdown. No code fences. No extra keys.";

/// Invoked at most once per task; produces the task's [`Plan`].
pub struct PlannerAdapter<'a> {
    config: &'a LlmConfig,
}

impl<'a> PlannerAdapter<'a> {
    pub fn new(config: &'a LlmConfig) -> Self {
        PlannerAdapter { config }
    }

    /// Plan `prompt` given `allowed_tools`, retrying once on parse failure
    /// with a corrective message appended, per §4.5's bounded-retry policy.
    pub async fn plan(&self, prompt: &str, allowed_tools: &[String]) -> Result<Plan, OrchestratorError> {
        let user_prompt = format!(
            "Task: {}\nAllowed tools: {}\n\nReturn the plan as a single JSON object.",
            prompt,
            allowed_tools.join(", ")
        );

        let mut attempt_prompt = user_prompt;
        for attempt in 0..2 {
            let raw = complete(self.config, PLANNER_SYSTEM_PROMPT, &attempt_prompt)
                .await
                .map_err(|detail| OrchestratorError::PlannerError { detail })?;
            log::info!("planner response preview: {}", truncated_preview(&raw));
            match extract_json(&raw).and_then(|v| serde_json::from_value::<Plan>(v).ok()) {
                Some(plan) => return Ok(plan),
                None if attempt == 0 => {
                    attempt_prompt = format!(
                        "{}\n\nYour previous output did not parse as the required JSON schema: {}\n\
                        Return ONLY the corrected JSON object.",
                        attempt_prompt, raw
                    );
                }
                None => {
                    return Err(OrchestratorError::PlannerError {
                        detail: "planner output did not parse as a Plan after retry".to_string(),
                    })
                }
            }
        }
        unreachable!()
    }
}

/// Invoked on every control-graph tick after planning; produces an [`ExecutorStep`].
pub struct ExecutorAdapter<'a> {
    config: &'a LlmConfig,
}

impl<'a> ExecutorAdapter<'a> {
    pub fn new(config: &'a LlmConfig) -> Self {
        ExecutorAdapter { config }
    }

    /// Run the Executor's 2-strike validation policy (§4.5): up to two model
    /// invocations, each followed by a parse attempt; on exhaustion, returns
    /// an `ExecutorError` for the control graph to surface.
    pub async fn step(
        &self,
        prompt: &str,
        plan: &Plan,
        allowed_tools: &[String],
        history_window: &[String],
    ) -> Result<ExecutorStep, OrchestratorError> {
        let base_prompt = format!(
            "Task: {}\nGoal: {}\nAllowed tools: {}\n\nRecent history:\n{}\n\nReturn the next ExecutorStep as a single JSON object.",
            prompt,
            plan.goal,
            allowed_tools.join(", "),
            history_window.join("\n")
        );

        let mut attempt_prompt = base_prompt;
        for attempt in 0..2 {
            let raw = complete(self.config, EXECUTOR_SYSTEM_PROMPT_PREFIX, &attempt_prompt)
                .await
                .map_err(|detail| OrchestratorError::ExecutorError { detail })?;
            log::info!("executor response preview: {}", truncated_preview(&raw));
            let parsed = extract_json(&raw).and_then(|v| serde_json::from_value::<ExecutorStep>(v).ok());
            match parsed {
                Some(step) if step.validate().is_ok() => return Ok(step),
                Some(step) => {
                    let reason = step.validate().unwrap_err();
                    if attempt == 0 {
                        attempt_prompt =
                            format!("{}\n\nYour previous output failed validation: {}\nReturn ONLY corrected JSON.", attempt_prompt, reason);
                    } else {
                        return Err(OrchestratorError::ValidationError { detail: reason });
                    }
                }
                None if attempt == 0 => {
                    attempt_prompt = format!(
                        "{}\n\nYour previous output did not parse as the required JSON schema: {}\nReturn ONLY corrected JSON.",
                        attempt_prompt, raw
                    );
                }
                None => {
                    return Err(OrchestratorError::ExecutorError {
                        detail: "executor output did not parse as an ExecutorStep after retry".to_string(),
                    })
                }
            }
        }
        unreachable!()
    }
}
