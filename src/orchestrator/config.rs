//! Static configuration: model wiring, task-kind profiles, and tunables.
//!
//! A plain, manually-constructed struct with a `Default` impl, grounded in the
//! source system's `config.py` (`LLMConfig`, `TaskKindConfig`, `CommandDefinition`)
//! but expressed as Rust value types rather than a loaded file — no file-parsing
//! crate is pulled in, matching the reference codebase's own config module.

use std::collections::HashMap;
use std::time::Duration;

/// Model wiring for one of the two logical roles (planner, executor).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            base_url: "http://localhost:11434".to_string(),
            model: "gemma3:12b".to_string(),
            temperature: 0.7,
            max_tokens: 32768,
        }
    }
}

/// Classification a tool name resolves to in the dispatcher's static registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Local,
    Remote,
    AskUser,
}

/// One entry of the dispatcher's tool registry (§4.4.2).
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub class: ToolClass,
    pub description: String,
}

impl ToolDefinition {
    fn new(name: &str, class: ToolClass, description: &str) -> Self {
        ToolDefinition { name: name.to_string(), class, description: description.to_string() }
    }
}

/// A `kind` resolves to one of these; see §3's "Task Kind Profile".
#[derive(Debug, Clone)]
pub struct TaskKindProfile {
    pub name: String,
    pub description: String,
    pub allowed_tools: Vec<String>,
    pub system_prompt: String,
}

/// Everything the process needs to run, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub planner_llm: LlmConfig,
    pub executor_llm: LlmConfig,
    pub task_kinds: HashMap<String, TaskKindProfile>,
    pub tool_registry: HashMap<String, ToolDefinition>,
    pub max_consecutive_errors: u32,
    pub step_budget: u32,
    pub remote_call_timeout: Duration,
    pub model_request_timeout: Duration,
    pub history_window: usize,
    /// Character budget the trimmed history view may not exceed, checked after
    /// the turn-count window so whichever bound is tighter wins (§4.5.1).
    pub history_char_budget: usize,
    pub duplicate_call_window: usize,
    pub duplicate_call_threshold: usize,
    pub forbidden_question_substrings: Vec<String>,
    pub channel_outbound_queue_capacity: usize,
}

fn default_tool_registry() -> HashMap<String, ToolDefinition> {
    let defs = vec![
        ToolDefinition::new("status-update", ToolClass::Local, "Emit a status message; fire-and-forget."),
        ToolDefinition::new("cache-patch", ToolClass::Local, "Apply a patch to a cached file."),
        ToolDefinition::new("cache-diff", ToolClass::Local, "Diff a cached file against another version."),
        ToolDefinition::new("cache-syntax-check", ToolClass::Local, "Run an external syntax checker on a cached file."),
        ToolDefinition::new("flush-cache", ToolClass::Remote, "Write a cached file's current content back to the client."),
        ToolDefinition::new("read-file", ToolClass::Remote, "Read a file from the client's filesystem."),
        ToolDefinition::new("write-file", ToolClass::Remote, "Write a file to the client's filesystem."),
        ToolDefinition::new("list-dir", ToolClass::Remote, "List a directory on the client."),
        ToolDefinition::new("tree", ToolClass::Remote, "Recursively list a directory tree on the client."),
        ToolDefinition::new("delete", ToolClass::Remote, "Delete a path on the client."),
        ToolDefinition::new("run-program", ToolClass::Remote, "Run a program on the client."),
        ToolDefinition::new("shell-exec", ToolClass::Remote, "Run a shell command on the client."),
        ToolDefinition::new("write-and-run", ToolClass::Remote, "Write a file then run it, as one remote round trip."),
        ToolDefinition::new("ask-user", ToolClass::AskUser, "Ask the human user a clarifying question."),
    ];
    defs.into_iter().map(|d| (d.name.clone(), d)).collect()
}

fn general_agent_profile() -> TaskKindProfile {
    TaskKindProfile {
        name: "general-agent".to_string(),
        description: "Long-running autonomous agent with full filesystem and program access.".to_string(),
        allowed_tools: vec![
            "shell-exec", "list-dir", "read-file", "write-file", "delete", "run-program",
            "write-and-run", "tree", "ask-user", "status-update", "cache-patch", "cache-diff",
            "cache-syntax-check", "flush-cache",
        ]
        .into_iter()
        .map(str::to_string)
        .collect(),
        system_prompt: "You are an autonomous agent operating a remote machine on behalf of a user. \
            Work step by step towards the goal, using the tools available to you, and ask the user \
            only when you cannot proceed without their input."
            .to_string(),
    }
}

fn code_job_profile() -> TaskKindProfile {
    TaskKindProfile {
        name: "code-job".to_string(),
        description: "Narrow agent scoped to writing and running code.".to_string(),
        allowed_tools: vec![
            "list-dir", "read-file", "write-file", "run-program", "write-and-run",
            "ask-user", "status-update", "cache-patch", "cache-diff", "cache-syntax-check",
            "flush-cache",
        ]
        .into_iter()
        .map(str::to_string)
        .collect(),
        system_prompt: "You are a coding agent. Write code, test it by running it, and fix errors \
            until it works. Do not ask the user questions about implementation details."
            .to_string(),
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut task_kinds = HashMap::new();
        let general = general_agent_profile();
        let code = code_job_profile();
        task_kinds.insert(general.name.clone(), general);
        task_kinds.insert(code.name.clone(), code);

        Config {
            planner_llm: LlmConfig::default(),
            executor_llm: LlmConfig::default(),
            task_kinds,
            tool_registry: default_tool_registry(),
            max_consecutive_errors: 3,
            step_budget: 20,
            remote_call_timeout: Duration::from_secs(30),
            model_request_timeout: Duration::from_secs(600),
            history_window: 30,
            history_char_budget: 8_000,
            duplicate_call_window: 5,
            duplicate_call_threshold: 3,
            forbidden_question_substrings: vec![
                "write the code",
                "provide the code",
                "provide the content",
                "what code",
                "syntax",
                "implementation",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            channel_outbound_queue_capacity: 64,
        }
    }
}

impl Config {
    pub fn task_kind(&self, kind: &str) -> Option<&TaskKindProfile> {
        self.task_kinds.get(kind)
    }

    pub fn tool_class(&self, tool_name: &str) -> Option<ToolClass> {
        self.tool_registry.get(tool_name).map(|d| d.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_two_task_kinds() {
        let config = Config::default();
        assert!(config.task_kind("general-agent").is_some());
        assert!(config.task_kind("code-job").is_some());
        assert!(config.task_kind("nonexistent").is_none());
    }

    #[test]
    fn tool_registry_classifies_known_tools() {
        let config = Config::default();
        assert_eq!(config.tool_class("read-file"), Some(ToolClass::Remote));
        assert_eq!(config.tool_class("status-update"), Some(ToolClass::Local));
        assert_eq!(config.tool_class("ask-user"), Some(ToolClass::AskUser));
        assert_eq!(config.tool_class("no-such-tool"), None);
    }

    #[test]
    fn forbidden_substrings_are_present() {
        let config = Config::default();
        assert!(config.forbidden_question_substrings.iter().any(|s| s == "syntax"));
    }
}
