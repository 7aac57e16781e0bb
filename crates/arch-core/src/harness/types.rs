//! Supporting types shared by every Session Supervisor variant: the
//! structured event stream, the handle returned by `spawn`, and the
//! fully-materialized task description passed in.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::process::ChildStdin;

/// A single usage reading: four token counters from one usage event.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageReading {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// An event decoded from one line of an agent's structured output
/// stream. Three shapes matter to the Token Meter: `Message` (kept for
/// the activity view), `Usage` (four counters, fed to the meter), and
/// `Completed` (terminal, may carry the resume token).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Message { role: String, content: String },
    ToolCall { tool: String, input: serde_json::Value },
    ToolResult { tool: String, output: serde_json::Value },
    Usage { model_id: String, reading: UsageReading },
    Error { message: String },
    /// Terminal event. `resume_token` is the opaque id the AI CLI hands
    /// back so a later run can continue this conversation.
    Completed { resume_token: Option<String> },
}

/// Handle returned by `spawn`. Exactly one of the execution identifiers
/// on the owning [`crate::model::Agent`] is populated from this.
pub struct AgentHandle {
    pub agent_id: String,
    pub pid: u32,
    pub stdin: Option<ChildStdin>,
    pub container_name: Option<String>,
}

/// A task fully resolved into what an agent process needs to run:
/// working directory, environment, and the prompt text itself.
#[derive(Debug, Clone)]
pub struct MaterializedTask {
    pub agent_id: String,
    pub role: String,
    pub model_id: String,
    pub assignment: String,
    pub working_dir: PathBuf,
    pub bus_config_path: PathBuf,
    pub skip_permissions: bool,
    pub resume_token: Option<String>,
    pub env_vars: HashMap<String, String>,
}
