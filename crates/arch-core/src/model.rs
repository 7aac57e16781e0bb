//! Data model: the records the State Store partitions by kind.
//!
//! Enums that cross a serialization boundary (status strings, in
//! particular) follow the teacher's pattern of a manual `Display` +
//! `FromStr` pair plus a dedicated parse-error type, rather than relying
//! solely on derive machinery, so an invalid status string from a tool
//! call can be rejected with a clear message instead of a generic serde
//! error.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bound on the in-memory "recent activity" ring kept per agent for the
/// dashboard's activity view. Not persisted to the JSON mirror in full;
/// only used for the live poll surface.
pub const RECENT_ACTIVITY_CAP: usize = 64;

/// The reserved identifier for the privileged lead agent.
pub const LEAD_AGENT_ID: &str = "lead";

// ---------------------------------------------------------------------------
// Agent status state machine
// ---------------------------------------------------------------------------

/// Status of a live agent. See the state machine in the orchestrator
/// module for the valid transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Idle,
    Working,
    Blocked,
    WaitingReview,
    Done,
    Error,
}

impl AgentStatus {
    /// Whether this status is one of the two terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Done | AgentStatus::Error)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Blocked => "blocked",
            Self::WaitingReview => "waiting_review",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawning" => Ok(Self::Spawning),
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "blocked" => Ok(Self::Blocked),
            "waiting_review" => Ok(Self::WaitingReview),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string. Tool
/// calls that set an unrecognized status surface this, not a panic.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task tracked against an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Execution handle: exactly one of pid / container name
// ---------------------------------------------------------------------------

/// An agent's process handle -- exactly one variant is populated, never
/// both, per the data model's invariant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionHandle {
    Local { pid: u32 },
    Container { name: String },
}

// ---------------------------------------------------------------------------
// Usage subrecord
// ---------------------------------------------------------------------------

/// Per-agent accumulated token usage and monetary cost. Mutated
/// exclusively by the Token Meter as it observes usage events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSubrecord {
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub turn_count: u64,
    pub cost_usd: f64,
}

// ---------------------------------------------------------------------------
// Session context (from save_progress)
// ---------------------------------------------------------------------------

/// Structured progress an agent has reported about itself via
/// `save_progress`. Folded into the next `CLAUDE.md` write as a *Session
/// State* section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    pub files_modified: Vec<String>,
    pub progress: String,
    pub next_steps: String,
    pub blockers: Option<String>,
    pub decisions: Option<String>,
}

/// What an agent reported about itself via `report_completion`: the
/// final summary and artifact list a lead or human reviews before
/// merging. Distinct from [`SessionContext`], which is a running
/// progress note an agent can update many times before it's done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub summary: String,
    pub artifacts: Vec<String>,
    pub reported_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agent record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: String,
    pub status: AgentStatus,
    pub task: String,
    /// Opaque token supplied by the AI CLI at exit; used to resume.
    pub resume_token: Option<String>,
    pub worktree_path: PathBuf,
    pub handle: Option<ExecutionHandle>,
    pub sandboxed: bool,
    pub skip_permissions: bool,
    pub spawned_at: DateTime<Utc>,
    pub usage: UsageSubrecord,
    pub session_context: Option<SessionContext>,
    #[serde(default)]
    pub completion: Option<CompletionRecord>,
    #[serde(default)]
    pub recent_activity: VecDeque<String>,
}

impl Agent {
    pub fn push_activity(&mut self, line: String) {
        self.recent_activity.push_back(line);
        while self.recent_activity.len() > RECENT_ACTIVITY_CAP {
            self.recent_activity.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The sentinel recipient meaning "every live agent".
pub const BROADCAST: &str = "broadcast";
/// The sentinel sender meaning "a human, via the dashboard".
pub const USER_SENDER: &str = "user";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub from: String,
    pub to: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

// ---------------------------------------------------------------------------
// Pending decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDecision {
    pub id: u64,
    pub question: String,
    pub options: Option<Vec<String>>,
    pub asked_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub answer: Option<String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub assignee: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Project context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    pub name: String,
    pub description: String,
    pub repo_root: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Map of agent id -> cursor (last message id consumed). Only the lead's
/// cursor is persisted today, but the type is general.
pub type Cursors = HashMap<String, u64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [
            AgentStatus::Spawning,
            AgentStatus::Idle,
            AgentStatus::Working,
            AgentStatus::Blocked,
            AgentStatus::WaitingReview,
            AgentStatus::Done,
            AgentStatus::Error,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_invalid() {
        assert!("bogus".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn agent_status_terminal() {
        assert!(AgentStatus::Done.is_terminal());
        assert!(AgentStatus::Error.is_terminal());
        assert!(!AgentStatus::Working.is_terminal());
    }

    #[test]
    fn task_status_display_roundtrip() {
        for v in [TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Done] {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn recent_activity_caps() {
        let mut agent = Agent {
            id: "frontend-1".into(),
            role: "frontend".into(),
            status: AgentStatus::Idle,
            task: String::new(),
            resume_token: None,
            worktree_path: PathBuf::from("/tmp"),
            handle: None,
            sandboxed: false,
            skip_permissions: false,
            spawned_at: Utc::now(),
            usage: UsageSubrecord::default(),
            session_context: None,
            completion: None,
            recent_activity: VecDeque::new(),
        };
        for i in 0..(RECENT_ACTIVITY_CAP + 10) {
            agent.push_activity(format!("line {i}"));
        }
        assert_eq!(agent.recent_activity.len(), RECENT_ACTIVITY_CAP);
        assert_eq!(agent.recent_activity.front().unwrap(), "line 10");
    }
}
