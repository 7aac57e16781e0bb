//! Error kinds and their fatal/non-fatal treatment.
//!
//! Library-internal errors are closed enums so a caller can match on a
//! kind rather than grep a string, the way the teacher's
//! `WorktreeError`/`TokenError` are shaped. The orchestrator and CLI glue
//! code wrap these in `anyhow::Context` narratives; the enums themselves
//! stay structured.

use thiserror::Error;

/// Errors raised while parsing or validating the harness configuration.
/// Fatal at startup; never raised once the orchestrator is running.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path} as YAML: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config invalid: {0}")]
    Invalid(String),
}

/// Errors from the State Store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("agent id {0:?} already registered")]
    DuplicateAgentId(String),
    #[error("instance cap exceeded for role {role:?} ({current}/{max})")]
    RoleCapExceeded {
        role: String,
        current: u32,
        max: u32,
    },
    #[error("global concurrency cap exceeded ({current}/{max})")]
    GlobalCapExceeded { current: u32, max: u32 },
    #[error("no such agent {0:?}")]
    UnknownAgent(String),
    #[error("invalid status {0:?}")]
    InvalidStatus(String),
    #[error("failed to persist partition {partition}: {source}")]
    Persist {
        partition: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode partition {partition}: {source}")]
    Decode {
        partition: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the Worktree Manager. A timeout maps to its own variant so
/// the caller never blocks the reactor indefinitely on a hung git/gh call.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(String),
    #[error("failed to run git: {0}")]
    GitCommand(#[source] std::io::Error),
    #[error("git {command} exited with code {code}: {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("git {command} timed out after {elapsed_secs}s")]
    Timeout { command: String, elapsed_secs: u64 },
    #[error("failed to parse git output: {0}")]
    ParseError(String),
    #[error("hosting-provider CLI unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("hosting-provider call failed: {0}")]
    ProviderCallFailed(String),
    #[error("hosting-provider disabled: no github config section")]
    ProviderDisabled,
}

/// Errors from the Token Meter's event-stream parsing.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed event line: {0}")]
    MalformedLine(String),
    #[error("failed to load pricing table {path}: {source}")]
    PricingLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse pricing table {path}: {source}")]
    PricingParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("pricing table {path} has no \"default\" row")]
    MissingDefaultRow { path: String },
}

/// Errors surfaced by a bus tool call as a structured result -- these
/// never crash the bus server, per the spec's error-handling design.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("unknown role {0:?}")]
    UnknownRole(String),
    #[error("instance cap exceeded for role {role:?} ({current}/{max})")]
    CapExceeded {
        role: String,
        current: u32,
        max: u32,
    },
    #[error("global concurrency cap exceeded ({current}/{max})")]
    GlobalCapExceeded { current: u32, max: u32 },
    #[error("invalid status {0:?}")]
    InvalidStatus(String),
    #[error("caller {caller:?} is not authorized to call {tool:?}")]
    Unauthorized { caller: String, tool: String },
    #[error("the lead agent cannot be torn down")]
    CannotTeardownLead,
    #[error("no such agent {0:?}")]
    UnknownAgent(String),
    #[error("no such pending decision {0}")]
    UnknownDecision(u64),
    #[error("skip_permissions was not pre-approved for role {0:?}")]
    PermissionNotPreApproved(String),
    #[error("hosting provider is disabled (no github config section)")]
    ProviderDisabled,
    #[error("hosting provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("hosting provider call failed: {0}")]
    ProviderCallFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StateError> for BusError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::RoleCapExceeded { role, current, max } => {
                BusError::CapExceeded { role, current, max }
            }
            StateError::GlobalCapExceeded { current, max } => {
                BusError::GlobalCapExceeded { current, max }
            }
            // Structurally unreachable once admission goes through
            // `StateStore::reserve_agent` -- kept as a defense-in-depth
            // fallback rather than removed.
            other => BusError::Internal(other.to_string()),
        }
    }
}

/// Errors from a Session Supervisor (local or container-backed).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent subprocess exited with non-zero status {0}")]
    NonZeroExit(i32),
    #[error("failed to write to agent stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("container runtime unavailable: {0}")]
    ContainerRuntimeUnavailable(String),
    #[error("container operation failed: {0}")]
    ContainerFailed(String),
}

/// Errors from the hosting-provider CLI wrapper (issues / milestones /
/// pull requests), distinguishing configuration, availability, and call
/// failures as the spec's §4.4 tool-surface note requires.
#[derive(Debug, Error)]
pub enum GithubError {
    #[error("github integration is disabled (no github config section)")]
    ProviderDisabled,
    #[error("hosting-provider CLI is not installed or not authenticated: {0}")]
    ProviderUnavailable(String),
    #[error("hosting-provider call failed: {0}")]
    ProviderCallFailed(String),
}
