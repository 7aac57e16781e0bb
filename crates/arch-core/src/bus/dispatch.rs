//! Tool dispatch: the actual bus-tool logic, independent of axum. The
//! router in [`super`] only extracts the path/body and calls into here,
//! the same separation the teacher keeps between `build_router`'s
//! handlers and the `gator_db::queries` functions they call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use crate::brief::BriefSection;
use crate::config::ConfigFile;
use crate::error::BusError;
use crate::github::{Issue, Milestone};
use crate::model::{Agent, Message, PendingDecision, ProjectContext, SessionContext, Task, LEAD_AGENT_ID};
use crate::state::StateStore;

/// What a freshly spawned agent looks like from the lead's point of
/// view -- everything `spawn_agent` needs to hand back per §4.4.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnedAgent {
    pub agent_id: String,
    pub worktree_path: String,
    pub sandboxed: bool,
    pub skip_permissions: bool,
    pub status: String,
}

/// Result of a merge request: either a local merge, or a pull request
/// URL, depending on whether the caller supplied a PR title.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MergeOutcome {
    Merged,
    Conflict { details: String },
    PullRequest { url: String },
}

/// Lifecycle operations the bus delegates to the orchestrator, because
/// they require spawning/stopping real processes and touching worktrees
/// -- things this module deliberately knows nothing about.
#[async_trait]
pub trait BusCallbacks: Send + Sync {
    async fn spawn_agent(
        &self,
        role: &str,
        assignment: &str,
        context: Option<&str>,
        skip_permissions: bool,
    ) -> Result<SpawnedAgent, BusError>;
    async fn teardown_agent(&self, agent_id: &str) -> Result<(), BusError>;
    async fn request_merge(
        &self,
        agent_id: &str,
        target: &str,
        pr_title: Option<&str>,
        pr_body: Option<&str>,
    ) -> Result<MergeOutcome, BusError>;
    async fn close_project(&self) -> Result<(), BusError>;

    async fn create_issue(&self, title: &str, body: &str) -> Result<Issue, BusError>;
    async fn list_issues(&self, state: &str) -> Result<Vec<Issue>, BusError>;
    async fn update_issue(&self, number: u64, title: Option<&str>, body: Option<&str>) -> Result<Issue, BusError>;
    async fn close_issue(&self, number: u64) -> Result<(), BusError>;
    async fn add_comment(&self, number: u64, body: &str) -> Result<(), BusError>;
    async fn create_milestone(&self, title: &str) -> Result<Milestone, BusError>;
    async fn list_milestones(&self) -> Result<Vec<Milestone>, BusError>;

    /// Git status summary for `get_project_context` -- a short porcelain
    /// description, not a full diff.
    async fn git_status(&self) -> Result<String, BusError>;
}

/// Registry of one-shot channels for `escalate_to_user` calls still
/// parked waiting on a human answer.
#[derive(Default, Clone)]
pub struct DecisionWaiters {
    inner: Arc<Mutex<HashMap<u64, oneshot::Sender<String>>>>,
}

impl DecisionWaiters {
    async fn register(&self, id: u64, tx: oneshot::Sender<String>) {
        self.inner.lock().await.insert(id, tx);
    }

    async fn resolve(&self, id: u64, answer: &str) {
        if let Some(tx) = self.inner.lock().await.remove(&id) {
            let _ = tx.send(answer.to_string());
        }
    }

    /// Called during shutdown: every agent still parked on
    /// `escalate_to_user` gets a synthetic answer so it can exit instead
    /// of hanging the graceful-shutdown sequence forever.
    pub async fn resolve_all_for_shutdown(&self) {
        let mut guard = self.inner.lock().await;
        for (_, tx) in guard.drain() {
            let _ = tx.send("shutdown".to_string());
        }
    }
}

/// Everything the bus tool handlers need: state, config, the lifecycle
/// callback sink, the decision-waiter registry, and the path to the
/// project brief file `get_project_context`/`update_brief` read and
/// write.
#[derive(Clone)]
pub struct BusState {
    pub store: Arc<StateStore>,
    pub config: Arc<ConfigFile>,
    pub callbacks: Arc<dyn BusCallbacks>,
    pub waiters: DecisionWaiters,
    pub brief_path: std::path::PathBuf,
}

fn require_lead(agent_id: &str, tool: &str) -> Result<(), BusError> {
    if agent_id != LEAD_AGENT_ID {
        return Err(BusError::Unauthorized {
            caller: agent_id.to_string(),
            tool: tool.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Every-agent tools
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub to: String,
    pub body: String,
}

pub async fn send_message(
    state: &BusState,
    caller: &str,
    req: SendMessageRequest,
) -> Result<Message, BusError> {
    Ok(state
        .store
        .append_message_body(caller.to_string(), req.to, req.body)
        .await?)
}

#[derive(Debug, Deserialize)]
pub struct GetMessagesRequest {
    pub cursor: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GetMessagesResponse {
    pub messages: Vec<Message>,
    pub cursor: u64,
}

pub async fn get_messages(
    state: &BusState,
    caller: &str,
    req: GetMessagesRequest,
) -> Result<GetMessagesResponse, BusError> {
    let (messages, cursor) = state.store.messages_since(caller, req.cursor).await?;
    Ok(GetMessagesResponse { messages, cursor })
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

pub async fn update_status(
    state: &BusState,
    caller: &str,
    req: UpdateStatusRequest,
) -> Result<(), BusError> {
    let new_status: crate::model::AgentStatus = req
        .status
        .parse()
        .map_err(|_| BusError::InvalidStatus(req.status.clone()))?;

    let snapshot = state.store.snapshot().await;
    let agent = snapshot
        .agents
        .get(caller)
        .ok_or_else(|| BusError::UnknownAgent(caller.to_string()))?;

    if !crate::status_machine::is_valid_transition(agent.status, new_status) {
        return Err(BusError::InvalidStatus(req.status));
    }

    state
        .store
        .update_agent(caller, |a| a.status = new_status)
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ReportCompletionRequest {
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

pub async fn report_completion(
    state: &BusState,
    caller: &str,
    req: ReportCompletionRequest,
) -> Result<(), BusError> {
    state
        .store
        .update_agent(caller, |a| {
            a.status = crate::model::AgentStatus::Done;
            a.completion = Some(crate::model::CompletionRecord {
                summary: req.summary.clone(),
                artifacts: req.artifacts.clone(),
                reported_at: chrono::Utc::now(),
            });
        })
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SaveProgressRequest {
    #[serde(flatten)]
    pub context: SessionContext,
}

pub async fn save_progress(
    state: &BusState,
    caller: &str,
    req: SaveProgressRequest,
) -> Result<(), BusError> {
    state
        .store
        .update_agent(caller, |a| a.session_context = Some(req.context.clone()))
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lead-only tools
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SpawnAgentRequest {
    pub role: String,
    pub assignment: String,
    pub context: Option<String>,
    #[serde(default)]
    pub skip_permissions: bool,
}

pub async fn spawn_agent(
    state: &BusState,
    caller: &str,
    req: SpawnAgentRequest,
) -> Result<SpawnedAgent, BusError> {
    require_lead(caller, "spawn_agent")?;

    let role = state
        .config
        .role(&req.role)
        .ok_or_else(|| BusError::UnknownRole(req.role.clone()))?;

    let current_for_role = state.store.active_count(Some(&role.id)).await;
    if current_for_role >= role.max_instances {
        return Err(BusError::CapExceeded {
            role: role.id.clone(),
            current: current_for_role,
            max: role.max_instances,
        });
    }

    let total_live = state.store.active_count(None).await;
    if total_live >= state.config.settings.max_concurrent_agents {
        return Err(BusError::GlobalCapExceeded {
            current: total_live,
            max: state.config.settings.max_concurrent_agents,
        });
    }

    state
        .callbacks
        .spawn_agent(&req.role, &req.assignment, req.context.as_deref(), req.skip_permissions)
        .await
}

#[derive(Debug, Deserialize)]
pub struct TeardownAgentRequest {
    pub agent_id: String,
}

pub async fn teardown_agent(
    state: &BusState,
    caller: &str,
    req: TeardownAgentRequest,
) -> Result<(), BusError> {
    require_lead(caller, "teardown_agent")?;
    if req.agent_id == LEAD_AGENT_ID {
        return Err(BusError::CannotTeardownLead);
    }
    state.callbacks.teardown_agent(&req.agent_id).await
}

pub async fn list_agents(state: &BusState, caller: &str) -> Result<Vec<Agent>, BusError> {
    require_lead(caller, "list_agents")?;
    let snapshot = state.store.snapshot().await;
    Ok(snapshot.agents.into_values().collect())
}

#[derive(Debug, Deserialize)]
pub struct EscalateToUserRequest {
    pub question: String,
    pub options: Option<Vec<String>>,
}

/// Blocks the calling task until a human (via the dashboard) answers, or
/// until shutdown resolves every outstanding decision with a synthetic
/// answer.
pub async fn escalate_to_user(
    state: &BusState,
    caller: &str,
    req: EscalateToUserRequest,
) -> Result<String, BusError> {
    require_lead(caller, "escalate_to_user")?;

    let id = state.store.queue_decision(req.question, req.options).await?;
    let (tx, rx) = oneshot::channel();
    state.waiters.register(id, tx).await;

    rx.await.map_err(|_| BusError::UnknownDecision(id))
}

#[derive(Debug, Deserialize)]
pub struct AnswerDecisionRequest {
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct AnswerDecisionResponse {
    pub answer: String,
}

pub async fn answer_decision(
    state: &BusState,
    decision_id: u64,
    req: AnswerDecisionRequest,
) -> Result<AnswerDecisionResponse, BusError> {
    let answer = state.store.answer_decision(decision_id, req.answer.clone()).await?;
    state.waiters.resolve(decision_id, &answer).await;
    Ok(AnswerDecisionResponse { answer })
}

#[derive(Debug, Deserialize)]
pub struct RequestMergeRequest {
    pub agent_id: String,
    pub target: String,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequestMergeResponse {
    pub result: MergeOutcome,
}

/// Picks local merge or pull-request creation based on whether a title
/// was supplied (spec §4.4's `request_merge` branching rule).
pub async fn request_merge(
    state: &BusState,
    caller: &str,
    req: RequestMergeRequest,
) -> Result<RequestMergeResponse, BusError> {
    require_lead(caller, "request_merge")?;
    let result = state
        .callbacks
        .request_merge(&req.agent_id, &req.target, req.pr_title.as_deref(), req.pr_body.as_deref())
        .await?;
    Ok(RequestMergeResponse { result })
}

#[derive(Debug, Serialize)]
pub struct ProjectContextResponse {
    pub project: Option<ProjectContext>,
    pub git_status: String,
    pub live_agents: Vec<AgentSummary>,
    pub brief: String,
}

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub role: String,
    pub status: String,
    pub task: String,
}

pub async fn get_project_context(
    state: &BusState,
    caller: &str,
) -> Result<ProjectContextResponse, BusError> {
    require_lead(caller, "get_project_context")?;
    let snapshot = state.store.snapshot().await;
    let git_status = state.callbacks.git_status().await?;
    let live_agents = snapshot
        .agents
        .values()
        .filter(|a| !a.status.is_terminal())
        .map(|a| AgentSummary {
            id: a.id.clone(),
            role: a.role.clone(),
            status: a.status.to_string(),
            task: a.task.clone(),
        })
        .collect();
    let brief = crate::brief::read(&state.brief_path);
    Ok(ProjectContextResponse {
        project: snapshot.project,
        git_status,
        live_agents,
        brief,
    })
}

#[derive(Debug, Deserialize)]
pub struct UpdateBriefRequest {
    pub section: String,
    pub content: String,
}

/// Replaces *Current Status* wholesale, or appends one auto-dated row
/// to *Decisions Log*, per which `section` the caller names.
pub async fn update_brief(
    state: &BusState,
    caller: &str,
    req: UpdateBriefRequest,
) -> Result<(), BusError> {
    require_lead(caller, "update_brief")?;
    let section = BriefSection::parse(&req.section)
        .ok_or_else(|| BusError::Internal(format!("unknown brief section {:?}", req.section)))?;

    let result = match section {
        BriefSection::CurrentStatus => crate::brief::replace_section(&state.brief_path, section.heading(), &req.content),
        BriefSection::DecisionsLog => crate::brief::append_row(&state.brief_path, section.heading(), &req.content),
    };
    result.map_err(|e| BusError::Internal(e.to_string()))
}

pub async fn close_project(state: &BusState, caller: &str) -> Result<(), BusError> {
    require_lead(caller, "close_project")?;
    state.callbacks.close_project().await
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub assignee: String,
    pub description: String,
}

pub async fn create_task(
    state: &BusState,
    caller: &str,
    req: CreateTaskRequest,
) -> Result<Task, BusError> {
    require_lead(caller, "create_task")?;
    Ok(state.store.create_task(req.assignee, req.description).await?)
}

// ---------------------------------------------------------------------------
// Hosting-provider issue/milestone tools (lead-only, §4.4)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateIssueRequest {
    pub title: String,
    pub body: String,
}

pub async fn create_issue(state: &BusState, caller: &str, req: CreateIssueRequest) -> Result<Issue, BusError> {
    require_lead(caller, "create_issue")?;
    state.callbacks.create_issue(&req.title, &req.body).await
}

#[derive(Debug, Deserialize)]
pub struct ListIssuesRequest {
    #[serde(default = "default_issue_state")]
    pub state: String,
}

fn default_issue_state() -> String {
    "open".to_string()
}

pub async fn list_issues(state: &BusState, caller: &str, req: ListIssuesRequest) -> Result<Vec<Issue>, BusError> {
    require_lead(caller, "list_issues")?;
    state.callbacks.list_issues(&req.state).await
}

#[derive(Debug, Deserialize)]
pub struct UpdateIssueRequest {
    pub number: u64,
    pub title: Option<String>,
    pub body: Option<String>,
}

pub async fn update_issue(state: &BusState, caller: &str, req: UpdateIssueRequest) -> Result<Issue, BusError> {
    require_lead(caller, "update_issue")?;
    state
        .callbacks
        .update_issue(req.number, req.title.as_deref(), req.body.as_deref())
        .await
}

#[derive(Debug, Deserialize)]
pub struct CloseIssueRequest {
    pub number: u64,
}

pub async fn close_issue(state: &BusState, caller: &str, req: CloseIssueRequest) -> Result<(), BusError> {
    require_lead(caller, "close_issue")?;
    state.callbacks.close_issue(req.number).await
}

#[derive(Debug, Deserialize)]
pub struct AddCommentRequest {
    pub number: u64,
    pub body: String,
}

pub async fn add_comment(state: &BusState, caller: &str, req: AddCommentRequest) -> Result<(), BusError> {
    require_lead(caller, "add_comment")?;
    state.callbacks.add_comment(req.number, &req.body).await
}

#[derive(Debug, Deserialize)]
pub struct CreateMilestoneRequest {
    pub title: String,
}

pub async fn create_milestone(
    state: &BusState,
    caller: &str,
    req: CreateMilestoneRequest,
) -> Result<Milestone, BusError> {
    require_lead(caller, "create_milestone")?;
    state.callbacks.create_milestone(&req.title).await
}

pub async fn list_milestones(state: &BusState, caller: &str) -> Result<Vec<Milestone>, BusError> {
    require_lead(caller, "list_milestones")?;
    state.callbacks.list_milestones().await
}

/// Every decision still awaiting a human answer, for the dashboard to
/// poll (spec §4.9). Not a bus tool -- no caller identity to check,
/// since the dashboard is not an agent.
pub async fn list_pending_decisions(state: &BusState) -> Vec<PendingDecision> {
    let snapshot = state.store.snapshot().await;
    snapshot
        .decisions
        .into_values()
        .filter(|d| d.answer.is_none())
        .collect()
}
