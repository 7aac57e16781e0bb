//! Orchestrator: startup sequence, supervision loop, lifecycle callbacks,
//! and graceful shutdown.
//!
//! Grounded on two things the teacher keeps separate that this component
//! folds together: the top-level `orchestrator::run_orchestrator`
//! (cancellation-token-driven loop, an mpsc channel carrying completed
//! sessions back to the loop instead of polling) and
//! `lifecycle::run_agent_lifecycle` (one function that takes a task from
//! materialization through spawn to exit, draining its event stream into
//! storage as it goes). There is no DAG here -- just a roster of live
//! agents -- so the scheduling half of the teacher's loop (semaphore-gated
//! `get_ready_tasks`) has no counterpart; the concurrency caps instead
//! live in the bus's `spawn_agent` admission check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::bus::dispatch::{BusCallbacks, MergeOutcome, SpawnedAgent};
use crate::bus::{run_bus_server, BusState, DecisionWaiters};
use crate::config::{ConfigFile, GithubConfig, PricingTable};
use crate::error::{BusError, GithubError, SupervisorError, WorktreeError};
use crate::github::{self, Issue, Milestone};
use crate::harness::{
    AgentEvent, ContainerSupervisor, EmergencyCleanupRegistry, LocalSupervisor, MaterializedTask,
    Supervisor,
};
use crate::model::{Agent, AgentStatus, ProjectContext, LEAD_AGENT_ID};
use crate::state::StateStore;
use crate::token::apply_usage;
use crate::worktree::{MergeResult, WorktreeManager};

/// CLI-level configuration for one orchestrator run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub config_path: std::path::PathBuf,
    pub keep_worktrees: bool,
}

/// `Supervisor`'s `run` method is generic, which makes `dyn Supervisor`
/// not object-safe; this enum is the idiomatic way to hold either
/// concrete variant in one collection without boxing a trait object.
enum AnySupervisor {
    Local(LocalSupervisor),
    Container(ContainerSupervisor),
}

impl AnySupervisor {
    async fn spawn(&mut self, task: &MaterializedTask) -> Result<(), SupervisorError> {
        match self {
            Self::Local(s) => s.spawn(task).await,
            Self::Container(s) => s.spawn(task).await,
        }
    }

    async fn run<F>(&mut self, on_event: F) -> Result<(), SupervisorError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        match self {
            Self::Local(s) => s.run(on_event).await,
            Self::Container(s) => s.run(on_event).await,
        }
    }

    async fn stop(&mut self) -> Result<(), SupervisorError> {
        match self {
            Self::Local(s) => s.stop().await,
            Self::Container(s) => s.stop().await,
        }
    }
}

/// A live session: the supervisor driving it, and the task that reads
/// its event stream. Torn down together.
struct Session {
    supervisor: Arc<Mutex<AnySupervisor>>,
    task: tokio::task::JoinHandle<()>,
}

/// Outcome of one agent's supervised run, sent back to the supervision
/// loop in [`Orchestrator::run`].
struct SessionExit {
    agent_id: String,
    result: Result<(), SupervisorError>,
}

/// Everything the running harness needs in one place. Held behind `Arc`
/// so both the supervision loop and the `BusCallbacks` impl (invoked from
/// request-handling tasks spawned by the bus server) share it.
pub struct Orchestrator {
    pub config: Arc<ConfigFile>,
    pub store: Arc<StateStore>,
    pricing: Arc<PricingTable>,
    worktree: Arc<WorktreeManager>,
    cleanup: EmergencyCleanupRegistry,
    sessions: Mutex<HashMap<String, Session>>,
    exits_tx: mpsc::UnboundedSender<SessionExit>,
    /// Shared with the bus server's `BusState` -- shutdown resolves every
    /// outstanding `escalate_to_user` call through this same registry so
    /// a blocked lead call never hangs the shutdown sequence (spec §5).
    waiters: DecisionWaiters,
    approved_skip_permissions: std::collections::HashSet<String>,
    keep_worktrees: bool,
    shutdown: CancellationToken,
    state_dir: std::path::PathBuf,
    brief_path: std::path::PathBuf,
}

impl Orchestrator {
    /// Run the full startup sequence (spec §4.8): parse config, open
    /// state, verify git, gate on skip-permissions, verify the container
    /// runtime and hosting-provider CLI, start the bus server, spawn the
    /// lead. Returns the running orchestrator plus the receiving half of
    /// its exit channel so `run` can drive the supervision loop.
    pub async fn bootstrap(
        cli: OrchestratorConfig,
    ) -> anyhow::Result<(Arc<Orchestrator>, mpsc::UnboundedReceiver<SessionExit>)> {
        let config = ConfigFile::load(&cli.config_path)?;
        let state_dir = crate::config::resolve_state_dir(&config);
        tokio::fs::create_dir_all(&state_dir).await?;
        let store = StateStore::open(&state_dir)?;

        let repo_root = config.project.repo.clone();
        let worktree = WorktreeManager::open(&repo_root).await?;

        let approved_skip_permissions = gate_skip_permissions(&config, &state_dir).await?;
        verify_container_runtime(&config).await?;
        verify_hosting_provider(&config).await;

        let project = ProjectContext {
            name: config.project.name.clone(),
            description: config.project.description.clone(),
            repo_root: repo_root.clone(),
            started_at: Utc::now(),
        };
        store.set_project(project.clone()).await?;

        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let brief_path = repo_root.join("BRIEF.md");

        let orchestrator = Arc::new(Orchestrator {
            config: Arc::new(config),
            store: Arc::new(store),
            pricing: Arc::new(load_pricing(&state_dir)),
            worktree: Arc::new(worktree),
            cleanup: EmergencyCleanupRegistry::default(),
            sessions: Mutex::new(HashMap::new()),
            exits_tx,
            waiters: DecisionWaiters::default(),
            approved_skip_permissions,
            keep_worktrees: cli.keep_worktrees,
            shutdown: CancellationToken::new(),
            state_dir,
            brief_path,
        });

        orchestrator.start_bus_server();
        orchestrator.spawn_lead(&project).await?;

        Ok((orchestrator, exits_rx))
    }

    fn start_bus_server(self: &Arc<Self>) {
        let bus_state = BusState {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            callbacks: Arc::clone(self) as Arc<dyn BusCallbacks>,
            waiters: self.waiters.clone(),
            brief_path: self.brief_path.clone(),
        };
        let bind = "127.0.0.1";
        let port = self.config.settings.mcp_port;
        tokio::spawn(async move {
            if let Err(err) = run_bus_server(bus_state, bind, port).await {
                tracing::error!(error = %err, "bus server exited with error");
            }
        });
    }

    async fn spawn_lead(&self, project: &ProjectContext) -> anyhow::Result<()> {
        let info = self.worktree.create(LEAD_AGENT_ID).await?;
        let lead_tools = lead_bus_tool_names();
        self.worktree
            .write_claude_md(
                LEAD_AGENT_ID,
                project,
                &lead_tools,
                &[],
                &format!("Lead the project to completion: {}", project.description),
                None,
                &std::fs::read_to_string(&self.config.archie.persona).unwrap_or_default(),
            )
            .await?;

        let agent = Agent {
            id: LEAD_AGENT_ID.to_string(),
            role: LEAD_AGENT_ID.to_string(),
            status: AgentStatus::Spawning,
            task: "lead the project".to_string(),
            resume_token: None,
            worktree_path: info.path.clone(),
            handle: None,
            sandboxed: false,
            skip_permissions: false,
            spawned_at: Utc::now(),
            usage: Default::default(),
            session_context: None,
            completion: None,
            recent_activity: Default::default(),
        };
        self.store.register_agent(agent).await.map_err(anyhow::Error::from)?;

        self.start_session(
            LEAD_AGENT_ID,
            LEAD_AGENT_ID,
            &self.config.archie.model,
            &format!("Lead the project to completion: {}", project.description),
            info.path,
            None,
            None,
            false,
        )
        .await
    }

    /// Append one line to the shared elevated-permissions audit log
    /// (spec §3's state-directory file, one line per execution, not per
    /// approval): instant, event kind, agent id, role, approver. The
    /// approver is always the operator who answered the startup prompt
    /// -- there is no per-agent approval step beyond that gate.
    async fn append_permissions_audit(&self, agent_id: &str, role: &str) {
        let line = format!(
            "{} event=skip_permissions_used agent_id={agent_id} role={role} approver=operator\n",
            Utc::now().to_rfc3339(),
        );
        let path = self.state_dir.join("permissions_audit.log");
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await;
        match file {
            Ok(mut file) => {
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    tracing::warn!(agent_id, role, error = %err, "failed to write permissions audit log");
                }
            }
            Err(err) => tracing::warn!(agent_id, role, error = %err, "failed to open permissions audit log"),
        }
    }

    /// Spawn a Session Supervisor for `agent_id` and start the task that
    /// drains its event stream into the state store and Token Meter, in
    /// stream order, via a dedicated channel rather than one spawned task
    /// per event.
    #[allow(clippy::too_many_arguments)]
    async fn start_session(
        &self,
        agent_id: &str,
        role: &str,
        model_id: &str,
        assignment: &str,
        working_dir: std::path::PathBuf,
        resume_token: Option<String>,
        sandbox: Option<&crate::config::SandboxConfig>,
        skip_permissions: bool,
    ) -> anyhow::Result<()> {
        let bus_config_path = working_dir.join("bus-config.json");
        // Local agents reach the bus on the loopback interface; containerized
        // ones see a different network namespace and need the container
        // runtime's host gateway (same `host.docker.internal` name the
        // sandbox launcher already wires up, see `harness::container`).
        let bus_host = if sandbox.is_some() { "host.docker.internal" } else { "localhost" };
        let bus_config = serde_json::json!({
            "mcpServers": {
                "arch": {
                    "type": "sse",
                    "url": format!("http://{}:{}/sse/{}", bus_host, self.config.settings.mcp_port, agent_id),
                }
            }
        });
        tokio::fs::write(&bus_config_path, serde_json::to_vec_pretty(&bus_config)?).await?;

        if skip_permissions {
            self.append_permissions_audit(agent_id, role).await;
        }

        let task = MaterializedTask {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            model_id: model_id.to_string(),
            assignment: assignment.to_string(),
            working_dir: working_dir.clone(),
            bus_config_path,
            skip_permissions,
            resume_token,
            env_vars: HashMap::new(),
        };

        let mut supervisor = match sandbox {
            Some(cfg) => AnySupervisor::Container(ContainerSupervisor::new(
                agent_id,
                cfg.clone(),
                self.cleanup.clone(),
            )),
            None => AnySupervisor::Local(LocalSupervisor::new(agent_id)),
        };
        supervisor.spawn(&task).await?;

        let supervisor = Arc::new(Mutex::new(supervisor));
        let supervisor_for_task = Arc::clone(&supervisor);
        let store = Arc::clone(&self.store);
        let pricing = Arc::clone(&self.pricing);
        let exits_tx = self.exits_tx.clone();
        let agent_id_owned = agent_id.to_string();
        let model_id_owned = model_id.to_string();

        let join = tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AgentEvent>();

            let drain_store = Arc::clone(&store);
            let drain_pricing = Arc::clone(&pricing);
            let drain_agent = agent_id_owned.clone();
            let drain_model = model_id_owned.clone();
            let drain_task = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    apply_event(&drain_store, &drain_pricing, &drain_agent, &drain_model, event).await;
                }
            });

            let result = {
                let mut sup = supervisor_for_task.lock().await;
                sup.run(move |event| {
                    let _ = event_tx.send(event);
                })
                .await
            };
            let _ = drain_task.await;

            let _ = exits_tx.send(SessionExit {
                agent_id: agent_id_owned,
                result,
            });
        });

        self.sessions.lock().await.insert(
            agent_id.to_string(),
            Session {
                supervisor,
                task: join,
            },
        );
        Ok(())
    }

    /// Handle one completed session: update terminal status unless the
    /// agent already reported completion itself, and notify the lead.
    async fn handle_session_exit(&self, exit: SessionExit) {
        self.sessions.lock().await.remove(&exit.agent_id);

        let final_status = match &exit.result {
            Ok(()) => AgentStatus::Done,
            Err(err) => {
                tracing::warn!(agent_id = %exit.agent_id, error = %err, "agent session exited with an error");
                AgentStatus::Error
            }
        };

        let _ = self
            .store
            .update_agent(&exit.agent_id, |a| {
                if !a.status.is_terminal() {
                    a.status = final_status;
                }
            })
            .await;

        if exit.agent_id != LEAD_AGENT_ID {
            let _ = self
                .store
                .append_message_body(
                    exit.agent_id.clone(),
                    LEAD_AGENT_ID.to_string(),
                    format!("session for {} ended ({:?})", exit.agent_id, final_status),
                )
                .await;
        }
    }

    /// Ask the supervision loop in [`Self::run`] to begin graceful
    /// shutdown. Safe to call from any task holding an `Arc<Orchestrator>`,
    /// including a binary's own Ctrl-C handler.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Supervision loop: watch for session exits and shutdown requests.
    /// The lead gets one restart attempt on an unexpected exit; a second
    /// failure initiates shutdown. Other agents' exits are just recorded.
    pub async fn run(self: Arc<Self>, mut exits_rx: mpsc::UnboundedReceiver<SessionExit>) {
        let mut lead_restarted = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                exit = exits_rx.recv() => {
                    let Some(exit) = exit else { break };
                    if exit.agent_id == LEAD_AGENT_ID && exit.result.is_err() {
                        if lead_restarted {
                            tracing::error!("lead agent failed twice, shutting down");
                            self.shutdown.cancel();
                        } else {
                            lead_restarted = true;
                            let snapshot = self.store.snapshot().await;
                            let resume = snapshot.agents.get(LEAD_AGENT_ID).and_then(|a| a.resume_token.clone());
                            let description = snapshot.project.as_ref().map(|p| p.description.clone()).unwrap_or_default();
                            let path = self.worktree.worktrees_root().join(LEAD_AGENT_ID);
                            if let Err(err) = self
                                .start_session(
                                    LEAD_AGENT_ID,
                                    LEAD_AGENT_ID,
                                    &self.config.archie.model,
                                    &format!("Lead the project to completion: {description}"),
                                    path,
                                    resume,
                                    None,
                                    false,
                                )
                                .await
                            {
                                tracing::error!(error = %err, "failed to restart lead agent");
                                self.shutdown.cancel();
                            }
                        }
                    }
                    self.handle_session_exit(exit).await;
                }
            }

            self.check_budget().await;
        }

        self.graceful_shutdown().await;
    }

    /// Queue a `budget_exceeded` decision the first time cumulative cost
    /// crosses the configured budget. Does not itself stop the run --
    /// the lead (or a human, via the dashboard) decides via
    /// `answer_decision`.
    async fn check_budget(&self) {
        let Some(budget) = self.config.settings.token_budget_usd else {
            return;
        };
        let snapshot = self.store.snapshot().await;
        let total: f64 = snapshot.agents.values().map(|a| a.usage.cost_usd).sum();
        if total < budget {
            return;
        }
        let already_queued = snapshot
            .decisions
            .values()
            .any(|d| d.question.starts_with("budget_exceeded") && d.answer.is_none());
        if !already_queued {
            let _ = self
                .store
                .queue_decision(
                    format!("budget_exceeded: used ${total:.2} of ${budget:.2}"),
                    Some(vec!["continue".to_string(), "stop".to_string()]),
                )
                .await;
        }
    }

    /// Signal every session, wait out a bounded grace period each, remove
    /// worktrees unless opted out, and print a final cost summary.
    async fn graceful_shutdown(&self) {
        // Unblock any lead call still parked in `escalate_to_user` before
        // asking sessions to stop, so the lead's own process can observe
        // the synthetic answer and exit cleanly rather than being killed
        // mid-wait.
        self.waiters.resolve_all_for_shutdown().await;

        let mut sessions = self.sessions.lock().await;
        for (agent_id, session) in sessions.drain() {
            let supervisor = Arc::clone(&session.supervisor);
            let stop = async move {
                let mut sup = supervisor.lock().await;
                let _ = sup.stop().await;
            };
            if tokio::time::timeout(Duration::from_secs(30), stop).await.is_err() {
                tracing::warn!(agent_id, "session did not stop within the grace period");
            }
            session.task.abort();
        }
        drop(sessions);

        if !self.keep_worktrees {
            let snapshot = self.store.snapshot().await;
            for agent_id in snapshot.agents.keys() {
                let _ = self.worktree.remove(agent_id, true).await;
            }
        }

        for name in self.cleanup.outstanding().await {
            tracing::warn!(container = %name, "container left running after shutdown, removing");
            let _ = tokio::process::Command::new("docker").args(["rm", "-f", &name]).output().await;
        }

        let snapshot = self.store.snapshot().await;
        let total_cost: f64 = snapshot.agents.values().map(|a| a.usage.cost_usd).sum();
        let total_tokens: u64 = snapshot
            .agents
            .values()
            .map(|a| a.usage.input_tokens + a.usage.output_tokens)
            .sum();
        tracing::info!(total_cost_usd = total_cost, total_tokens, agents = snapshot.agents.len(), "shutdown complete");
    }
}

/// Feed one parsed agent event into the state store (activity log,
/// terminal resume token) and the Token Meter, in the order it arrived.
async fn apply_event(
    store: &Arc<StateStore>,
    pricing: &Arc<PricingTable>,
    agent_id: &str,
    model_id: &str,
    event: AgentEvent,
) {
    match event {
        AgentEvent::Message { content, .. } => {
            let _ = store.update_agent(agent_id, |a| a.push_activity(content.clone())).await;
        }
        AgentEvent::ToolCall { tool, .. } => {
            let _ = store.update_agent(agent_id, |a| a.push_activity(format!("tool_call: {tool}"))).await;
        }
        AgentEvent::Usage { reading, .. } => {
            let _ = store
                .update_agent(agent_id, |a| apply_usage(&mut a.usage, reading, model_id, pricing))
                .await;
        }
        AgentEvent::Completed { resume_token } => {
            let _ = store.update_agent(agent_id, |a| a.resume_token = resume_token.clone()).await;
        }
        AgentEvent::Error { message } => {
            tracing::warn!(agent_id, message, "agent reported an error event");
        }
        AgentEvent::ToolResult { .. } => {}
    }
}

/// Tools every agent, lead or specialist, may call (spec §4.4 "Available
/// to every agent").
const BUS_TOOL_NAMES: &[&str] = &[
    "send_message",
    "get_messages",
    "update_status",
    "report_completion",
    "save_progress",
];

/// Tools only the lead may call (spec §4.4 "Available to the lead agent
/// only"). Listed separately from [`BUS_TOOL_NAMES`] purely so each
/// agent's `CLAUDE.md` documents the tool surface it actually has --
/// authorization itself is enforced independently in `bus::dispatch`.
const LEAD_ONLY_BUS_TOOL_NAMES: &[&str] = &[
    "spawn_agent",
    "teardown_agent",
    "list_agents",
    "escalate_to_user",
    "request_merge",
    "get_project_context",
    "update_brief",
    "close_project",
    "create_task",
    "create_issue",
    "list_issues",
    "update_issue",
    "close_issue",
    "add_comment",
    "create_milestone",
    "list_milestones",
];

/// The lead's full tool surface: the shared set plus the lead-only set.
fn lead_bus_tool_names() -> Vec<&'static str> {
    BUS_TOOL_NAMES.iter().chain(LEAD_ONLY_BUS_TOOL_NAMES.iter()).copied().collect()
}

#[async_trait]
impl BusCallbacks for Orchestrator {
    async fn spawn_agent(
        &self,
        role: &str,
        assignment: &str,
        context: Option<&str>,
        skip_permissions: bool,
    ) -> Result<SpawnedAgent, BusError> {
        let entry = self
            .config
            .role(role)
            .ok_or_else(|| BusError::UnknownRole(role.to_string()))?
            .clone();

        if skip_permissions && !self.approved_skip_permissions.contains(role) {
            return Err(BusError::PermissionNotPreApproved(role.to_string()));
        }

        // Reserves the id and registers a placeholder record atomically
        // under the store's single writer lock, so two concurrent calls
        // for a capped role can never both pass the check and mint the
        // same id -- the bug the old count-then-format-then-register
        // sequence had.
        let agent = self
            .store
            .reserve_agent(
                role,
                entry.max_instances,
                self.config.settings.max_concurrent_agents,
                assignment.to_string(),
                entry.sandbox.enabled,
                skip_permissions,
            )
            .await?;
        let agent_id = agent.id.clone();

        let result: Result<(), BusError> = async {
            let info = self
                .worktree
                .create(&agent_id)
                .await
                .map_err(|e| BusError::Internal(e.to_string()))?;

            let snapshot = self.store.snapshot().await;
            let roster: Vec<String> =
                snapshot.agents.keys().filter(|id| *id != &agent_id).cloned().collect();
            let persona = std::fs::read_to_string(&entry.persona).unwrap_or_default();
            let project = snapshot
                .project
                .clone()
                .ok_or_else(|| BusError::Internal("no project context".into()))?;

            let full_assignment = match context {
                Some(ctx) => format!("{assignment}\n\nContext:\n{ctx}"),
                None => assignment.to_string(),
            };

            self.worktree
                .write_claude_md(&agent_id, &project, BUS_TOOL_NAMES, &roster, &full_assignment, None, &persona)
                .await
                .map_err(|e| BusError::Internal(e.to_string()))?;

            self.store
                .update_agent(&agent_id, |a| a.worktree_path = info.path.clone())
                .await?;

            self.start_session(
                &agent_id,
                role,
                &entry.model,
                &full_assignment,
                info.path.clone(),
                None,
                entry.sandbox.enabled.then_some(&entry.sandbox),
                skip_permissions,
            )
            .await
            .map_err(|e| BusError::Internal(e.to_string()))?;

            Ok(())
        }
        .await;

        if let Err(e) = result {
            // Worktree creation, CLAUDE.md, or session start failed after
            // the id was reserved -- drop the placeholder so it doesn't
            // linger as a permanently-Spawning record. The id itself is
            // never reused regardless, since the per-role counter only
            // ever increments.
            let _ = self.store.remove_agent(&agent_id).await;
            return Err(e);
        }

        let worktree_path = self.store.snapshot().await.agents[&agent_id].worktree_path.clone();

        Ok(SpawnedAgent {
            agent_id,
            worktree_path: worktree_path.display().to_string(),
            sandboxed: entry.sandbox.enabled,
            skip_permissions,
            status: "spawning".to_string(),
        })
    }

    async fn teardown_agent(&self, agent_id: &str) -> Result<(), BusError> {
        if agent_id == LEAD_AGENT_ID {
            return Err(BusError::CannotTeardownLead);
        }

        if let Some(session) = self.sessions.lock().await.remove(agent_id) {
            let mut sup = session.supervisor.lock().await;
            let _ = sup.stop().await;
            drop(sup);
            session.task.abort();
        }

        if !self.keep_worktrees {
            self.worktree
                .remove(agent_id, true)
                .await
                .map_err(|e| BusError::Internal(e.to_string()))?;
        }

        self.store.remove_agent(agent_id).await?;
        Ok(())
    }

    async fn request_merge(
        &self,
        agent_id: &str,
        target: &str,
        pr_title: Option<&str>,
        pr_body: Option<&str>,
    ) -> Result<MergeOutcome, BusError> {
        if let Some(title) = pr_title {
            let result = self
                .worktree
                .create_pull_request(agent_id, target, title, pr_body.unwrap_or_default(), self.config.github.as_ref())
                .await;
            return match result {
                Ok(url) => Ok(MergeOutcome::PullRequest { url }),
                Err(WorktreeError::ProviderDisabled) => Err(BusError::ProviderDisabled),
                Err(WorktreeError::ProviderUnavailable(m)) => Err(BusError::ProviderUnavailable(m)),
                Err(WorktreeError::ProviderCallFailed(m)) => Err(BusError::ProviderCallFailed(m)),
                Err(e) => Err(BusError::Internal(e.to_string())),
            };
        }

        match self.worktree.merge(agent_id, target).await {
            Ok(MergeResult::Success) => Ok(MergeOutcome::Merged),
            Ok(MergeResult::Conflict { details }) => Ok(MergeOutcome::Conflict { details }),
            Err(WorktreeError::ProviderDisabled) => Err(BusError::ProviderDisabled),
            Err(WorktreeError::ProviderUnavailable(m)) => Err(BusError::ProviderUnavailable(m)),
            Err(WorktreeError::ProviderCallFailed(m)) => Err(BusError::ProviderCallFailed(m)),
            Err(e) => Err(BusError::Internal(e.to_string())),
        }
    }

    async fn close_project(&self) -> Result<(), BusError> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn create_issue(&self, title: &str, body: &str) -> Result<Issue, BusError> {
        let github = self.config.github.as_ref().ok_or(BusError::ProviderDisabled)?;
        github::create_issue(github, &self.config.project.repo, title, body)
            .await
            .map_err(github_err)
    }

    async fn list_issues(&self, state: &str) -> Result<Vec<Issue>, BusError> {
        let github = self.config.github.as_ref().ok_or(BusError::ProviderDisabled)?;
        github::list_issues(github, &self.config.project.repo, state).await.map_err(github_err)
    }

    async fn update_issue(&self, number: u64, title: Option<&str>, body: Option<&str>) -> Result<Issue, BusError> {
        let github = self.config.github.as_ref().ok_or(BusError::ProviderDisabled)?;
        github::update_issue(github, &self.config.project.repo, number, title, body)
            .await
            .map_err(github_err)
    }

    async fn close_issue(&self, number: u64) -> Result<(), BusError> {
        let github = self.config.github.as_ref().ok_or(BusError::ProviderDisabled)?;
        github::close_issue(github, &self.config.project.repo, number).await.map_err(github_err)
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<(), BusError> {
        let github = self.config.github.as_ref().ok_or(BusError::ProviderDisabled)?;
        github::add_comment(github, &self.config.project.repo, number, body).await.map_err(github_err)
    }

    async fn create_milestone(&self, title: &str) -> Result<Milestone, BusError> {
        let github = self.config.github.as_ref().ok_or(BusError::ProviderDisabled)?;
        github::create_milestone(github, &self.config.project.repo, title).await.map_err(github_err)
    }

    async fn list_milestones(&self) -> Result<Vec<Milestone>, BusError> {
        let github = self.config.github.as_ref().ok_or(BusError::ProviderDisabled)?;
        github::list_milestones(github, &self.config.project.repo).await.map_err(github_err)
    }

    async fn git_status(&self) -> Result<String, BusError> {
        let output = tokio::process::Command::new("git")
            .args(["status", "--porcelain", "--branch"])
            .current_dir(&self.config.project.repo)
            .output()
            .await
            .map_err(|e| BusError::Internal(e.to_string()))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Translate the hosting-provider wrapper's error kind into the bus's,
/// one-to-one -- both split disabled/unavailable/call-failed the same way.
fn github_err(err: GithubError) -> BusError {
    match err {
        GithubError::ProviderDisabled => BusError::ProviderDisabled,
        GithubError::ProviderUnavailable(m) => BusError::ProviderUnavailable(m),
        GithubError::ProviderCallFailed(m) => BusError::ProviderCallFailed(m),
    }
}

async fn gate_skip_permissions(
    config: &ConfigFile,
    state_dir: &std::path::Path,
) -> anyhow::Result<std::collections::HashSet<String>> {
    let flagged = flagged_skip_permission_roles(config);
    if flagged.is_empty() {
        return Ok(std::collections::HashSet::new());
    }

    println!("The following roles run with --dangerously-skip-permissions:");
    for role in &flagged {
        println!("  - {role}");
    }
    println!("Type \"yes\" to continue, anything else to abort:");

    // Offloaded to a blocking worker so a human reading the prompt never
    // stalls the reactor.
    let confirmed = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok();
        line.trim() == "yes"
    })
    .await?;

    gate_skip_permissions_with_confirmation(flagged, confirmed, state_dir).await
}

pub fn flagged_skip_permission_roles(config: &ConfigFile) -> Vec<String> {
    config
        .agent_pool
        .iter()
        .filter(|r| r.permissions.skip_permissions)
        .map(|r| r.id.clone())
        .collect()
}

/// The decision half of the skip-permissions startup gate, separated from
/// stdin handling so it can be driven deterministically (spec §4.8's
/// "abort if not confirmed" behavior) without an interactive terminal.
pub async fn gate_skip_permissions_with_confirmation(
    flagged: Vec<String>,
    confirmed: bool,
    state_dir: &std::path::Path,
) -> anyhow::Result<std::collections::HashSet<String>> {
    if flagged.is_empty() {
        return Ok(std::collections::HashSet::new());
    }

    if !confirmed {
        anyhow::bail!("skip-permissions assent not given, aborting startup");
    }

    let audit_line = format!(
        "{} event=skip_permissions_approved roles={}\n",
        Utc::now().to_rfc3339(),
        flagged.join(",")
    );
    if let Ok(mut file) = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(state_dir.join("permissions_audit.log"))
        .await
    {
        let _ = file.write_all(audit_line.as_bytes()).await;
    }

    Ok(flagged.into_iter().collect())
}

async fn verify_container_runtime(config: &ConfigFile) -> anyhow::Result<()> {
    let needs_containers = config.agent_pool.iter().any(|r| r.sandbox.enabled);
    if !needs_containers {
        return Ok(());
    }
    let output = tokio::process::Command::new("docker").arg("info").output().await;
    match output {
        Ok(o) if o.status.success() => Ok(()),
        _ => anyhow::bail!("container runtime unavailable but at least one role requires sandboxing"),
    }
}

async fn verify_hosting_provider(config: &ConfigFile) {
    let Some(_github) = &config.github else { return };
    let output = tokio::process::Command::new("gh").args(["auth", "status"]).output().await;
    if !matches!(output, Ok(o) if o.status.success()) {
        tracing::warn!("hosting-provider CLI unavailable or not authenticated; merge/PR tools disabled for this run");
    }
}

fn load_pricing(state_dir: &std::path::Path) -> PricingTable {
    let path = state_dir.join("pricing.yaml");
    PricingTable::load(&path).unwrap_or_default()
}
