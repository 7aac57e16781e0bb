//! The State Store: a single in-memory aggregate, partitioned by kind,
//! behind a single-writer lock. Every mutating call serializes the
//! affected partition to its JSON mirror via [`persist::write_atomic`]
//! before returning, so a reader of the files on disk never observes a
//! torn write.
//!
//! Readers that want a point-in-time view take [`StateStore::snapshot`]
//! rather than holding the writer lock across any I/O -- this is what
//! lets the Dashboard Contract poll without contending with tool calls.

pub mod persist;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StateError;
use crate::model::{
    Agent, AgentStatus, Cursors, Message, PendingDecision, ProjectContext, Task, TaskStatus,
    BROADCAST, LEAD_AGENT_ID,
};

/// In-memory aggregate. Cloned wholesale for a reader snapshot.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub project: Option<ProjectContext>,
    pub agents: HashMap<String, Agent>,
    pub messages: Vec<Message>,
    pub decisions: HashMap<u64, PendingDecision>,
    pub tasks: HashMap<u64, Task>,
    pub cursors: Cursors,
}

struct Inner {
    snapshot: StateSnapshot,
    next_message_id: u64,
    next_decision_id: u64,
    next_task_id: u64,
    /// Per-role monotonic sequence used to mint agent ids (`"{role}-{n}"`).
    /// Never decremented, even when the agent it named is torn down, so an
    /// id is never reused for the life of the run.
    next_role_seq: HashMap<String, u64>,
}

/// Partition file names under the state directory.
mod files {
    pub const AGENTS: &str = "agents.json";
    pub const MESSAGES: &str = "messages.json";
    pub const USAGE: &str = "usage.json"; // usage is embedded per-agent; mirrored separately for the dashboard's convenience.
    pub const TASKS: &str = "tasks.json";
    pub const DECISIONS: &str = "decisions.json";
    pub const CURSOR: &str = "archie-cursor.json";
    pub const PROJECT: &str = "project.json";
    pub const ROLE_SEQ: &str = "role_seq.json";
}

pub struct StateStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Open (and, on first run, create) the state directory, loading any
    /// prior run's partitions. Corrupt partitions are logged and reset to
    /// empty rather than failing the whole run.
    pub fn open(dir: &Path) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir).map_err(|source| StateError::Persist {
            partition: "state_dir".into(),
            source,
        })?;

        let agents = Self::load_partition::<HashMap<String, Agent>>(dir, files::AGENTS);
        let messages = Self::load_partition::<Vec<Message>>(dir, files::MESSAGES);
        let tasks_vec = Self::load_partition::<Vec<Task>>(dir, files::TASKS);
        let decisions_vec = Self::load_partition::<Vec<PendingDecision>>(dir, files::DECISIONS);
        let cursors = Self::load_partition::<Cursors>(dir, files::CURSOR);
        let project = Self::load_partition::<Option<ProjectContext>>(dir, files::PROJECT);
        let mut next_role_seq = Self::load_partition::<HashMap<String, u64>>(dir, files::ROLE_SEQ);

        let next_message_id = messages.iter().map(|m| m.id).max().unwrap_or(0) + 1;
        let next_decision_id = decisions_vec.iter().map(|d| d.id).max().unwrap_or(0) + 1;
        let next_task_id = tasks_vec.iter().map(|t| t.id).max().unwrap_or(0) + 1;

        // Reconcile against whatever ids agents.json actually has, in case
        // role_seq.json is missing, stale, or from a version that didn't
        // write it: never let the counter start below the highest suffix
        // already in use for a role, or a freshly reserved id could
        // collide with one still on disk.
        for (id, agent) in &agents {
            if let Some((_, suffix)) = id.rsplit_once('-') {
                if let Ok(n) = suffix.parse::<u64>() {
                    let slot = next_role_seq.entry(agent.role.clone()).or_insert(0);
                    if n > *slot {
                        *slot = n;
                    }
                }
            }
        }

        let tasks = tasks_vec.into_iter().map(|t| (t.id, t)).collect();
        let decisions = decisions_vec.into_iter().map(|d| (d.id, d)).collect();

        Ok(StateStore {
            dir: dir.to_path_buf(),
            inner: Mutex::new(Inner {
                snapshot: StateSnapshot {
                    project,
                    agents,
                    messages,
                    decisions,
                    tasks,
                    cursors,
                },
                next_message_id,
                next_decision_id,
                next_task_id,
                next_role_seq,
            }),
        })
    }

    fn load_partition<T>(dir: &Path, name: &str) -> T
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let path = dir.join(name);
        match persist::load_or_default::<T>(&path, T::default()) {
            persist::LoadOutcome::Loaded(v) => v,
            persist::LoadOutcome::Missing(v) => v,
            persist::LoadOutcome::Corrupt(v) => {
                tracing::warn!(partition = name, "state partition corrupt, reinitializing empty");
                v
            }
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Set the immutable project context. Called once, at startup.
    /// Persisted so a later `arch status` invocation -- a fresh process,
    /// opening its own `StateStore` -- can still report it.
    pub async fn set_project(&self, project: ProjectContext) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        inner.snapshot.project = Some(project);
        persist::write_atomic(&self.path(files::PROJECT), "project", &inner.snapshot.project)
    }

    /// Take a cloned point-in-time view. Never holds the writer lock
    /// across I/O -- callers do their own rendering after this returns.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().await.snapshot.clone()
    }

    // -- agents ----------------------------------------------------------

    pub async fn register_agent(&self, agent: Agent) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        if inner.snapshot.agents.contains_key(&agent.id) {
            return Err(StateError::DuplicateAgentId(agent.id.clone()));
        }
        inner.snapshot.agents.insert(agent.id.clone(), agent);
        self.flush_agents(&inner.snapshot)
    }

    /// Atomically check the role/global concurrency caps, mint the next
    /// id for `role`, and register a placeholder agent record under it --
    /// all under the single writer lock, so two concurrent spawns of the
    /// same capped role can never both pass the check and collide on the
    /// id the way a separate count-then-format-then-register sequence can.
    ///
    /// The returned `Agent` has a placeholder `worktree_path`; the caller
    /// fills it in with `update_agent` once the real worktree exists, and
    /// rolls the reservation back with `remove_agent` if anything after
    /// that point fails. The minted id is never reused even then, since
    /// the per-role sequence only ever increments.
    #[allow(clippy::too_many_arguments)]
    pub async fn reserve_agent(
        &self,
        role: &str,
        role_max: u32,
        global_max: u32,
        task: String,
        sandboxed: bool,
        skip_permissions: bool,
    ) -> Result<Agent, StateError> {
        let mut inner = self.inner.lock().await;

        let role_count = inner
            .snapshot
            .agents
            .values()
            .filter(|a| !a.status.is_terminal() && a.role == role)
            .count() as u32;
        if role_count >= role_max {
            return Err(StateError::RoleCapExceeded {
                role: role.to_string(),
                current: role_count,
                max: role_max,
            });
        }

        let global_count = inner
            .snapshot
            .agents
            .values()
            .filter(|a| !a.status.is_terminal())
            .count() as u32;
        if global_count >= global_max {
            return Err(StateError::GlobalCapExceeded {
                current: global_count,
                max: global_max,
            });
        }

        let seq = inner.next_role_seq.entry(role.to_string()).or_insert(0);
        *seq += 1;
        let agent_id = format!("{role}-{seq}");

        let agent = Agent {
            id: agent_id.clone(),
            role: role.to_string(),
            status: AgentStatus::Spawning,
            task,
            resume_token: None,
            worktree_path: PathBuf::new(),
            handle: None,
            sandboxed,
            skip_permissions,
            spawned_at: Utc::now(),
            usage: crate::model::UsageSubrecord::default(),
            session_context: None,
            completion: None,
            recent_activity: std::collections::VecDeque::new(),
        };
        inner.snapshot.agents.insert(agent_id, agent.clone());

        self.flush_agents(&inner.snapshot)?;
        persist::write_atomic(&self.path(files::ROLE_SEQ), "role_seq", &inner.next_role_seq)?;

        Ok(agent)
    }

    /// Apply an arbitrary patch closure to an agent record, validating
    /// any status the closure sets against the closed status enum before
    /// committing. Mirrors the teacher's "validate then write" shape for
    /// `update_agent`.
    pub async fn update_agent<F>(&self, id: &str, patch: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut Agent),
    {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .snapshot
            .agents
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownAgent(id.to_string()))?;
        patch(agent);
        self.flush_agents(&inner.snapshot)
    }

    pub async fn remove_agent(&self, id: &str) -> Result<Agent, StateError> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .snapshot
            .agents
            .remove(id)
            .ok_or_else(|| StateError::UnknownAgent(id.to_string()))?;
        self.flush_agents(&inner.snapshot)?;
        Ok(agent)
    }

    pub async fn active_count(&self, role_filter: Option<&str>) -> u32 {
        let inner = self.inner.lock().await;
        inner
            .snapshot
            .agents
            .values()
            .filter(|a| !a.status.is_terminal())
            .filter(|a| role_filter.map(|r| a.role == r).unwrap_or(true))
            .count() as u32
    }

    fn flush_agents(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        persist::write_atomic(&self.path(files::AGENTS), "agents", &snapshot.agents)?;
        // usage.json mirrors a denormalized agent-id -> usage view for
        // the dashboard, refreshed alongside agents since usage lives on
        // the agent record.
        let usage: HashMap<&str, &crate::model::UsageSubrecord> = snapshot
            .agents
            .iter()
            .map(|(id, a)| (id.as_str(), &a.usage))
            .collect();
        persist::write_atomic(&self.path(files::USAGE), "usage", &usage)
    }

    // -- messages ----------------------------------------------------------

    /// Append a message. The id is the next value of a monotone counter
    /// held behind the single writer lock, so concurrent callers can
    /// never observe the same id (Testable Property 3).
    pub async fn append_message_body(
        &self,
        from: String,
        to: String,
        body: String,
    ) -> Result<Message, StateError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_message_id;
        inner.next_message_id += 1;
        let message = Message {
            id,
            from,
            to,
            body,
            timestamp: Utc::now(),
            read: false,
        };
        inner.snapshot.messages.push(message.clone());
        persist::write_atomic(&self.path(files::MESSAGES), "messages", &inner.snapshot.messages)?;
        Ok(message)
    }

    /// Messages with id > cursor addressed to `recipient` or broadcast.
    /// If `cursor` is `None` and `recipient == "lead"`, the persisted
    /// cursor is used instead. The lead's new cursor is persisted before
    /// returning.
    pub async fn messages_since(
        &self,
        recipient: &str,
        cursor: Option<u64>,
    ) -> Result<(Vec<Message>, u64), StateError> {
        let mut inner = self.inner.lock().await;
        let effective_cursor = match cursor {
            Some(c) => c,
            None if recipient == LEAD_AGENT_ID => {
                *inner.snapshot.cursors.get(LEAD_AGENT_ID).unwrap_or(&0)
            }
            None => 0,
        };

        let matched: Vec<Message> = inner
            .snapshot
            .messages
            .iter()
            .filter(|m| m.id > effective_cursor)
            .filter(|m| m.to == recipient || m.to == BROADCAST)
            .cloned()
            .collect();

        let new_cursor = matched.last().map(|m| m.id).unwrap_or(effective_cursor);

        if recipient == LEAD_AGENT_ID {
            inner
                .snapshot
                .cursors
                .insert(LEAD_AGENT_ID.to_string(), new_cursor);
            persist::write_atomic(&self.path(files::CURSOR), "cursor", &inner.snapshot.cursors)?;
        }

        Ok((matched, new_cursor))
    }

    // -- pending decisions ------------------------------------------------

    pub async fn queue_decision(
        &self,
        question: String,
        options: Option<Vec<String>>,
    ) -> Result<u64, StateError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_decision_id;
        inner.next_decision_id += 1;
        let decision = PendingDecision {
            id,
            question,
            options,
            asked_at: Utc::now(),
            answered_at: None,
            answer: None,
        };
        inner.snapshot.decisions.insert(id, decision);
        self.flush_decisions(&inner.snapshot)?;
        Ok(id)
    }

    /// Resolve a pending decision. Idempotent: answering an already
    /// answered id is a no-op that returns the original answer.
    pub async fn answer_decision(&self, id: u64, answer: String) -> Result<String, StateError> {
        let mut inner = self.inner.lock().await;
        let decision = inner
            .snapshot
            .decisions
            .get_mut(&id)
            .ok_or(StateError::UnknownAgent(format!("decision {id}")))?;

        if let Some(existing) = &decision.answer {
            return Ok(existing.clone());
        }

        decision.answered_at = Some(Utc::now());
        decision.answer = Some(answer.clone());
        self.flush_decisions(&inner.snapshot)?;
        Ok(answer)
    }

    fn flush_decisions(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let list: Vec<&PendingDecision> = snapshot.decisions.values().collect();
        persist::write_atomic(&self.path(files::DECISIONS), "decisions", &list)
    }

    // -- tasks -------------------------------------------------------------

    pub async fn create_task(&self, assignee: String, description: String) -> Result<Task, StateError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_task_id;
        inner.next_task_id += 1;
        let task = Task {
            id,
            assignee,
            description,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };
        inner.snapshot.tasks.insert(id, task.clone());
        self.flush_tasks(&inner.snapshot)?;
        Ok(task)
    }

    pub async fn update_task_status(&self, id: u64, status: TaskStatus) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .snapshot
            .tasks
            .get_mut(&id)
            .ok_or(StateError::UnknownAgent(format!("task {id}")))?;
        task.status = status;
        if status == TaskStatus::Done {
            task.completed_at = Some(Utc::now());
        }
        self.flush_tasks(&inner.snapshot)
    }

    fn flush_tasks(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let list: Vec<&Task> = snapshot.tasks.values().collect();
        persist::write_atomic(&self.path(files::TASKS), "tasks", &list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStatus, ExecutionHandle, UsageSubrecord};
    use std::collections::VecDeque;

    fn sample_agent(id: &str, role: &str) -> Agent {
        Agent {
            id: id.to_string(),
            role: role.to_string(),
            status: AgentStatus::Spawning,
            task: "hello".to_string(),
            resume_token: None,
            worktree_path: PathBuf::from("/tmp").join(id),
            handle: Some(ExecutionHandle::Local { pid: 123 }),
            sandboxed: false,
            skip_permissions: false,
            spawned_at: Utc::now(),
            usage: UsageSubrecord::default(),
            session_context: None,
            completion: None,
            recent_activity: VecDeque::new(),
        }
    }

    #[tokio::test]
    async fn register_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.register_agent(sample_agent("frontend-1", "frontend")).await.unwrap();
        let err = store
            .register_agent(sample_agent("frontend-1", "frontend"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::DuplicateAgentId(_)));
    }

    #[tokio::test]
    async fn messages_since_respects_cursor_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store
            .append_message_body("lead".into(), "frontend-1".into(), "hi".into())
            .await
            .unwrap();
        store
            .append_message_body("lead".into(), BROADCAST.into(), "everyone".into())
            .await
            .unwrap();
        store
            .append_message_body("lead".into(), "backend-1".into(), "not for you".into())
            .await
            .unwrap();

        let (msgs, cursor) = store.messages_since("frontend-1", Some(0)).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(cursor, 2);
    }

    #[tokio::test]
    async fn lead_cursor_persists_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store
            .append_message_body("frontend-1".into(), LEAD_AGENT_ID.into(), "a".into())
            .await
            .unwrap();
        store
            .append_message_body("frontend-1".into(), LEAD_AGENT_ID.into(), "b".into())
            .await
            .unwrap();

        let (msgs, cursor) = store.messages_since(LEAD_AGENT_ID, None).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(cursor, 2);

        // Reopen the store from disk; the persisted cursor should mean
        // a subsequent no-cursor call to the lead yields nothing new.
        let store2 = StateStore::open(dir.path()).unwrap();
        let (msgs2, cursor2) = store2.messages_since(LEAD_AGENT_ID, None).await.unwrap();
        assert!(msgs2.is_empty());
        assert_eq!(cursor2, 2);
    }

    #[tokio::test]
    async fn answer_decision_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let id = store.queue_decision("Merge?".into(), Some(vec!["y".into(), "n".into()])).await.unwrap();
        let first = store.answer_decision(id, "y".into()).await.unwrap();
        let second = store.answer_decision(id, "n".into()).await.unwrap();
        assert_eq!(first, "y");
        assert_eq!(second, "y");
    }

    #[tokio::test]
    async fn project_context_survives_a_fresh_process_opening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store
                .set_project(crate::model::ProjectContext {
                    name: "widgets".into(),
                    description: "build widgets".into(),
                    repo_root: PathBuf::from("/repo"),
                    started_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        // Simulates `arch status`: a brand new process, a brand new
        // `StateStore`, no in-memory state carried over.
        let reopened = StateStore::open(dir.path()).unwrap();
        let snapshot = reopened.snapshot().await;
        assert_eq!(snapshot.project.unwrap().name, "widgets");
    }

    #[tokio::test]
    async fn persist_then_reload_is_deep_equal_for_agents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.register_agent(sample_agent("frontend-1", "frontend")).await.unwrap();
        }
        let store2 = StateStore::open(dir.path()).unwrap();
        let snap = store2.snapshot().await;
        assert_eq!(snap.agents.len(), 1);
        assert_eq!(snap.agents["frontend-1"].role, "frontend");
    }

    #[tokio::test]
    async fn concurrent_send_message_never_collides_on_id() {
        use std::sync::Arc;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message_body("lead".into(), BROADCAST.into(), format!("msg {i}"))
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids: Vec<u64> = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len(), "no two sends should share an id");
    }
}
