//! The Session Supervisor contract (spec §4.5): two execution variants
//! -- local subprocess, containerized -- share one externally visible
//! interface and one output-parsing pipeline.
//!
//! Unlike the teacher's `Harness` trait, `run` below is generic over its
//! callback so the orchestrator never boxes the per-event closure --
//! which makes `dyn Supervisor` not object-safe. The orchestrator holds
//! concrete variants in an `AnySupervisor` enum instead of a trait object.

use async_trait::async_trait;

use crate::error::SupervisorError;
use crate::harness::types::MaterializedTask;

/// Spawn, monitor, and stop one agent process. Implementors own the
/// subprocess or container they create.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// The agent id this supervisor was constructed for.
    fn agent_id(&self) -> &str;

    /// Start the AI CLI for `task`. The output-parsing pipeline is
    /// driven separately via [`Supervisor::run`]; `spawn` only starts
    /// the process and returns once it is running.
    async fn spawn(&mut self, task: &MaterializedTask) -> Result<(), SupervisorError>;

    /// Drive the supervisor's output-parsing pipeline to completion,
    /// invoking `on_event` for every line decoded from the process's
    /// stdout and running the exit handler exactly once when the
    /// stream ends. Exceptions raised by `on_event` are caught and
    /// logged, never allowed to propagate into the parsing loop.
    async fn run<F>(&mut self, on_event: F) -> Result<(), SupervisorError>
    where
        F: FnMut(crate::harness::types::AgentEvent) + Send;

    /// Request termination. Races safely with the natural end-of-stream
    /// path -- the exit handler fires exactly once regardless of which
    /// side observes the session ending first.
    async fn stop(&mut self) -> Result<(), SupervisorError>;

    /// Whether the underlying process/container is still alive.
    async fn is_running(&self) -> bool;

    /// The opaque resume token the AI CLI handed back at exit, if any.
    fn resume_token(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A no-op supervisor, used only to confirm the trait's basic shape.
    struct NoopSupervisor {
        id: String,
    }

    #[async_trait]
    impl Supervisor for NoopSupervisor {
        fn agent_id(&self) -> &str {
            &self.id
        }

        async fn spawn(&mut self, _task: &MaterializedTask) -> Result<(), SupervisorError> {
            Ok(())
        }

        async fn run<F>(&mut self, _on_event: F) -> Result<(), SupervisorError>
        where
            F: FnMut(crate::harness::types::AgentEvent) + Send,
        {
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), SupervisorError> {
            Ok(())
        }

        async fn is_running(&self) -> bool {
            false
        }

        fn resume_token(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn noop_supervisor_satisfies_the_trait() {
        let mut s = NoopSupervisor { id: "qa-1".into() };
        assert_eq!(s.agent_id(), "qa-1");
        assert!(!s.is_running().await);
        assert!(s.resume_token().is_none());
    }
}
