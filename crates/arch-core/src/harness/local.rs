//! Local-subprocess Session Supervisor: spawns the AI CLI directly on the
//! host, inside the agent's worktree.
//!
//! Grounded on the teacher's `ClaudeCodeAdapter`: same stdout-is-JSONL
//! parsing loop, same SIGTERM-then-SIGKILL stop sequence via `libc`. Two
//! things this component adds that the teacher's adapter does not need:
//! stderr is actively drained on its own task so a chatty child can never
//! block on a full pipe, and the exit path is guarded so it runs exactly
//! once no matter whether end-of-stream or an external `stop()` gets
//! there first.
//!
//! The elevated-permissions audit log (one line per spawn that sets
//! `--dangerously-skip-permissions`, recording agent id and role) is
//! written by the orchestrator, which is the only component that knows
//! the shared state directory -- this module only decides whether to
//! add the flag.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use crate::error::SupervisorError;
use crate::harness::trait_def::Supervisor;
use crate::harness::types::{AgentEvent, MaterializedTask};
use crate::token::parse_event_line;

/// A locally spawned AI CLI process.
pub struct LocalSupervisor {
    agent_id: String,
    cli_binary: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    model_id: String,
    resume_token: Option<String>,
    exited: Arc<AtomicBool>,
}

impl LocalSupervisor {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self::with_binary(agent_id, "claude")
    }

    /// Construct pointed at a specific binary. Exists so tests can point
    /// this at a fake shell script instead of a real AI CLI.
    pub fn with_binary(agent_id: impl Into<String>, cli_binary: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            cli_binary: cli_binary.into(),
            child: None,
            stdout: None,
            model_id: String::new(),
            resume_token: None,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Supervisor for LocalSupervisor {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn spawn(&mut self, task: &MaterializedTask) -> Result<(), SupervisorError> {
        let mut cmd = Command::new(&self.cli_binary);
        cmd.arg("-p")
            .arg("--model")
            .arg(&task.model_id)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--mcp-config")
            .arg(&task.bus_config_path);

        if let Some(token) = &task.resume_token {
            cmd.arg("--resume").arg(token);
        }

        if task.skip_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }

        // The spawn prompt is the final positional argument, matching the
        // container supervisor, rather than delivered over stdin.
        cmd.arg(&task.assignment);

        cmd.current_dir(&task.working_dir);
        for (key, value) in &task.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(stderr) = stderr {
            let agent_id = self.agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(agent_id = %agent_id, stderr = %line, "agent stderr");
                }
            });
        }

        if let Some(mut stdin) = child.stdin.take() {
            // Nothing is written; stdin is only closed so a child that
            // reads until EOF (as the test fixtures do) doesn't block.
            let _ = stdin.shutdown().await;
        }

        self.child = Some(child);
        self.stdout = stdout;
        self.model_id = task.model_id.clone();
        Ok(())
    }

    async fn run<F>(&mut self, mut on_event: F) -> Result<(), SupervisorError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let Some(stdout) = self.stdout.take() else {
            return Ok(());
        };

        let model_id = self.model_id.clone();
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_event_line(&line, &model_id) {
                    Ok(events) => {
                        for event in events {
                            if let AgentEvent::Completed { resume_token } = &event {
                                self.resume_token = resume_token.clone();
                            }
                            on_event(event);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(agent_id = %self.agent_id, line = %line, error = %err, "skipping malformed stream-json line");
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(agent_id = %self.agent_id, error = %err, "error reading agent stdout");
                    break;
                }
            }
        }

        self.finish_once().await
    }

    async fn stop(&mut self) -> Result<(), SupervisorError> {
        if let Some(child) = &mut self.child {
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                {
                    // SAFETY: pid is the id of a child we spawned and still hold.
                    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                    if ret != 0 {
                        tracing::warn!(agent_id = %self.agent_id, pid, "SIGTERM failed, proceeding to SIGKILL");
                    }
                }
            }

            let exited = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await;
            if exited.is_err() {
                let _ = child.kill().await;
            }
        }

        self.finish_once().await
    }

    async fn is_running(&self) -> bool {
        match &self.child {
            None => false,
            Some(_) if self.exited.load(Ordering::SeqCst) => false,
            Some(_) => true,
        }
    }

    fn resume_token(&self) -> Option<String> {
        self.resume_token.clone()
    }
}

impl LocalSupervisor {
    /// Wait out the child and mark this supervisor exited. Safe to call
    /// from both `run`'s natural end-of-stream path and an external
    /// `stop()` -- the `compare_exchange` makes the wait-and-report body
    /// run at most once.
    async fn finish_once(&mut self) -> Result<(), SupervisorError> {
        if self
            .exited
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let Some(child) = &mut self.child else {
            return Ok(());
        };

        match child.wait().await {
            Ok(status) => {
                if !status.success() {
                    let code = status.code().unwrap_or(-1);
                    return Err(SupervisorError::NonZeroExit(code));
                }
                Ok(())
            }
            Err(err) => Err(SupervisorError::Spawn(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn task(working_dir: &std::path::Path, skip_permissions: bool) -> MaterializedTask {
        MaterializedTask {
            agent_id: "backend-1".into(),
            role: "backend".into(),
            model_id: "qa-model".into(),
            assignment: "build the thing".into(),
            working_dir: working_dir.to_path_buf(),
            bus_config_path: working_dir.join("bus-config.json"),
            skip_permissions,
            resume_token: None,
            env_vars: HashMap::new(),
        }
    }

    fn make_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn spawn_and_run_streams_events_then_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let script = make_script(
            tmp.path(),
            "fake.sh",
            "#!/bin/sh\n\
             cat >/dev/null\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}'\n\
             echo '{\"type\":\"result\",\"session_id\":\"resume-xyz\"}'\n",
        );

        let mut sup = LocalSupervisor::with_binary("backend-1", script.to_str().unwrap());
        sup.spawn(&task(tmp.path(), false)).await.unwrap();

        let mut seen = Vec::new();
        sup.run(|e| seen.push(e)).await.unwrap();

        assert!(seen
            .iter()
            .any(|e| matches!(e, AgentEvent::Message { content, .. } if content == "hi")));
        assert_eq!(sup.resume_token(), Some("resume-xyz".to_string()));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let script = make_script(tmp.path(), "fail.sh", "#!/bin/sh\ncat >/dev/null\nexit 7\n");

        let mut sup = LocalSupervisor::with_binary("backend-1", script.to_str().unwrap());
        sup.spawn(&task(tmp.path(), false)).await.unwrap();

        let result = sup.run(|_| {}).await;
        assert!(matches!(result, Err(SupervisorError::NonZeroExit(7))));
    }

    #[tokio::test]
    async fn exit_handler_runs_once_across_run_and_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let script = make_script(tmp.path(), "quick.sh", "#!/bin/sh\ncat >/dev/null\nexit 0\n");

        let mut sup = LocalSupervisor::with_binary("backend-1", script.to_str().unwrap());
        sup.spawn(&task(tmp.path(), false)).await.unwrap();

        sup.run(|_| {}).await.unwrap();
        // Calling stop() after natural completion must not error or double-wait.
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn skip_permissions_adds_the_dangerous_flag() {
        // The script records its own argv to a file so the test can see
        // the flag was actually passed, not just that the spawn succeeded.
        let tmp = tempfile::tempdir().unwrap();
        let argv_log = tmp.path().join("argv.log");
        let script = make_script(
            tmp.path(),
            "record_argv.sh",
            &format!("#!/bin/sh\ncat >/dev/null\necho \"$@\" > {}\nexit 0\n", argv_log.display()),
        );

        let mut sup = LocalSupervisor::with_binary("backend-1", script.to_str().unwrap());
        sup.spawn(&task(tmp.path(), true)).await.unwrap();
        sup.run(|_| {}).await.unwrap();

        let argv = std::fs::read_to_string(&argv_log).unwrap();
        assert!(argv.contains("--dangerously-skip-permissions"));
    }

    #[tokio::test]
    async fn spawn_passes_model_flag_and_positional_assignment() {
        let tmp = tempfile::tempdir().unwrap();
        let argv_log = tmp.path().join("argv.log");
        let script = make_script(
            tmp.path(),
            "record_argv.sh",
            &format!("#!/bin/sh\ncat >/dev/null\necho \"$@\" > {}\nexit 0\n", argv_log.display()),
        );

        let mut sup = LocalSupervisor::with_binary("backend-1", script.to_str().unwrap());
        sup.spawn(&task(tmp.path(), false)).await.unwrap();
        sup.run(|_| {}).await.unwrap();

        let argv = std::fs::read_to_string(&argv_log).unwrap();
        assert!(argv.contains("--model qa-model"));
        assert!(argv.trim_end().ends_with("build the thing"));
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_process() {
        let tmp = tempfile::tempdir().unwrap();
        let script = make_script(tmp.path(), "sleepy.sh", "#!/bin/sh\ncat >/dev/null &\nsleep 3600\n");

        let mut sup = LocalSupervisor::with_binary("backend-1", script.to_str().unwrap());
        sup.spawn(&task(tmp.path(), false)).await.unwrap();
        assert!(sup.is_running().await);

        sup.stop().await.unwrap();
        assert!(!sup.is_running().await);
    }
}
