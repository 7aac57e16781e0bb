//! Container Driver: runs the AI CLI inside a Docker container instead of
//! a host subprocess.
//!
//! Unlike the teacher's `ContainerIsolation` (which deliberately avoids
//! bind-mounting the host repository and shuttles files in and out via
//! `docker cp`/tar), this driver mounts the agent's worktree directly --
//! the worktree itself is the isolation boundary here, not the
//! container. What carries over from the teacher is the shape: build a
//! `docker` argv, `create`+`start` (here collapsed into one `run -d`),
//! stream output, `rm` on teardown, and don't fail teardown just because
//! the container is already gone.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{NetworkMode, SandboxConfig};
use crate::error::SupervisorError;
use crate::harness::trait_def::Supervisor;
use crate::harness::types::{AgentEvent, MaterializedTask};
use crate::token::parse_event_line;

/// Fixed in-container path the worktree is mounted at.
pub const CONTAINER_WORKSPACE_PATH: &str = "/workspace";
/// Fixed in-container path the per-agent bus-config file is mounted at,
/// read-only.
pub const CONTAINER_BUS_CONFIG_PATH: &str = "/etc/arch/bus-config.json";

/// Tracks container names that have been started but not yet cleanly
/// removed, so an orchestrator-level panic or SIGKILL still leaves a
/// record of what to `docker rm -f` on the next startup.
#[derive(Clone, Default)]
pub struct EmergencyCleanupRegistry {
    names: Arc<Mutex<HashSet<String>>>,
}

impl EmergencyCleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, name: &str) {
        self.names.lock().await.insert(name.to_string());
    }

    async fn unregister(&self, name: &str) {
        self.names.lock().await.remove(name);
    }

    /// Names still registered; for an emergency-cleanup sweep at startup.
    pub async fn outstanding(&self) -> Vec<String> {
        self.names.lock().await.iter().cloned().collect()
    }
}

fn container_name(agent_id: &str) -> String {
    let sanitized: String = agent_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("arch-agent-{sanitized}")
}

/// The host-reachable gateway name to bake into the container so agents
/// can call back out to the Bus Server running on the host. Linux's
/// Docker needs an explicit `--add-host`; Docker Desktop on macOS/Windows
/// already provides `host.docker.internal` without one.
#[cfg(target_os = "linux")]
fn host_gateway_add_host() -> Option<(&'static str, &'static str)> {
    Some(("host.docker.internal", "host-gateway"))
}

#[cfg(not(target_os = "linux"))]
fn host_gateway_add_host() -> Option<(&'static str, &'static str)> {
    None
}

/// An AI CLI session running inside a Docker container.
pub struct ContainerSupervisor {
    agent_id: String,
    name: String,
    docker_binary: String,
    cli_binary: String,
    logs_child: Option<Child>,
    sandbox: SandboxConfig,
    model_id: String,
    resume_token: Option<String>,
    exited: Arc<AtomicBool>,
    cleanup: EmergencyCleanupRegistry,
}

impl ContainerSupervisor {
    pub fn new(agent_id: impl Into<String>, sandbox: SandboxConfig, cleanup: EmergencyCleanupRegistry) -> Self {
        Self::with_binaries(agent_id, "docker", "claude", sandbox, cleanup)
    }

    pub fn with_binaries(
        agent_id: impl Into<String>,
        docker_binary: impl Into<String>,
        cli_binary: impl Into<String>,
        sandbox: SandboxConfig,
        cleanup: EmergencyCleanupRegistry,
    ) -> Self {
        let agent_id = agent_id.into();
        let name = container_name(&agent_id);
        Self {
            agent_id,
            name,
            docker_binary: docker_binary.into(),
            cli_binary: cli_binary.into(),
            logs_child: None,
            sandbox,
            model_id: String::new(),
            resume_token: None,
            exited: Arc::new(AtomicBool::new(false)),
            cleanup,
        }
    }

    fn docker(&self) -> Command {
        Command::new(&self.docker_binary)
    }

    fn build_run_args(
        &self,
        sandbox: &SandboxConfig,
        worktree_path: &Path,
        bus_config_path: &Path,
        task: &MaterializedTask,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "-w".to_string(),
            CONTAINER_WORKSPACE_PATH.to_string(),
            "-v".to_string(),
            format!("{}:{}", worktree_path.display(), CONTAINER_WORKSPACE_PATH),
            "-v".to_string(),
            format!(
                "{}:{}:ro",
                bus_config_path.display(),
                CONTAINER_BUS_CONFIG_PATH
            ),
        ];

        match sandbox.network {
            NetworkMode::Bridge => {}
            NetworkMode::None => args.push("--network=none".to_string()),
            NetworkMode::Host => args.push("--network=host".to_string()),
        }

        if let Some((host, gateway)) = host_gateway_add_host() {
            args.push("--add-host".to_string());
            args.push(format!("{host}:{gateway}"));
        }

        if let Some(mem) = &sandbox.memory_limit {
            args.push(format!("--memory={mem}"));
        }
        if let Some(cpus) = sandbox.cpus {
            args.push(format!("--cpus={cpus}"));
        }
        for mount in &sandbox.extra_mounts {
            args.push("-v".to_string());
            args.push(format!("{mount}:ro"));
        }

        for (key, value) in &task.env_vars {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        let image = sandbox
            .image
            .clone()
            .unwrap_or_else(|| "arch-agent:latest".to_string());
        args.push(image);

        args.push(self.cli_binary.clone());
        args.push("-p".to_string());
        args.push("--model".to_string());
        args.push(task.model_id.clone());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        args.push("--verbose".to_string());
        args.push("--mcp-config".to_string());
        args.push(CONTAINER_BUS_CONFIG_PATH.to_string());
        if let Some(token) = &task.resume_token {
            args.push("--resume".to_string());
            args.push(token.clone());
        }
        if task.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push(task.assignment.clone());

        args
    }
}

#[async_trait]
impl Supervisor for ContainerSupervisor {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn spawn(&mut self, task: &MaterializedTask) -> Result<(), SupervisorError> {
        let sandbox = self.sandbox.clone();
        let args = self.build_run_args(&sandbox, &task.working_dir, &task.bus_config_path, task);

        let output = self
            .docker()
            .args(&args)
            .output()
            .await
            .map_err(|e| SupervisorError::ContainerRuntimeUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(SupervisorError::ContainerFailed(stderr));
        }

        self.cleanup.register(&self.name).await;
        self.model_id = task.model_id.clone();

        let logs_child = self
            .docker()
            .args(["logs", "-f", &self.name])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        self.logs_child = Some(logs_child);
        Ok(())
    }

    async fn run<F>(&mut self, mut on_event: F) -> Result<(), SupervisorError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let Some(child) = &mut self.logs_child else {
            return Ok(());
        };
        let Some(stdout) = child.stdout.take() else {
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
                        tracing::warn!(agent_id = %self.agent_id, error = %err, "skipping malformed container log line");
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(agent_id = %self.agent_id, error = %err, "error reading container logs");
                    break;
                }
            }
        }

        self.finish_once().await
    }

    async fn stop(&mut self) -> Result<(), SupervisorError> {
        let output = self
            .docker()
            .args(["stop", &self.name])
            .output()
            .await
            .map_err(|e| SupervisorError::ContainerRuntimeUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                tracing::warn!(name = %self.name, stderr = %stderr, "docker stop reported an error");
            }
        }

        if let Some(child) = &mut self.logs_child {
            let _ = child.kill().await;
        }

        self.cleanup.unregister(&self.name).await;
        self.finish_once().await
    }

    async fn is_running(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return false;
        }
        let output = self
            .docker()
            .args(["inspect", "-f", "{{.State.Running}}", &self.name])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                String::from_utf8_lossy(&out.stdout).trim() == "true"
            }
            _ => false,
        }
    }

    fn resume_token(&self) -> Option<String> {
        self.resume_token.clone()
    }
}

impl ContainerSupervisor {
    async fn finish_once(&mut self) -> Result<(), SupervisorError> {
        if self
            .exited
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.cleanup.unregister(&self.name).await;
        if let Some(child) = &mut self.logs_child {
            let _ = child.wait().await;
        }
        Ok(())
    }
}
