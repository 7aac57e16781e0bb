//! Worktree Manager (spec §4.2): one isolated git worktree per agent,
//! plus the `CLAUDE.md` context file written into it, plus the merge /
//! pull-request path that integrates an agent's finished branch back.
//!
//! Grounded on the teacher's `worktree::WorktreeManager`: same
//! `git_lock`-style serialization of mutating git operations, same
//! idempotent create/remove, same porcelain-output parser shape. Two
//! things are new here, because the teacher has no counterpart: a
//! wall-clock bound on every external command (the teacher's git calls
//! are local and fast enough not to need one; ours must not hang the
//! reactor), and the hosting-provider CLI wrapper for pull requests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::GithubConfig;
use crate::error::WorktreeError;
use crate::model::ProjectContext;

/// Wall-clock bound on any single external command (git or the hosting
/// CLI). A timeout maps to [`WorktreeError::Timeout`], never a hang.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    Conflict { details: String },
}

/// Where an agent's worktree lives and what branch it sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// Manages per-agent git worktrees under `{repo}/.worktrees/`.
///
/// Owns that directory exclusively: no other component mutates paths
/// under it. Mutating git calls are serialized behind `git_lock` so
/// concurrent lifecycle actions don't race on git's own lock file.
pub struct WorktreeManager {
    repo_root: PathBuf,
    git_lock: Mutex<()>,
}

impl WorktreeManager {
    /// Verify `repo_root` is a usable git repository and return a manager
    /// for it. Fatal at startup if this fails (spec §7, `GitUnavailable`).
    pub async fn open(repo_root: &Path) -> Result<Self, WorktreeError> {
        let output = run(
            Command::new("git").args(["rev-parse", "--git-dir"]).current_dir(repo_root),
            "git rev-parse --git-dir",
        )
        .await?;
        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_root.display().to_string()));
        }
        Ok(WorktreeManager {
            repo_root: repo_root.to_path_buf(),
            git_lock: Mutex::new(()),
        })
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.repo_root.join(".worktrees")
    }

    pub fn branch_name(agent_id: &str) -> String {
        format!("agent/{agent_id}")
    }

    fn worktree_path(&self, agent_id: &str) -> PathBuf {
        self.worktrees_root().join(agent_id)
    }

    /// Create `{repo}/.worktrees/{agent_id}` on branch `agent/{agent_id}`.
    /// Idempotent: an existing worktree on the expected branch is
    /// returned as-is rather than recreated.
    pub async fn create(&self, agent_id: &str) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().await;
        let branch = Self::branch_name(agent_id);
        let path = self.worktree_path(agent_id);

        if path.exists() {
            return Ok(WorktreeInfo { path, branch });
        }

        tokio::fs::create_dir_all(self.worktrees_root())
            .await
            .map_err(WorktreeError::GitCommand)?;

        let branch_exists = run(
            Command::new("git")
                .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
                .current_dir(&self.repo_root),
            "git rev-parse --verify",
        )
        .await?
        .status
        .success();

        let output = if branch_exists {
            run(
                Command::new("git")
                    .args(["worktree", "add"])
                    .arg(&path)
                    .arg(&branch)
                    .current_dir(&self.repo_root),
                "git worktree add",
            )
            .await?
        } else {
            run(
                Command::new("git")
                    .args(["worktree", "add", "-b", &branch])
                    .arg(&path)
                    .current_dir(&self.repo_root),
                "git worktree add -b",
            )
            .await?
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(&path).await;
            return Err(exit_error("worktree add", &output));
        }

        Ok(WorktreeInfo { path, branch })
    }

    /// Remove an agent's worktree. `force=true` matches the spec's
    /// teardown path (`git worktree remove --force`); failure here is
    /// fatal to that agent's teardown, per §4.2 -- the caller decides
    /// whether to retry. Deleting the now-orphaned branch is logged on
    /// failure but never fails the call.
    pub async fn remove(&self, agent_id: &str, force: bool) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().await;
        let path = self.worktree_path(agent_id);
        if !path.exists() {
            return Ok(());
        }

        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        let mut cmd = Command::new("git");
        cmd.args(&args).arg(&path).current_dir(&self.repo_root);
        let output = run(&mut cmd, "git worktree remove").await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(exit_error("worktree remove", &output));
        }

        let branch = Self::branch_name(agent_id);
        let del = run(
            Command::new("git").args(["branch", "-D", &branch]).current_dir(&self.repo_root),
            "git branch -D",
        )
        .await;
        match del {
            Ok(o) if !o.status.success() => {
                tracing::warn!(agent_id, branch, "failed to delete feature branch after worktree removal");
            }
            Err(e) => tracing::warn!(agent_id, branch, error = %e, "failed to run git branch -D"),
            _ => {}
        }

        Ok(())
    }

    /// Merge an agent's branch into `target`, always `--no-ff` so the
    /// merge commit preserves branch attribution.
    pub async fn merge(&self, agent_id: &str, target: &str) -> Result<MergeResult, WorktreeError> {
        let _lock = self.git_lock.lock().await;
        let branch = Self::branch_name(agent_id);

        let checkout = run(
            Command::new("git").args(["checkout", target]).current_dir(&self.repo_root),
            "git checkout",
        )
        .await?;
        if !checkout.status.success() {
            return Err(exit_error("checkout", &checkout));
        }

        let output = run(
            Command::new("git").args(["merge", "--no-ff", &branch]).current_dir(&self.repo_root),
            "git merge",
        )
        .await?;

        if output.status.success() {
            return Ok(MergeResult::Success);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stderr.contains("CONFLICT") || stdout.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = run(
                Command::new("git").args(["merge", "--abort"]).current_dir(&self.repo_root),
                "git merge --abort",
            )
            .await;
            return Ok(MergeResult::Conflict {
                details: format!("{stdout}\n{stderr}").trim().to_string(),
            });
        }

        Err(exit_error("merge", &output))
    }

    /// Create a pull request via the hosting-provider CLI (`gh`). The PR
    /// identifier is parsed from `gh`'s structured JSON output, never
    /// from free text, per §4.2.
    pub async fn create_pull_request(
        &self,
        agent_id: &str,
        target: &str,
        title: &str,
        body: &str,
        github: Option<&GithubConfig>,
    ) -> Result<String, WorktreeError> {
        let Some(github) = github else {
            return Err(WorktreeError::ProviderDisabled);
        };
        let branch = Self::branch_name(agent_id);

        let push = run(
            Command::new("git").args(["push", "-u", "origin", &branch]).current_dir(&self.repo_root),
            "git push",
        )
        .await?;
        if !push.status.success() {
            return Err(exit_error("push", &push));
        }

        let output = run(
            Command::new("gh")
                .args(["pr", "create"])
                .args(["--repo", &github.repo])
                .args(["--base", target])
                .args(["--head", &branch])
                .args(["--title", title])
                .args(["--body", body])
                .args(["--json", "number,url"])
                .current_dir(&self.repo_root),
            "gh pr create",
        )
        .await
        .map_err(|_| WorktreeError::ProviderUnavailable("gh CLI not found on PATH".to_string()))?;

        if !output.status.success() {
            return Err(WorktreeError::ProviderCallFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| WorktreeError::ParseError(format!("gh pr create output: {e}")))?;
        parsed
            .get("url")
            .and_then(serde_json::Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| WorktreeError::ParseError("gh pr create output missing \"url\"".to_string()))
    }

    /// Write `CLAUDE.md` into an agent's worktree: the harness-injected
    /// context header followed by the persona file contents verbatim.
    pub async fn write_claude_md(
        &self,
        agent_id: &str,
        project: &ProjectContext,
        bus_tools: &[&str],
        roster: &[String],
        assignment: &str,
        session_state: Option<&str>,
        persona_contents: &str,
    ) -> Result<(), WorktreeError> {
        let path = self.worktree_path(agent_id);
        let mut header = String::new();
        header.push_str(&format!("# Agent context: {agent_id}\n\n"));
        header.push_str(&format!("Project: {} -- {}\n", project.name, project.description));
        header.push_str(&format!("Worktree: {}\n", path.display()));
        header.push_str(&format!("Bus tools: {}\n", bus_tools.join(", ")));
        header.push_str(&format!(
            "Other live agents: {}\n",
            if roster.is_empty() { "none".to_string() } else { roster.join(", ") }
        ));
        header.push_str(&format!("\n## Assignment\n\n{assignment}\n"));
        if let Some(state) = session_state {
            header.push_str(&format!("\n## Session State\n\n{state}\n"));
        }
        header.push_str("\n---\n\n");
        header.push_str(persona_contents);

        tokio::fs::write(path.join("CLAUDE.md"), header)
            .await
            .map_err(WorktreeError::GitCommand)
    }
}

fn exit_error(command: &str, output: &std::process::Output) -> WorktreeError {
    WorktreeError::GitExit {
        command: command.to_string(),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

/// Run an external command with the wall-clock bound, mapping a timeout
/// to its own error kind so a hung git/gh call can never hang the
/// reactor.
async fn run(cmd: &mut Command, label: &str) -> Result<std::process::Output, WorktreeError> {
    match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(WorktreeError::GitCommand(e)),
        Err(_) => Err(WorktreeError::Timeout {
            command: label.to_string(),
            elapsed_secs: COMMAND_TIMEOUT.as_secs(),
        }),
    }
}
