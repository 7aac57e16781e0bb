//! Hosting-provider issue and milestone tools (spec §4.4's "project
//! tracker" surface). Grounded on [`crate::worktree::WorktreeManager::create_pull_request`]:
//! same `gh` CLI, same rule that every result is parsed from `--json`
//! structured output and never from free text, same three-way
//! disabled/unavailable/call-failed error split.
//!
//! This module owns no state of its own -- it is a thin, testable
//! wrapper around subprocess calls, invoked from the bus dispatch layer
//! once a `GithubConfig` section is known to be present.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::GithubConfig;
use crate::error::GithubError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Milestone {
    pub number: u64,
    pub title: String,
    pub state: String,
}

/// Verify the `gh` binary is present and authenticated against the
/// configured repo. Called once at startup (§4.8); non-fatal if the
/// config has no `github:` section at all -- that just disables the
/// tool surface entirely.
pub async fn verify_available(github: &GithubConfig) -> Result<(), GithubError> {
    let output = run(Command::new("gh").args(["auth", "status"]), "gh auth status").await?;
    if !output.status.success() {
        return Err(GithubError::ProviderUnavailable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    tracing::info!(repo = %github.repo, "hosting-provider CLI available");
    Ok(())
}

pub async fn create_issue(
    github: &GithubConfig,
    repo_root: &Path,
    title: &str,
    body: &str,
) -> Result<Issue, GithubError> {
    let mut cmd = Command::new("gh");
    cmd.args(["issue", "create"])
        .args(["--repo", &github.repo])
        .args(["--title", title])
        .args(["--body", body])
        .args(["--json", "number,url,title,state"])
        .current_dir(repo_root);
    if !github.labels.is_empty() {
        cmd.args(["--label", &github.labels.join(",")]);
    }
    let output = run(&mut cmd, "gh issue create").await?;
    decode(&output, "gh issue create")
}

pub async fn list_issues(github: &GithubConfig, repo_root: &Path, state: &str) -> Result<Vec<Issue>, GithubError> {
    let output = run(
        Command::new("gh")
            .args(["issue", "list"])
            .args(["--repo", &github.repo])
            .args(["--state", state])
            .args(["--json", "number,url,title,state"])
            .current_dir(repo_root),
        "gh issue list",
    )
    .await?;
    decode(&output, "gh issue list")
}

pub async fn update_issue(
    github: &GithubConfig,
    repo_root: &Path,
    number: u64,
    title: Option<&str>,
    body: Option<&str>,
) -> Result<Issue, GithubError> {
    let mut cmd = Command::new("gh");
    cmd.args(["issue", "edit", &number.to_string()])
        .args(["--repo", &github.repo])
        .current_dir(repo_root);
    if let Some(title) = title {
        cmd.args(["--title", title]);
    }
    if let Some(body) = body {
        cmd.args(["--body", body]);
    }
    run(&mut cmd, "gh issue edit").await?;

    // `gh issue edit` doesn't emit --json, so re-fetch the canonical record.
    let output = run(
        Command::new("gh")
            .args(["issue", "view", &number.to_string()])
            .args(["--repo", &github.repo])
            .args(["--json", "number,url,title,state"])
            .current_dir(repo_root),
        "gh issue view",
    )
    .await?;
    decode(&output, "gh issue view")
}

pub async fn close_issue(github: &GithubConfig, repo_root: &Path, number: u64) -> Result<(), GithubError> {
    let output = run(
        Command::new("gh")
            .args(["issue", "close", &number.to_string()])
            .args(["--repo", &github.repo])
            .current_dir(repo_root),
        "gh issue close",
    )
    .await?;
    if !output.status.success() {
        return Err(GithubError::ProviderCallFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

pub async fn add_comment(
    github: &GithubConfig,
    repo_root: &Path,
    number: u64,
    body: &str,
) -> Result<(), GithubError> {
    let output = run(
        Command::new("gh")
            .args(["issue", "comment", &number.to_string()])
            .args(["--repo", &github.repo])
            .args(["--body", body])
            .current_dir(repo_root),
        "gh issue comment",
    )
    .await?;
    if !output.status.success() {
        return Err(GithubError::ProviderCallFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

pub async fn create_milestone(
    github: &GithubConfig,
    repo_root: &Path,
    title: &str,
) -> Result<Milestone, GithubError> {
    // `gh` has no native milestone subcommand; shell out to the REST API
    // the same way the teacher's hosting-provider wrapper would for any
    // endpoint `gh`'s porcelain doesn't cover.
    let output = run(
        Command::new("gh")
            .args(["api"])
            .arg(format!("repos/{}/milestones", github.repo))
            .args(["-f", &format!("title={title}")])
            .args(["--jq", "{number: .number, title: .title, state: .state}"])
            .current_dir(repo_root),
        "gh api repos/.../milestones",
    )
    .await?;
    decode(&output, "gh api milestones create")
}

pub async fn list_milestones(github: &GithubConfig, repo_root: &Path) -> Result<Vec<Milestone>, GithubError> {
    let output = run(
        Command::new("gh")
            .args(["api"])
            .arg(format!("repos/{}/milestones", github.repo))
            .args(["--jq", "[.[] | {number: .number, title: .title, state: .state}]"])
            .current_dir(repo_root),
        "gh api repos/.../milestones",
    )
    .await?;
    decode(&output, "gh api milestones list")
}

fn decode<T: serde::de::DeserializeOwned>(output: &std::process::Output, label: &str) -> Result<T, GithubError> {
    if !output.status.success() {
        return Err(GithubError::ProviderCallFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    serde_json::from_slice(&output.stdout)
        .map_err(|e| GithubError::ProviderCallFailed(format!("{label}: malformed JSON output: {e}")))
}

async fn run(cmd: &mut Command, label: &str) -> Result<std::process::Output, GithubError> {
    match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(_)) => Err(GithubError::ProviderUnavailable("gh CLI not found on PATH".to_string())),
        Err(_) => Err(GithubError::ProviderCallFailed(format!("{label} timed out"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_round_trips_through_json() {
        let issue = Issue {
            number: 42,
            url: "https://github.com/acme/demo/issues/42".to_string(),
            title: "fix the thing".to_string(),
            state: "OPEN".to_string(),
        };
        let text = serde_json::to_string(&issue).unwrap();
        let back: Issue = serde_json::from_str(&text).unwrap();
        assert_eq!(issue, back);
    }

    #[test]
    fn decode_surfaces_call_failed_on_nonzero_exit() {
        let output = std::process::Output {
            status: fake_exit_status(1),
            stdout: Vec::new(),
            stderr: b"not found".to_vec(),
        };
        let result: Result<Issue, GithubError> = decode(&output, "gh issue create");
        assert!(matches!(result, Err(GithubError::ProviderCallFailed(_))));
    }

    #[test]
    fn decode_surfaces_call_failed_on_malformed_json() {
        let output = std::process::Output {
            status: fake_exit_status(0),
            stdout: b"not json".to_vec(),
            stderr: Vec::new(),
        };
        let result: Result<Issue, GithubError> = decode(&output, "gh issue create");
        assert!(matches!(result, Err(GithubError::ProviderCallFailed(_))));
    }

    #[cfg(unix)]
    fn fake_exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }
}
