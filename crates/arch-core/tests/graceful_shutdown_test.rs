//! Integration coverage for graceful shutdown (spec §8 Scenario "SIGINT
//! during an active run"): every live session is asked to stop, the
//! supervision loop waits them out within a grace period, worktrees are
//! removed absent `--keep-worktrees`, and the run exits cleanly.
//!
//! Drives a real `Orchestrator::bootstrap` against a real temporary git
//! repository, the way `worktree::tests::temp_repo` builds one for its
//! own module tests, with a fake `claude` shell script standing in for
//! the AI CLI on `PATH`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use arch_core::config::{ConfigFile, LeadConfig, ProjectConfig, Settings};
use arch_core::model::LEAD_AGENT_ID;
use arch_core::orchestrator::{Orchestrator, OrchestratorConfig};

fn temp_git_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let run = |args: &[&str]| {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(out.status.success(), "git {} failed: {}", args.join(" "), String::from_utf8_lossy(&out.stderr));
    };
    run(&["init"]);
    run(&["config", "user.email", "test@arch.dev"]);
    run(&["config", "user.name", "Arch Test"]);
    std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "initial"]);
    dir
}

/// A `claude` stand-in that emits one `result` event, then idles until
/// asked to stop -- long enough to exercise a live, in-progress session.
fn install_fake_claude_cli(dir: &Path) {
    let path = dir.join("claude");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         echo '{\"type\":\"result\",\"session_id\":\"resume-lead\"}'\n\
         cat >/dev/null &\n\
         sleep 3600\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn prepend_to_path(dir: &Path) {
    let existing = std::env::var("PATH").unwrap_or_default();
    let new_path = format!("{}:{}", dir.display(), existing);
    // SAFETY: this test binary is single-threaded at the point this runs
    // (called before any session is spawned), so there is no concurrent
    // reader of the environment.
    unsafe { std::env::set_var("PATH", new_path) };
}

fn write_config(config_path: &Path, repo: &Path, state_dir: &Path, mcp_port: u16) {
    let config = ConfigFile {
        project: ProjectConfig {
            name: "demo".into(),
            description: "a demo project".into(),
            repo: repo.to_path_buf(),
        },
        archie: LeadConfig {
            persona: PathBuf::from("personas/does-not-exist.md"),
            model: "qa-model".into(),
        },
        agent_pool: Vec::new(),
        github: None,
        settings: Settings {
            max_concurrent_agents: 5,
            state_dir: state_dir.to_path_buf(),
            mcp_port,
            token_budget_usd: None,
            auto_merge: false,
            require_user_approval: Vec::new(),
        },
    };
    std::fs::write(config_path, serde_yaml::to_string(&config).unwrap()).unwrap();
}

#[tokio::test]
async fn sigint_drains_the_live_session_and_removes_worktrees() {
    let repo_dir = temp_git_repo();
    let bin_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();

    install_fake_claude_cli(bin_dir.path());
    prepend_to_path(bin_dir.path());

    let config_path = repo_dir.path().join("arch.yaml");
    write_config(&config_path, repo_dir.path(), state_dir.path(), 18_793);

    let (orchestrator, exits_rx) = Orchestrator::bootstrap(OrchestratorConfig {
        config_path,
        keep_worktrees: false,
    })
    .await
    .expect("bootstrap should start the lead session against the fake CLI");

    let lead_worktree = repo_dir.path().join(".worktrees").join(LEAD_AGENT_ID);
    assert!(lead_worktree.exists(), "lead worktree must exist once bootstrap has spawned it");

    let run_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(exits_rx).await })
    };

    // Give the lead session a moment to be actually running before asking
    // it to stop, the way a real operator's Ctrl-C would land mid-run.
    tokio::time::sleep(Duration::from_millis(200)).await;
    orchestrator.request_shutdown();

    tokio::time::timeout(Duration::from_secs(15), run_handle)
        .await
        .expect("graceful shutdown must complete within its grace period")
        .expect("supervision loop task must not panic");

    assert!(
        !lead_worktree.exists(),
        "worktrees must be removed on shutdown when --keep-worktrees was not set"
    );

    let snapshot = orchestrator.store.snapshot().await;
    let lead = &snapshot.agents[LEAD_AGENT_ID];
    assert!(lead.status.is_terminal(), "lead agent must reach a terminal status after shutdown");
}
