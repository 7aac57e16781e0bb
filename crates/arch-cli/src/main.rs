//! `arch`: the CLI front end over `arch-core`'s orchestrator entry points.
//!
//! Mirrors the teacher's `Cli { .. command: Commands }` shape, reduced to
//! the five entry points the harness is actually driven through: `up`,
//! `down`, `status`, `resume`, `init`. Everything else -- persona prompt
//! content, dashboard rendering -- lives outside this binary entirely.

mod init;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use arch_core::config::{resolve_config_path, resolve_state_dir, ConfigFile};
use arch_core::model::LEAD_AGENT_ID;
use arch_core::orchestrator::{Orchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "arch", about = "Coordination harness for a team of AI coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the harness: bootstrap the lead agent and run the
    /// supervision loop in the foreground until shutdown.
    Up {
        /// Path to the harness config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Leave agent worktrees in place after shutdown instead of
        /// removing them.
        #[arg(long)]
        keep_worktrees: bool,
    },
    /// Signal a running `arch up` process to shut down gracefully.
    Down {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a snapshot of the last known run: agents, status, cost.
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Resume a previous run from its persisted state (agents keep their
    /// resume tokens; the lead picks up where it left off).
    Resume {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        keep_worktrees: bool,
    },
    /// Scaffold a new project: config file, pricing table, persona
    /// templates.
    Init {
        /// Project name, used in the generated config and as the repo's
        /// default working title.
        #[arg(long, default_value = "my-project")]
        name: String,
        /// `owner/repo` slug if this project uses a hosting provider.
        #[arg(long)]
        github: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Up { config, keep_worktrees } => cmd_up(config, keep_worktrees).await,
        Commands::Down { config } => cmd_down(config).await,
        Commands::Status { config } => cmd_status(config).await,
        Commands::Resume { config, keep_worktrees } => cmd_resume(config, keep_worktrees).await,
        Commands::Init { name, github } => init::cmd_init(&name, github.as_deref()),
    }
}

async fn cmd_up(config: Option<PathBuf>, keep_worktrees: bool) -> anyhow::Result<()> {
    let config_path = resolve_config_path(config.as_deref());
    run_harness(config_path, keep_worktrees).await
}

async fn cmd_resume(config: Option<PathBuf>, keep_worktrees: bool) -> anyhow::Result<()> {
    let config_path = resolve_config_path(config.as_deref());
    let loaded = ConfigFile::load(&config_path).context("loading harness config")?;
    let state_dir = resolve_state_dir(&loaded);
    if !state_dir.join("agents.json").exists() && !state_dir.exists() {
        anyhow::bail!(
            "no prior run found in {} -- use `arch up` to start a new one",
            state_dir.display()
        );
    }
    run_harness(config_path, keep_worktrees).await
}

/// The shared body of `up` and `resume`: bootstrap always loads whatever
/// prior state the state store finds on disk (spec §4.8's "loading any
/// prior run"), so the two commands differ only in the up-front check
/// above, not in how they start the orchestrator.
async fn run_harness(config_path: PathBuf, keep_worktrees: bool) -> anyhow::Result<()> {
    let (orchestrator, exits_rx) = Orchestrator::bootstrap(OrchestratorConfig {
        config_path: config_path.clone(),
        keep_worktrees,
    })
    .await
    .context("starting harness")?;

    let state_dir = resolve_state_dir(&orchestrator.config);
    let pid_path = state_dir.join("arch.pid");
    tokio::fs::write(&pid_path, std::process::id().to_string())
        .await
        .context("writing pid file")?;

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl-C, starting graceful shutdown");
                orchestrator.request_shutdown();
            }
        });
    }

    orchestrator.run(exits_rx).await;

    let _ = tokio::fs::remove_file(&pid_path).await;
    Ok(())
}

async fn cmd_down(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config_path = resolve_config_path(config.as_deref());
    let loaded = ConfigFile::load(&config_path).context("loading harness config")?;
    let state_dir = resolve_state_dir(&loaded);
    let pid_path = state_dir.join("arch.pid");

    let pid_text = tokio::fs::read_to_string(&pid_path)
        .await
        .with_context(|| format!("no running harness found ({} missing)", pid_path.display()))?;
    let pid: i32 = pid_text
        .trim()
        .parse()
        .with_context(|| format!("malformed pid file {}", pid_path.display()))?;

    send_sigterm(pid)?;
    println!("sent shutdown signal to pid {pid}");
    Ok(())
}

#[cfg(unix)]
fn send_sigterm(pid: i32) -> anyhow::Result<()> {
    // SAFETY: pid is read from our own pid file; kill(2) with SIGTERM is
    // the standard graceful-stop signal.
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        anyhow::bail!("kill({pid}, SIGTERM) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_sigterm(_pid: i32) -> anyhow::Result<()> {
    anyhow::bail!("`arch down` requires a Unix-like OS")
}

async fn cmd_status(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config_path = resolve_config_path(config.as_deref());
    let loaded = ConfigFile::load(&config_path).context("loading harness config")?;
    let state_dir = resolve_state_dir(&loaded);

    let store = arch_core::state::StateStore::open(&state_dir).context("opening state store")?;
    let snapshot = store.snapshot().await;

    let Some(project) = &snapshot.project else {
        println!("no project recorded in {}", state_dir.display());
        return Ok(());
    };

    println!("project: {} ({})", project.name, project.repo_root.display());
    println!("started: {}", project.started_at.to_rfc3339());
    println!();

    if snapshot.agents.is_empty() {
        println!("no agents");
    } else {
        println!("{:<16} {:<12} {:<10} {:>10} {:>8}", "agent", "role", "status", "cost ($)", "turns");
        let mut ids: Vec<&String> = snapshot.agents.keys().collect();
        ids.sort();
        for id in ids {
            let agent = &snapshot.agents[id];
            let marker = if id.as_str() == LEAD_AGENT_ID { "*" } else { "" };
            println!(
                "{:<16} {:<12} {:<10} {:>10.4} {:>8}",
                format!("{id}{marker}"),
                agent.role,
                format!("{:?}", agent.status),
                agent.usage.cost_usd,
                agent.usage.turn_count,
            );
        }
    }

    let pending: Vec<_> = snapshot.decisions.values().filter(|d| d.answer.is_none()).collect();
    if !pending.is_empty() {
        println!();
        println!("pending decisions:");
        for decision in pending {
            println!("  #{}: {}", decision.id, decision.question);
        }
    }

    Ok(())
}
