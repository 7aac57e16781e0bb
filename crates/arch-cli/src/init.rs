//! `arch init`: scaffold a new project's config, pricing table, and
//! persona templates in the current directory. Grounded on the teacher's
//! `cmd_init` -- write everything up front with sane defaults, never
//! overwrite a file that already exists, and set restrictive permissions
//! on anything that looks like a secret.

use std::path::Path;

use anyhow::Context;

const DEFAULT_PRICING: &str = r#"# Per-million-token USD rates, keyed by model id.
# The "default" row is used for any model id not listed here.
default:
  price_in: 3.0
  price_out: 15.0
  price_cache_read: 0.3
  price_cache_write: 3.75
"#;

const LEAD_PERSONA: &str = r#"# Lead persona

You are the lead agent for this project. You decompose work into tasks,
spawn specialist agents for each one, route messages between them, and
escalate ambiguous decisions to the human operator rather than guessing.
You never run with permissions skipped and never run inside a container.
"#;

const BACKEND_PERSONA: &str = r#"# Backend persona

You are a backend specialist. You implement the task assigned to you in
your own isolated worktree, reporting progress and completion back to
the lead over the bus. You do not touch files outside your assignment
without checking with the lead first.
"#;

fn config_template(name: &str, github: Option<&str>) -> String {
    let github_block = match github {
        Some(repo) => format!(
            "github:\n  repo: {repo}\n  default_branch: main\n  labels: []\n"
        ),
        None => "github: null\n".to_string(),
    };
    format!(
        r#"project:
  name: {name}
  description: ""
  repo: .

archie:
  persona: personas/lead.md
  model: claude-opus-4

agent_pool:
  - id: backend
    persona: personas/backend.md
    model: claude-sonnet-4
    max_instances: 2
    sandbox:
      enabled: false
    permissions:
      skip_permissions: false
      allowed_tools: []

{github_block}
settings:
  max_concurrent_agents: 5
  state_dir: ./state
  mcp_port: 3999
  token_budget_usd: null
  auto_merge: false
  require_user_approval: []
"#
    )
}

/// Write `path` with `contents` unless it already exists, in which case
/// leave it alone and say so -- `init` must be safe to re-run in a
/// partially scaffolded directory.
fn write_new(path: &Path, contents: &str) -> anyhow::Result<()> {
    if path.exists() {
        println!("skipping {} (already exists)", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

pub fn cmd_init(name: &str, github: Option<&str>) -> anyhow::Result<()> {
    init_in(Path::new("."), name, github)
}

/// The testable half of `init`: everything rooted at `dir` instead of the
/// process's current directory, so tests can point it at a `tempfile`
/// directory without touching global process state.
fn init_in(dir: &Path, name: &str, github: Option<&str>) -> anyhow::Result<()> {
    let config_path = dir.join("arch.yaml");
    write_new(&config_path, &config_template(name, github))?;
    if config_path.exists() {
        restrict_permissions(&config_path)?;
    }

    write_new(&dir.join("pricing.yaml"), DEFAULT_PRICING)?;
    write_new(&dir.join("personas/lead.md"), LEAD_PERSONA)?;
    write_new(&dir.join("personas/backend.md"), BACKEND_PERSONA)?;

    println!();
    println!("next steps:");
    println!("  1. edit arch.yaml and personas/*.md for your project");
    println!("  2. run `arch up` from inside a git repository");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_all_four_files() {
        let tmp = tempfile::tempdir().unwrap();
        init_in(tmp.path(), "demo", None).unwrap();
        assert!(tmp.path().join("arch.yaml").exists());
        assert!(tmp.path().join("pricing.yaml").exists());
        assert!(tmp.path().join("personas/lead.md").exists());
        assert!(tmp.path().join("personas/backend.md").exists());

        let config = std::fs::read_to_string(tmp.path().join("arch.yaml")).unwrap();
        let parsed: arch_core::config::ConfigFile = serde_yaml::from_str(&config).unwrap();
        assert_eq!(parsed.project.name, "demo");
        assert!(parsed.github.is_none());
    }

    #[test]
    fn does_not_overwrite_existing_config() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("arch.yaml"), "custom: true\n").unwrap();
        // init_in would fail to parse "custom: true" as ConfigFile, but it
        // never tries -- an existing file is left untouched.
        let _ = init_in(tmp.path(), "demo", Some("acme/demo"));
        let config = std::fs::read_to_string(tmp.path().join("arch.yaml")).unwrap();
        assert_eq!(config, "custom: true\n");
    }

    #[test]
    fn github_flag_populates_github_block() {
        let tmp = tempfile::tempdir().unwrap();
        init_in(tmp.path(), "demo", Some("acme/demo")).unwrap();
        let config = std::fs::read_to_string(tmp.path().join("arch.yaml")).unwrap();
        let parsed: arch_core::config::ConfigFile = serde_yaml::from_str(&config).unwrap();
        assert_eq!(parsed.github.unwrap().repo, "acme/demo");
    }
}
