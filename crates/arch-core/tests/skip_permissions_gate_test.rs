//! Integration coverage for the skip-permissions startup gate: a role
//! configured with `permissions.skip_permissions: true` must abort the
//! harness unless the operator explicitly confirms, and the confirmation
//! is durably audited when given.

use arch_core::config::{
    AgentPoolEntry, ConfigFile, LeadConfig, PermissionsConfig, ProjectConfig, SandboxConfig,
    Settings,
};
use arch_core::orchestrator::{flagged_skip_permission_roles, gate_skip_permissions_with_confirmation};

fn config_with_skip_permissions_role() -> ConfigFile {
    ConfigFile {
        project: ProjectConfig {
            name: "demo".into(),
            description: String::new(),
            repo: std::path::PathBuf::from("."),
        },
        archie: LeadConfig {
            persona: std::path::PathBuf::from("personas/lead.md"),
            model: "claude-opus".into(),
        },
        agent_pool: vec![AgentPoolEntry {
            id: "frontend".into(),
            persona: std::path::PathBuf::from("personas/frontend.md"),
            model: "claude-sonnet".into(),
            max_instances: 1,
            sandbox: SandboxConfig::default(),
            permissions: PermissionsConfig {
                skip_permissions: true,
                allowed_tools: Vec::new(),
            },
        }],
        github: None,
        settings: Settings::default(),
    }
}

#[tokio::test]
async fn aborts_startup_when_operator_withholds_assent() {
    let state_dir = tempfile::tempdir().unwrap();
    let config = config_with_skip_permissions_role();

    let flagged = flagged_skip_permission_roles(&config);
    assert_eq!(flagged, vec!["frontend".to_string()]);

    let result = gate_skip_permissions_with_confirmation(flagged, false, state_dir.path()).await;
    assert!(result.is_err(), "startup gate must abort when assent is withheld");

    assert!(
        !state_dir.path().join("permissions_audit.log").exists(),
        "a rejected gate must not write an approval audit line"
    );
}

#[tokio::test]
async fn proceeds_and_audits_when_operator_confirms() {
    let state_dir = tempfile::tempdir().unwrap();
    let config = config_with_skip_permissions_role();
    let flagged = flagged_skip_permission_roles(&config);

    let approved = gate_skip_permissions_with_confirmation(flagged, true, state_dir.path())
        .await
        .expect("confirmed gate must proceed");
    assert!(approved.contains("frontend"));

    let audit = std::fs::read_to_string(state_dir.path().join("permissions_audit.log")).unwrap();
    assert!(audit.contains("event=skip_permissions_approved"));
    assert!(audit.contains("frontend"));
}

#[tokio::test]
async fn no_gate_at_all_when_no_role_requests_skip_permissions() {
    let state_dir = tempfile::tempdir().unwrap();
    let mut config = config_with_skip_permissions_role();
    config.agent_pool[0].permissions.skip_permissions = false;

    let flagged = flagged_skip_permission_roles(&config);
    assert!(flagged.is_empty());

    // Even an explicit `confirmed: false` must not abort when nothing
    // was flagged in the first place -- there is nothing to gate on.
    let approved = gate_skip_permissions_with_confirmation(flagged, false, state_dir.path())
        .await
        .unwrap();
    assert!(approved.is_empty());
    assert!(!state_dir.path().join("permissions_audit.log").exists());
}
