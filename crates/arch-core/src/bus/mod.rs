//! Bus Server: the MCP-style tool surface every agent's AI CLI talks to
//! over `--mcp-config`, built as a thin axum router over [`dispatch`].
//!
//! Grounded on the teacher's `serve_cmd::build_router` -- same
//! `Router::new().route(...).layer(CorsLayer::permissive()).with_state(...)`
//! shape, same `AppError`/`IntoResponse` pattern for turning a typed error
//! into a JSON body, same `with_graceful_shutdown` entry point, same
//! `tower::ServiceExt::oneshot`-against-the-router test style. The
//! teacher's router is keyed by resource id in the path
//! (`/api/plans/{id}`); this one is keyed by calling agent id, since
//! authority here depends on *which agent* is asking, not *which
//! resource* is addressed.

pub mod dispatch;

use std::net::SocketAddr;
use std::sync::Arc;

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use tower_http::cors::CorsLayer;

use crate::error::BusError;
pub use dispatch::{BusCallbacks, BusState, DecisionWaiters};

impl IntoResponse for BusError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            BusError::UnknownRole(_)
            | BusError::UnknownAgent(_)
            | BusError::UnknownDecision(_) => StatusCode::NOT_FOUND,
            BusError::Unauthorized { .. }
            | BusError::CannotTeardownLead
            | BusError::PermissionNotPreApproved(_) => StatusCode::FORBIDDEN,
            BusError::CapExceeded { .. }
            | BusError::GlobalCapExceeded { .. }
            | BusError::InvalidStatus(_) => StatusCode::CONFLICT,
            BusError::ProviderDisabled
            | BusError::ProviderUnavailable(_)
            | BusError::ProviderCallFailed(_) => StatusCode::BAD_GATEWAY,
            BusError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Wire every bus tool onto its own route, path-scoped by the calling
/// agent's id so the handler always knows who is asking without trusting
/// a client-supplied field in the body. Tool calls live under the same
/// `/sse/{agent_id}` prefix the agent's MCP config points its event
/// stream at (spec's "Bus wire protocol": one path pattern, event-stream
/// body for server push, JSON request/response for everything else).
pub fn build_router(state: BusState) -> Router {
    Router::new()
        .route("/sse/{agent_id}", get(h_sse_stream))
        .route("/sse/{agent_id}/send_message", post(h_send_message))
        .route("/sse/{agent_id}/get_messages", post(h_get_messages))
        .route("/sse/{agent_id}/update_status", post(h_update_status))
        .route("/sse/{agent_id}/report_completion", post(h_report_completion))
        .route("/sse/{agent_id}/save_progress", post(h_save_progress))
        .route("/sse/{agent_id}/spawn_agent", post(h_spawn_agent))
        .route("/sse/{agent_id}/teardown_agent", post(h_teardown_agent))
        .route("/sse/{agent_id}/list_agents", post(h_list_agents))
        .route("/sse/{agent_id}/escalate_to_user", post(h_escalate_to_user))
        .route("/sse/{agent_id}/request_merge", post(h_request_merge))
        .route("/sse/{agent_id}/get_project_context", post(h_get_project_context))
        .route("/sse/{agent_id}/update_brief", post(h_update_brief))
        .route("/sse/{agent_id}/close_project", post(h_close_project))
        .route("/sse/{agent_id}/create_task", post(h_create_task))
        .route("/sse/{agent_id}/create_issue", post(h_create_issue))
        .route("/sse/{agent_id}/list_issues", post(h_list_issues))
        .route("/sse/{agent_id}/update_issue", post(h_update_issue))
        .route("/sse/{agent_id}/close_issue", post(h_close_issue))
        .route("/sse/{agent_id}/add_comment", post(h_add_comment))
        .route("/sse/{agent_id}/create_milestone", post(h_create_milestone))
        .route("/sse/{agent_id}/list_milestones", post(h_list_milestones))
        .route("/decisions/{decision_id}/answer", post(h_answer_decision))
        .route("/decisions", get(h_list_pending_decisions))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// The event-stream half of the bus wire protocol. An agent's MCP client
/// opens this once at startup; it exists to give the transport a genuine
/// `text/event-stream` body as the bus-config's `"type":"sse"` promises.
/// The first event announces where tool calls go (this process keeps
/// tool dispatch as plain request/response JSON under the same prefix,
/// rather than multiplexing call and result frames over the stream --
/// simpler to reason about and to test, and MCP's sse transport only
/// requires that the client learn the call endpoint from this event).
/// A comment frame every 15s keeps idle proxies from closing the
/// connection; the stream ends when the client disconnects.
async fn h_sse_stream(
    State(_state): BusAppState,
    Path(agent_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/sse/{agent_id}"));
    let stream = stream::once(async move { Ok(endpoint) });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

pub async fn run_bus_server(state: BusState, bind: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("bus server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("bus server shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers -- each just extracts path/body and calls into dispatch.
// ---------------------------------------------------------------------------

type BusAppState = State<Arc<BusState>>;

async fn h_send_message(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::SendMessageRequest>,
) -> Result<impl IntoResponse, BusError> {
    let msg = dispatch::send_message(&state, &agent_id, req).await?;
    Ok(Json(msg))
}

async fn h_get_messages(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::GetMessagesRequest>,
) -> Result<impl IntoResponse, BusError> {
    let resp = dispatch::get_messages(&state, &agent_id, req).await?;
    Ok(Json(resp))
}

async fn h_update_status(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::UpdateStatusRequest>,
) -> Result<impl IntoResponse, BusError> {
    dispatch::update_status(&state, &agent_id, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn h_report_completion(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::ReportCompletionRequest>,
) -> Result<impl IntoResponse, BusError> {
    dispatch::report_completion(&state, &agent_id, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn h_save_progress(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::SaveProgressRequest>,
) -> Result<impl IntoResponse, BusError> {
    dispatch::save_progress(&state, &agent_id, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn h_spawn_agent(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::SpawnAgentRequest>,
) -> Result<impl IntoResponse, BusError> {
    let resp = dispatch::spawn_agent(&state, &agent_id, req).await?;
    Ok(Json(resp))
}

async fn h_teardown_agent(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::TeardownAgentRequest>,
) -> Result<impl IntoResponse, BusError> {
    dispatch::teardown_agent(&state, &agent_id, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn h_list_agents(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, BusError> {
    let agents = dispatch::list_agents(&state, &agent_id).await?;
    Ok(Json(agents))
}

async fn h_escalate_to_user(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::EscalateToUserRequest>,
) -> Result<impl IntoResponse, BusError> {
    let answer = dispatch::escalate_to_user(&state, &agent_id, req).await?;
    Ok(Json(serde_json::json!({ "answer": answer })))
}

async fn h_request_merge(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::RequestMergeRequest>,
) -> Result<impl IntoResponse, BusError> {
    let resp = dispatch::request_merge(&state, &agent_id, req).await?;
    Ok(Json(resp))
}

async fn h_get_project_context(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, BusError> {
    let ctx = dispatch::get_project_context(&state, &agent_id).await?;
    Ok(Json(ctx))
}

async fn h_update_brief(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::UpdateBriefRequest>,
) -> Result<impl IntoResponse, BusError> {
    dispatch::update_brief(&state, &agent_id, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn h_close_project(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, BusError> {
    dispatch::close_project(&state, &agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn h_create_task(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::CreateTaskRequest>,
) -> Result<impl IntoResponse, BusError> {
    let task = dispatch::create_task(&state, &agent_id, req).await?;
    Ok(Json(task))
}

async fn h_answer_decision(
    State(state): BusAppState,
    Path(decision_id): Path<u64>,
    Json(req): Json<dispatch::AnswerDecisionRequest>,
) -> Result<impl IntoResponse, BusError> {
    let resp = dispatch::answer_decision(&state, decision_id, req).await?;
    Ok(Json(resp))
}

async fn h_create_issue(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::CreateIssueRequest>,
) -> Result<impl IntoResponse, BusError> {
    let issue = dispatch::create_issue(&state, &agent_id, req).await?;
    Ok(Json(issue))
}

async fn h_list_issues(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::ListIssuesRequest>,
) -> Result<impl IntoResponse, BusError> {
    let issues = dispatch::list_issues(&state, &agent_id, req).await?;
    Ok(Json(issues))
}

async fn h_update_issue(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::UpdateIssueRequest>,
) -> Result<impl IntoResponse, BusError> {
    let issue = dispatch::update_issue(&state, &agent_id, req).await?;
    Ok(Json(issue))
}

async fn h_close_issue(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::CloseIssueRequest>,
) -> Result<impl IntoResponse, BusError> {
    dispatch::close_issue(&state, &agent_id, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn h_add_comment(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::AddCommentRequest>,
) -> Result<impl IntoResponse, BusError> {
    dispatch::add_comment(&state, &agent_id, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn h_create_milestone(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
    Json(req): Json<dispatch::CreateMilestoneRequest>,
) -> Result<impl IntoResponse, BusError> {
    let milestone = dispatch::create_milestone(&state, &agent_id, req).await?;
    Ok(Json(milestone))
}

async fn h_list_milestones(
    State(state): BusAppState,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, BusError> {
    let milestones = dispatch::list_milestones(&state, &agent_id).await?;
    Ok(Json(milestones))
}

/// Dashboard-facing read: every decision still unanswered. Not scoped to
/// an agent id -- the dashboard polls this directly, it doesn't call
/// bus tools.
async fn h_list_pending_decisions(State(state): BusAppState) -> impl IntoResponse {
    Json(dispatch::list_pending_decisions(&state).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentPoolEntry, ConfigFile, LeadConfig, PermissionsConfig, ProjectConfig, SandboxConfig, Settings};
    use crate::model::LEAD_AGENT_ID;
    use crate::state::StateStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct NoopCallbacks;

    #[async_trait]
    impl BusCallbacks for NoopCallbacks {
        async fn spawn_agent(
            &self,
            _role: &str,
            _assignment: &str,
            _context: Option<&str>,
            skip_permissions: bool,
        ) -> Result<dispatch::SpawnedAgent, BusError> {
            Ok(dispatch::SpawnedAgent {
                agent_id: "backend-1".to_string(),
                worktree_path: "/tmp/backend-1".to_string(),
                sandboxed: false,
                skip_permissions,
                status: "spawning".to_string(),
            })
        }
        async fn teardown_agent(&self, _agent_id: &str) -> Result<(), BusError> {
            Ok(())
        }
        async fn request_merge(
            &self,
            _agent_id: &str,
            _target: &str,
            _pr_title: Option<&str>,
            _pr_body: Option<&str>,
        ) -> Result<dispatch::MergeOutcome, BusError> {
            Ok(dispatch::MergeOutcome::Merged)
        }
        async fn close_project(&self) -> Result<(), BusError> {
            Ok(())
        }
        async fn create_issue(&self, title: &str, _body: &str) -> Result<crate::github::Issue, BusError> {
            Ok(crate::github::Issue { number: 1, url: "https://example/1".into(), title: title.to_string(), state: "OPEN".into() })
        }
        async fn list_issues(&self, _state: &str) -> Result<Vec<crate::github::Issue>, BusError> {
            Ok(Vec::new())
        }
        async fn update_issue(&self, number: u64, title: Option<&str>, _body: Option<&str>) -> Result<crate::github::Issue, BusError> {
            Ok(crate::github::Issue { number, url: "https://example/1".into(), title: title.unwrap_or("untitled").to_string(), state: "OPEN".into() })
        }
        async fn close_issue(&self, _number: u64) -> Result<(), BusError> {
            Ok(())
        }
        async fn add_comment(&self, _number: u64, _body: &str) -> Result<(), BusError> {
            Ok(())
        }
        async fn create_milestone(&self, title: &str) -> Result<crate::github::Milestone, BusError> {
            Ok(crate::github::Milestone { number: 1, title: title.to_string(), state: "open".into() })
        }
        async fn list_milestones(&self) -> Result<Vec<crate::github::Milestone>, BusError> {
            Ok(Vec::new())
        }
        async fn git_status(&self) -> Result<String, BusError> {
            Ok("clean".to_string())
        }
    }

    fn test_state() -> (BusState, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let config = ConfigFile {
            project: ProjectConfig {
                name: "demo".into(),
                description: String::new(),
                repo: ".".into(),
            },
            archie: LeadConfig {
                persona: "lead.md".into(),
                model: "qa-model".into(),
            },
            agent_pool: vec![AgentPoolEntry {
                id: "backend".into(),
                persona: "backend.md".into(),
                model: "qa-model".into(),
                max_instances: 1,
                sandbox: SandboxConfig::default(),
                permissions: PermissionsConfig::default(),
            }],
            github: None,
            settings: Settings::default(),
        };
        (
            BusState {
                store: Arc::new(store),
                config: Arc::new(config),
                callbacks: Arc::new(NoopCallbacks),
                waiters: DecisionWaiters::default(),
                brief_path: tmp.path().join("BRIEF.md"),
            },
            tmp,
        )
    }

    #[tokio::test]
    async fn send_then_get_messages_over_http() {
        let (state, _tmp) = test_state();
        let app = build_router(state);

        let send_req = Request::builder()
            .method("POST")
            .uri(format!("/sse/{LEAD_AGENT_ID}/send_message"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"to": "backend-1", "body": "go"}).to_string(),
            ))
            .unwrap();
        let resp = app.clone().oneshot(send_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let get_req = Request::builder()
            .method("POST")
            .uri("/sse/backend-1/get_messages")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"cursor": 0}).to_string()))
            .unwrap();
        let resp = app.oneshot(get_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["messages"][0]["body"], "go");
    }

    #[tokio::test]
    async fn pending_decisions_endpoint_lists_unanswered_only() {
        let (state, _tmp) = test_state();
        state.store.queue_decision("proceed?".into(), None).await.unwrap();
        let app = build_router(state);

        let req = Request::builder().method("GET").uri("/decisions").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["question"], "proceed?");
    }

    #[tokio::test]
    async fn unauthorized_tool_call_maps_to_forbidden() {
        let (state, _tmp) = test_state();
        let app = build_router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/sse/backend-1/list_agents")
            .header("content-type", "application/json")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn sse_stream_announces_endpoint() {
        let (state, _tmp) = test_state();
        let app = build_router(state);

        let req = Request::builder()
            .method("GET")
            .uri("/sse/backend-1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: endpoint"));
        assert!(text.contains("/sse/backend-1"));
    }
}
