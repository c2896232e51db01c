use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::collaborators::http::HttpCollaborators;
use crate::collaborators::Collaborators;
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::workflow::stats::StatsSnapshot;
use crate::workflow::types::WorkflowRecord;
use crate::workflow::WorkflowOrchestrator;

pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: Arc<WorkflowOrchestrator>,
}

impl AppState {
    /// Build state backed by the HTTP collaborator endpoints from config.
    pub fn new(config: AppConfig) -> Result<Self> {
        let collaborators = HttpCollaborators::new(&config.collaborators)?;
        Ok(Self::with_collaborators(
            config,
            Collaborators::from_shared(Arc::new(collaborators)),
        ))
    }

    pub fn with_collaborators(config: AppConfig, collaborators: Collaborators) -> Self {
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            config.orchestrator.clone(),
            collaborators,
        ));
        Self {
            config,
            orchestrator,
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/workflows", get(list_workflows).post(submit_workflow))
        .route("/stats", get(stats))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct SubmitIssue {
    pub issue_number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
}

async fn submit_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitIssue>,
) -> (StatusCode, Json<Value>) {
    let issue_number = request.issue_number;

    match state
        .orchestrator
        .submit(issue_number, request.title, request.body)
    {
        // The workflow logs its own outcome; the handle is not needed here.
        Ok(_handle) => (
            StatusCode::ACCEPTED,
            Json(json!({ "issue_number": issue_number, "state": "pending" })),
        ),
        Err(e) => {
            let status = match e {
                AppError::DuplicateWorkflow(_) => StatusCode::CONFLICT,
                AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(issue = issue_number, error = %e, "Rejected workflow submission");
            (status, Json(json!({ "error": e.to_string() })))
        }
    }
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowRecord>> {
    Json(state.orchestrator.active_workflows())
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.orchestrator.stats())
}

async fn health_check() -> &'static str {
    "ok"
}
