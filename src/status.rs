//! Read-only HTTP view of the ledger and queues.

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::dispatch::{EventTask, Trigger};
use crate::error::ConvoyError;
use crate::ledger::{EventResult, Ledger, NodeTaskResult, TaskResult};
use crate::queue::SharedQueue;

#[derive(Clone)]
pub struct StatusState {
    pub ledger: Ledger,
    pub progress: SharedQueue<EventTask>,
    pub events: SharedQueue<Trigger>,
}

impl StatusState {
    pub fn new(
        ledger: Ledger,
        progress: SharedQueue<EventTask>,
        events: SharedQueue<Trigger>,
    ) -> Self {
        Self {
            ledger,
            progress,
            events,
        }
    }
}

#[derive(Serialize)]
struct NodeResponse {
    #[serde(flatten)]
    result: NodeTaskResult,
    log: String,
}

#[derive(Serialize)]
struct TaskResponse {
    #[serde(flatten)]
    result: TaskResult,
    nodes: Vec<NodeResponse>,
}

#[derive(Serialize)]
struct EventResponse {
    #[serde(flatten)]
    result: EventResult,
    tasks: Vec<TaskResponse>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(StatusCode, String);

impl From<ConvoyError> for ApiError {
    fn from(e: ConvoyError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/results", get(list_results_handler))
        .route("/api/results/:id", get(result_handler))
        .route("/api/queue", get(queue_handler))
        .route("/api/events", get(events_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the status API until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, state: StatusState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn list_results_handler(
    State(state): State<StatusState>,
) -> Result<Json<Vec<EventResult>>, ApiError> {
    Ok(Json(state.ledger.events().await?))
}

async fn result_handler(
    State(state): State<StatusState>,
    Path(id): Path<String>,
) -> Result<Json<EventResponse>, ApiError> {
    let Some(event) = state.ledger.event(&id).await? else {
        return Err(ApiError(StatusCode::NOT_FOUND, format!("Event {id} not found")));
    };

    let mut tasks = Vec::new();
    for task in state.ledger.tasks(&id).await? {
        let nodes = state
            .ledger
            .node_results(&id, task.no)
            .await?
            .into_iter()
            .map(|result| NodeResponse {
                log: result.log.clone(),
                result,
            })
            .collect();
        tasks.push(TaskResponse { result: task, nodes });
    }

    Ok(Json(EventResponse {
        result: event,
        tasks,
    }))
}

async fn queue_handler(State(state): State<StatusState>) -> Result<Json<Vec<EventTask>>, ApiError> {
    Ok(Json(state.progress.items().await?))
}

async fn events_handler(State(state): State<StatusState>) -> Result<Json<Vec<Trigger>>, ApiError> {
    Ok(Json(state.events.items().await?))
}
