use axum::extract::{Path, Query, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chartmerge_core::config::HttpSettings;
use chartmerge_core::resource::collection_bundle;
use chartmerge_core::{MergeSession, Resource};
use merge_engine::{ErrorCategory, MergeEngine, MergeError, MergeOutcome, ResolveOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Clone)]
struct AppState {
    engine: Arc<MergeEngine>,
}

#[derive(Debug, Default, Deserialize)]
struct MergeParams {
    source1: Option<String>,
    source2: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictSet {
    session_id: String,
    conflicts: Resource,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    version: String,
    anchor_type: String,
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<MergeError>() {
            Some(err) => status_for(err),
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_client_error() {
            tracing::warn!(status = status.as_u16(), "Request rejected: {}", self.0);
        } else {
            tracing::error!(status = status.as_u16(), "Request failed: {:#}", self.0);
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Response status for an engine error. A referenced artifact that has
/// vanished is a server-side fault, not a bad gateway.
fn status_for(err: &MergeError) -> StatusCode {
    if matches!(err, MergeError::MissingArtifact(_)) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    match err.category() {
        ErrorCategory::Input | ErrorCategory::State => StatusCode::BAD_REQUEST,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::External => StatusCode::BAD_GATEWAY,
    }
}

/// HTTP API over the merge engine.
pub struct HttpServer {
    engine: Arc<MergeEngine>,
    settings: HttpSettings,
}

impl HttpServer {
    pub fn new(engine: Arc<MergeEngine>, settings: HttpSettings) -> Self {
        Self { engine, settings }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
        };

        Router::new()
            .route("/merge", post(start_merge).get(list_sessions))
            .route("/merge/{id}", get(get_session))
            .route("/merge/{id}/resolve/{conflict_id}", post(resolve_conflict))
            .route("/merge/{id}/complete", post(complete_session))
            .route("/merge/{id}/abort", post(abort_session))
            .route("/merge/{id}/conflicts", get(open_conflicts))
            .route("/merge/{id}/conflicts/{conflict_id}", delete(delete_conflict))
            .route("/merge/{id}/resolved", get(resolved_conflicts))
            .route("/merge/{id}/target", get(get_target))
            .route("/status", get(status_handler))
            .layer(cors_layer(&self.settings.cors_origins))
            .with_state(state)
    }

    pub async fn start(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let app = self.router();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.port));
        tracing::info!("HTTP API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        Ok(())
    }
}

/// Any origin when none are configured, otherwise exactly the listed ones.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn start_merge(
    State(state): State<AppState>,
    Query(params): Query<MergeParams>,
) -> Result<Response, AppError> {
    let (Some(source1), Some(source2)) = (params.source1, params.source2) else {
        return Err(MergeError::InvalidInput("source1 and source2 are required".into()).into());
    };

    match state.engine.merge(&source1, &source2).await? {
        MergeOutcome::Merged(bundle) => Ok(Json(bundle).into_response()),
        MergeOutcome::Conflicts { session, conflicts } => {
            let location = format!("/merge/{}", session.session_id);
            let body = ConflictSet {
                session_id: session.session_id,
                conflicts: collection_bundle(conflicts.iter().map(|c| c.to_resource())),
            };
            Ok((StatusCode::CREATED, [(LOCATION, location)], Json(body)).into_response())
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<MergeSession>>, AppError> {
    Ok(Json(state.engine.sessions().await?))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MergeSession>, AppError> {
    Ok(Json(state.engine.session(&id).await?))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path((id, conflict_id)): Path<(String, String)>,
    Json(replacement): Json<Value>,
) -> Result<Json<Resource>, AppError> {
    let bundle = match state.engine.resolve(&id, &conflict_id, replacement).await? {
        ResolveOutcome::Open(reports) => reports,
        ResolveOutcome::Completed(target) => target,
    };
    Ok(Json(bundle))
}

async fn complete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, AppError> {
    Ok(Json(state.engine.complete(&id).await?))
}

async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.abort(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_conflict(
    State(state): State<AppState>,
    Path((id, conflict_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_conflict(&id, &conflict_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn open_conflicts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, AppError> {
    Ok(Json(state.engine.open_conflicts(&id).await?))
}

async fn resolved_conflicts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, AppError> {
    Ok(Json(state.engine.resolved_conflicts(&id).await?))
}

async fn get_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, AppError> {
    Ok(Json(state.engine.target(&id).await?))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        anchor_type: state.engine.anchor_type().to_string(),
    })
}
