//! Admin HTTP surface: alert review and on-demand chain verification.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::database::models::Alert;
use crate::database::Database;
use crate::error::MonitorError;
use crate::ledger::{ChainReport, Ledger};

#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub ledger: Ledger,
}

impl AppState {
    pub fn new(database: Database, ledger: Ledger) -> Self {
        Self { database, ledger }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/alerts", get(list_alerts))
        .route("/alerts/unacknowledged/count", get(unacknowledged_count))
        .route("/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/elections/:id/verify", get(verify_election))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

pub struct ApiError(MonitorError);

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                error!("Request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "vote-guard",
        "timestamp": chrono::Utc::now()
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertFilter {
    #[serde(default)]
    pub unacknowledged: bool,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(filter): Query<AlertFilter>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    Ok(Json(state.database.list_alerts(filter.unacknowledged).await?))
}

async fn unacknowledged_count(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let count = state.database.unacknowledged_alert_count().await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
) -> Result<Json<Alert>, ApiError> {
    state.database.acknowledge_alert(alert_id).await?;
    let alert = state
        .database
        .get_alert(alert_id)
        .await?
        .ok_or_else(|| MonitorError::alert_not_found(alert_id))?;
    Ok(Json(alert))
}

async fn verify_election(
    State(state): State<AppState>,
    Path(election_id): Path<i64>,
) -> Result<Json<ChainReport>, ApiError> {
    Ok(Json(state.ledger.verify_election(election_id).await?))
}
