// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The façade only ever creates workflow records in `queued`; the worker
// loops own every later transition. Requests that fail validation (weights
// not summing to 100, real mode without money) are rejected here and never
// reach the store.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ingester::IngesterClient;
use crate::store::Store;
use crate::types::{RunConfig, TradeMode};

/// Allowed drift of a weight sum away from 100.
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub ingester: Arc<IngesterClient>,
}

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/exchanges", get(exchanges))
        .route("/api/v1/granularities", get(granularities))
        .route("/api/v1/strategy/runs", post(create_run))
        .route("/api/v1/strategy/runs", get(list_runs))
        .route("/api/v1/strategy/runs/:id/results", get(run_results))
        .route("/api/v1/strategy/runs/:id/best", get(best_results))
        .route("/api/v1/strategy/executions", post(create_execution))
        .route("/api/v1/strategy/executions/:id", get(execution_status))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn internal_error(err: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    error!(error = %err, "api request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Discovery (proxied to the ingester)
// =============================================================================

async fn exchanges(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.ingester.get_exchanges().await {
        Ok(exchanges) => Json(serde_json::json!({ "exchanges": exchanges })).into_response(),
        Err(err) => {
            error!(error = %err, "exchange discovery failed");
            error_response(StatusCode::BAD_GATEWAY, "ingester unavailable").into_response()
        }
    }
}

async fn granularities(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.ingester.get_granularities().await {
        Ok(granularities) => {
            Json(serde_json::json!({ "granularities": granularities })).into_response()
        }
        Err(err) => {
            error!(error = %err, "granularity discovery failed");
            error_response(StatusCode::BAD_GATEWAY, "ingester unavailable").into_response()
        }
    }
}

// =============================================================================
// Strategy runs
// =============================================================================

#[derive(Serialize)]
struct CreateRunResponse {
    run_id: String,
}

async fn create_run(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<RunConfig>,
) -> impl IntoResponse {
    if config.continuous_days.is_empty() || config.horizontal_gaps.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "continuous_days and horizontal_gaps must be non-empty",
        )
        .into_response();
    }
    if !(0.0..=1.0).contains(&config.threshold_prob) {
        return error_response(StatusCode::BAD_REQUEST, "threshold_prob must be in [0, 1]")
            .into_response();
    }

    let run_id = Uuid::new_v4().to_string();
    let config_json = match serde_json::to_string(&config) {
        Ok(json) => json,
        Err(err) => return internal_error(err.into()).into_response(),
    };

    match state
        .store
        .create_run(&run_id, &config_json, Local::now().naive_local())
        .await
    {
        Ok(()) => {
            info!(run_id = %run_id, "strategy run created");
            (StatusCode::CREATED, Json(CreateRunResponse { run_id })).into_response()
        }
        Err(err) => internal_error(err).into_response(),
    }
}

#[derive(Deserialize)]
struct Pagination {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Serialize)]
struct RunSummary {
    id: String,
    status: String,
    created_at: String,
}

async fn list_runs(
    State(state): State<Arc<ApiState>>,
    Query(page): Query<Pagination>,
) -> impl IntoResponse {
    match state.store.list_runs(page.limit, page.offset).await {
        Ok(runs) => {
            let runs: Vec<RunSummary> = runs
                .into_iter()
                .map(|run| RunSummary {
                    id: run.id,
                    status: run.status.to_string(),
                    created_at: run.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();
            Json(serde_json::json!({ "runs": runs })).into_response()
        }
        Err(err) => internal_error(err).into_response(),
    }
}

#[derive(Serialize)]
struct ResultRow {
    id: i64,
    stock: String,
    exchange: String,
    x: String,
    y: String,
    exceed_prob: f64,
    profit_days: i64,
    average: f64,
    total_count: i64,
    highest: f64,
    p5: f64,
    p10: f64,
    p20: f64,
    p40: f64,
    p50: f64,
    vertical_gap: f64,
    horizontal_gap: i64,
    continuous_days: i64,
}

impl From<crate::store::runs::StrategyResult> for ResultRow {
    fn from(r: crate::store::runs::StrategyResult) -> Self {
        Self {
            id: r.id,
            stock: r.stock,
            exchange: r.exchange,
            x: r.x,
            y: r.y,
            exceed_prob: r.exceed_prob,
            profit_days: r.profit_days,
            average: r.average,
            total_count: r.total_count,
            highest: r.highest,
            p5: r.p5,
            p10: r.p10,
            p20: r.p20,
            p40: r.p40,
            p50: r.p50,
            vertical_gap: r.vertical_gap,
            horizontal_gap: r.horizontal_gap,
            continuous_days: r.continuous_days,
        }
    }
}

async fn run_results(
    State(state): State<Arc<ApiState>>,
    Path(run_id): Path<String>,
    Query(page): Query<Pagination>,
) -> impl IntoResponse {
    match state.store.run_results(&run_id, page.limit, page.offset).await {
        Ok(results) => {
            let results: Vec<ResultRow> = results.into_iter().map(Into::into).collect();
            Json(serde_json::json!({ "results": results })).into_response()
        }
        Err(err) => internal_error(err).into_response(),
    }
}

async fn best_results(
    State(state): State<Arc<ApiState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match state.store.best_results_per_stock(&run_id).await {
        Ok(results) => {
            let results: Vec<ResultRow> = results.into_iter().map(Into::into).collect();
            Json(serde_json::json!({ "results": results })).into_response()
        }
        Err(err) => internal_error(err).into_response(),
    }
}

// =============================================================================
// Strategy executions
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SelectedConfig {
    pub result_id: i64,
    pub weight_percent: f64,
}

#[derive(Debug, Deserialize)]
pub struct CreateExecutionRequest {
    pub run_id: String,
    #[serde(default)]
    pub mode: TradeMode,
    #[serde(default)]
    pub total_money: Option<f64>,
    pub selected_configs: Vec<SelectedConfig>,
}

/// Reject weight sets that do not allocate exactly 100% (within tolerance).
pub fn validate_weights(weights: &[f64]) -> Result<(), String> {
    if weights.is_empty() {
        return Err("selected_configs must be non-empty".to_string());
    }
    for &weight in weights {
        if !(weight > 0.0 && weight <= 100.0) {
            return Err(format!("weight_percent {weight} outside (0, 100]"));
        }
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(format!("weight_percent values sum to {sum}, expected 100"));
    }
    Ok(())
}

#[derive(Serialize)]
struct CreateExecutionResponse {
    execution_id: i64,
}

async fn create_execution(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateExecutionRequest>,
) -> impl IntoResponse {
    let weights: Vec<f64> = request
        .selected_configs
        .iter()
        .map(|s| s.weight_percent)
        .collect();
    if let Err(message) = validate_weights(&weights) {
        warn!(run_id = %request.run_id, %message, "execution request rejected");
        return error_response(StatusCode::BAD_REQUEST, message).into_response();
    }
    if request.mode == TradeMode::Real && request.total_money.unwrap_or(0.0) <= 0.0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "real mode requires total_money > 0",
        )
        .into_response();
    }

    // Every selected result must exist before the execution is accepted.
    for selection in &request.selected_configs {
        match state.store.get_result(selection.result_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("unknown strategy result {}", selection.result_id),
                )
                .into_response()
            }
            Err(err) => return internal_error(err).into_response(),
        }
    }

    let selections: Vec<(i64, f64)> = request
        .selected_configs
        .iter()
        .map(|s| (s.result_id, s.weight_percent))
        .collect();
    match state
        .store
        .create_execution(
            &request.run_id,
            request.mode,
            request.total_money,
            &selections,
            Local::now().naive_local(),
        )
        .await
    {
        Ok(execution_id) => {
            info!(execution_id, mode = %request.mode, "strategy execution created");
            (
                StatusCode::CREATED,
                Json(CreateExecutionResponse { execution_id }),
            )
                .into_response()
        }
        Err(err) => internal_error(err).into_response(),
    }
}

async fn execution_status(
    State(state): State<Arc<ApiState>>,
    Path(execution_id): Path<i64>,
) -> impl IntoResponse {
    let execution = match state.store.get_execution(execution_id).await {
        Ok(Some(execution)) => execution,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "execution not found").into_response()
        }
        Err(err) => return internal_error(err).into_response(),
    };
    let details = match state.store.execution_details(execution_id).await {
        Ok(details) => details,
        Err(err) => return internal_error(err).into_response(),
    };

    let details: Vec<serde_json::Value> = details
        .iter()
        .map(|detail| {
            serde_json::json!({
                "id": detail.id,
                "result_id": detail.result_id,
                "weight_percent": detail.weight_percent,
                "status": detail.status.to_string(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "id": execution.id,
        "run_id": execution.run_id,
        "mode": execution.mode.to_string(),
        "total_money": execution.total_money,
        "status": execution.status.to_string(),
        "details": details,
    }))
    .into_response()
}
