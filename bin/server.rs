// Influencer Campaign Metrics - Web Server
// REST API for applying batches and reading reconciled metrics

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use influencer_metrics::report::summarize;
use influencer_metrics::{
    bootstrap, get_metrics_for_date, Connector, Error, MergeError, MetricsRecord, RawBatch,
    RawRow, Reconciler, ReconcilerConfig, RowRejection, SqliteConnector, Totals, WarehouseConfig,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shared application state
#[derive(Clone)]
struct AppState {
    reconciler: Arc<Reconciler>,
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<()>::err(message))).into_response()
}

/// POST body: rows plus an optional backfill date
#[derive(Deserialize)]
struct ApplyRequest {
    rows: Vec<RawRow>,
    #[serde(default)]
    interval_date: Option<NaiveDate>,
}

#[derive(Serialize)]
struct ApplyResponse {
    run_id: String,
    interval_date: NaiveDate,
    rows_inserted: usize,
    rows_updated: usize,
    rejected: Vec<RowRejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    totals: Option<Totals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    totals_error: Option<String>,
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Merge(MergeError::PublishDateConflict { .. }) => StatusCode::CONFLICT,
        Error::Merge(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_day(raw: &str) -> Result<NaiveDate, Response> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        failure(
            StatusCode::BAD_REQUEST,
            format!("'{}' is not a YYYY-MM-DD date", raw),
        )
    })
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/batches - Apply a batch
async fn apply_batch(State(state): State<AppState>, Json(request): Json<ApplyRequest>) -> Response {
    let batch = RawBatch::from_rows(request.rows);
    let reconciler = state.reconciler.clone();

    // rusqlite blocks; keep it off the async workers
    let joined = tokio::task::spawn_blocking(move || match request.interval_date {
        Some(date) => reconciler.apply_batch_on(&batch, date),
        None => reconciler.apply_batch(&batch),
    })
    .await;

    match joined {
        Ok(Ok(outcome)) => {
            let (totals, totals_error) = match outcome.totals() {
                Ok(totals) => (Some(*totals), None),
                Err(err) => (None, Some(err.to_string())),
            };
            let response = ApplyResponse {
                run_id: outcome.run_id.to_string(),
                interval_date: outcome.interval_date,
                rows_inserted: outcome.summary.rows_inserted,
                rows_updated: outcome.summary.rows_updated,
                rejected: outcome.rejected,
                totals,
                totals_error,
            };
            (StatusCode::OK, Json(ApiResponse::ok(response))).into_response()
        }
        Ok(Err(err)) => failure(status_for(&err), err.to_string()),
        Err(join_err) => {
            tracing::error!(error = %join_err, "apply task panicked");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "apply task failed")
        }
    }
}

/// GET /api/totals/:date - Totals for one interval date
async fn get_totals(State(state): State<AppState>, Path(date): Path<String>) -> Response {
    let interval_date = match parse_day(&date) {
        Ok(day) => day,
        Err(response) => return response,
    };
    let settings = state.reconciler.config();
    let Ok(conn) = state.db.lock() else {
        return failure(StatusCode::INTERNAL_SERVER_ERROR, "database lock poisoned");
    };

    match summarize(
        &conn,
        settings.table(),
        interval_date,
        settings.recent_window,
        chrono::Utc::now(),
    ) {
        Ok(totals) => (StatusCode::OK, Json(ApiResponse::ok(totals))).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "totals query failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/metrics/:date - Stored rows for one interval date
async fn get_metrics(State(state): State<AppState>, Path(date): Path<String>) -> Response {
    let interval_date = match parse_day(&date) {
        Ok(day) => day,
        Err(response) => return response,
    };
    let Ok(conn) = state.db.lock() else {
        return failure(StatusCode::INTERNAL_SERVER_ERROR, "database lock poisoned");
    };

    match get_metrics_for_date(&conn, state.reconciler.config().table(), interval_date) {
        Ok(records) => {
            (StatusCode::OK, Json(ApiResponse::<Vec<MetricsRecord>>::ok(records))).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "metrics query failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let warehouse = WarehouseConfig::from_env()?;
    let settings = ReconcilerConfig::from_env()?;

    let connector = Arc::new(SqliteConnector::from_config(&warehouse, &settings));
    let conn = connector.connect()?;
    bootstrap(&conn, settings.table())?;
    tracing::info!(database = %connector.describe(), table = settings.table(), "database opened");

    // Create shared state
    let state = AppState {
        reconciler: Arc::new(Reconciler::new(connector, settings)),
        db: Arc::new(Mutex::new(conn)),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/batches", post(apply_batch))
        .route("/totals/:date", get(get_totals))
        .route("/metrics/:date", get(get_metrics))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    // Start server
    let addr = std::env::var("METRICS_SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server running");

    axum::serve(listener, app).await?;
    Ok(())
}
