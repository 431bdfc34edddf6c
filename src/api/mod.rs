use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::db::{self, OpportunityFilter};
use crate::models::{ApiResponse, Event, Opportunity, QuotaSnapshot, RunReport, RunStatus, Sport};
use crate::services::{scheduler, OddsClient, SchedulerHandle};
use crate::utils::round_half_even;

pub struct AppState {
    pool: SqlitePool,
    scheduler: SchedulerHandle,
    config: AppConfig,
}

pub async fn serve(port: u16, config: AppConfig) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::init_database(&pool).await?;

    let client = Arc::new(OddsClient::new(&config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (scheduler_handle, scheduler_join) =
        scheduler::spawn(pool.clone(), client, config.clone(), shutdown_rx);

    let state = Arc::new(AppState {
        pool,
        scheduler: scheduler_handle,
        config,
    });

    let app = create_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("arbscout API server listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Server stopped accepting: signal the scheduler and let it drain
    shutdown_tx.send(true).ok();
    if tokio::time::timeout(Duration::from_secs(5), scheduler_join)
        .await
        .is_err()
    {
        tracing::warn!("Refresh scheduler did not stop within 5s of shutdown");
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/arbitrage", get(current_opportunities_handler))
        .route("/api/arbitrage/history", get(historical_opportunities_handler))
        .route("/api/odds", get(latest_odds_handler))
        .route("/api/refresh", post(trigger_refresh_handler))
        .route("/api/status", get(status_handler))
        .route("/api/sports", get(sports_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

// Health check endpoint
async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("arbscout API is running"))
}

// GET /api/arbitrage - Opportunities from the most recent sweep
#[derive(Deserialize)]
struct CurrentOpportunitiesQuery {
    sport: Option<String>,
    min_profit: Option<f64>,
    limit: Option<i64>,
}

async fn current_opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CurrentOpportunitiesQuery>,
) -> Result<Json<ApiResponse<Vec<Opportunity>>>, StatusCode> {
    // "Current" means detected by the latest sweep; without a completed run
    // this window is empty by construction.
    let since = state
        .scheduler
        .last_run()
        .map(|run| run.started_at)
        .unwrap_or_else(|| Utc::now() - chrono::Duration::minutes(15));

    let filter = OpportunityFilter {
        sport: params.sport,
        min_profit_pct: params.min_profit,
        since: Some(since),
        limit: params.limit,
    };

    match db::list_opportunities(&state.pool, &filter).await {
        Ok(ops) => Ok(Json(ApiResponse::success(
            ops.into_iter().map(round_for_display).collect(),
        ))),
        Err(e) => {
            tracing::error!("Failed to list current opportunities: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// GET /api/arbitrage/history - Historical opportunity log
#[derive(Deserialize)]
struct HistoryQuery {
    since: Option<DateTime<Utc>>,
    sport: Option<String>,
    limit: Option<i64>,
}

async fn historical_opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<Opportunity>>>, StatusCode> {
    let filter = OpportunityFilter {
        sport: params.sport,
        min_profit_pct: None,
        since: params.since,
        limit: params.limit,
    };

    match db::list_opportunities(&state.pool, &filter).await {
        Ok(ops) => Ok(Json(ApiResponse::success(
            ops.into_iter().map(round_for_display).collect(),
        ))),
        Err(e) => {
            tracing::error!("Failed to list opportunity history: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// GET /api/odds - Latest odds snapshot
#[derive(Deserialize)]
struct OddsQuery {
    sport: Option<String>,
}

async fn latest_odds_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OddsQuery>,
) -> Result<Json<ApiResponse<Vec<Event>>>, StatusCode> {
    match db::list_latest(&state.pool, params.sport.as_deref()).await {
        Ok(events) => Ok(Json(ApiResponse::success(events))),
        Err(e) => {
            tracing::error!("Failed to list latest odds: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// POST /api/refresh - Run (or join) a refresh cycle
#[derive(Serialize)]
struct RefreshSummary {
    status: RunStatus,
    detected: usize,
    persisted: usize,
    duration_ms: i64,
    errors: Vec<String>,
}

impl RefreshSummary {
    fn from_report(report: &RunReport) -> Self {
        Self {
            status: report.status,
            detected: report.detected,
            persisted: report.persisted,
            duration_ms: report.duration_ms(),
            errors: report.errors.clone(),
        }
    }
}

async fn trigger_refresh_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<RefreshSummary>>) {
    tracing::info!("Manual /api/refresh triggered");
    let report = state.scheduler.trigger().await;
    let summary = RefreshSummary::from_report(&report);

    let (code, body) = match report.status {
        RunStatus::Completed | RunStatus::Partial => {
            (StatusCode::OK, ApiResponse::success(summary))
        }
        RunStatus::Failed => (StatusCode::BAD_GATEWAY, failure_body(summary, &report)),
        RunStatus::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, failure_body(summary, &report)),
    };

    (code, Json(body))
}

/// Failed and cancelled runs keep their summary in the envelope so the
/// dashboard can show what went wrong.
fn failure_body(summary: RefreshSummary, report: &RunReport) -> ApiResponse<RefreshSummary> {
    let message = if report.errors.is_empty() {
        "refresh did not complete".to_string()
    } else {
        report.errors.join("; ")
    };
    let mut body = ApiResponse::error(message);
    body.data = Some(summary);
    body
}

// GET /api/status - Configuration summary, last run, quota
#[derive(Serialize)]
struct ConfiguredSummary {
    odds_format: &'static str,
    markets: Vec<String>,
    regions: Vec<String>,
    sports: Vec<String>,
    min_profit_pct: f64,
    refresh_interval_s: u64,
}

#[derive(Serialize)]
struct StatusPayload {
    configured: ConfiguredSummary,
    last_run: Option<RunReport>,
    quota: Option<QuotaSnapshot>,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StatusPayload>> {
    let payload = StatusPayload {
        configured: ConfiguredSummary {
            odds_format: state.config.odds_format.as_str(),
            markets: state.config.markets.clone(),
            regions: state.config.regions.clone(),
            sports: state.config.sports.clone(),
            min_profit_pct: state.config.min_profit_pct,
            refresh_interval_s: state.config.refresh_interval_s,
        },
        last_run: state.scheduler.last_run().map(|run| (*run).clone()),
        quota: state.scheduler.quota(),
    };
    Json(ApiResponse::success(payload))
}

// GET /api/sports - Catalogue snapshot
async fn sports_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Sport>>>, StatusCode> {
    match db::list_sports(&state.pool).await {
        Ok(sports) => Ok(Json(ApiResponse::success(sports))),
        Err(e) => {
            tracing::error!("Failed to list sports: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Opportunity fields are stored at full precision; trim them for the wire.
/// Probability fields get six decimal places, monetary ones two.
fn round_for_display(mut op: Opportunity) -> Opportunity {
    for leg in &mut op.legs {
        leg.implied_prob = round_half_even(leg.implied_prob, 6);
        leg.stake_share = round_half_even(leg.stake_share, 6);
    }
    op.total_implied_prob = round_half_even(op.total_implied_prob, 6);
    op.profit_pct = round_half_even(op.profit_pct, 2);
    op
}
