// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reads are served from the session's
// published snapshot; trade placement and balance reset are forwarded to the
// session task through its queue and answered once it has processed them.
//
// CORS is configured permissively for development.
// =============================================================================

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::SessionError;
use crate::session::{OpenTradeCommand, SessionHandle};
use crate::settlement::LedgerStats;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(session: SessionHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/candles", get(candles))
        .route("/api/v1/ledger", get(ledger))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/trades", post(open_trade))
        .route("/api/v1/balance/reset", post(reset_balance))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(session)
}

// =============================================================================
// Error mapping
// =============================================================================

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::TradeAlreadyActive { .. } => StatusCode::CONFLICT,
            Self::InvalidTick(_)
            | Self::InvalidTrade(_)
            | Self::InvalidBalance(_)
            | Self::UnsupportedContractType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NoMarketData | Self::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(session): State<SessionHandle>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: session.version(),
        uptime_secs: session.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Snapshot reads
// =============================================================================

async fn full_state(State(session): State<SessionHandle>) -> impl IntoResponse {
    Json(session.snapshot())
}

async fn candles(State(session): State<SessionHandle>) -> impl IntoResponse {
    Json(session.snapshot().candles)
}

/// Newest first, like the history table.
async fn ledger(State(session): State<SessionHandle>) -> impl IntoResponse {
    let mut entries = session.snapshot().ledger;
    entries.reverse();
    Json(entries)
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: LedgerStats,
    balance: f64,
}

async fn stats(State(session): State<SessionHandle>) -> impl IntoResponse {
    let snap = session.snapshot();
    Json(StatsResponse {
        stats: snap.stats,
        balance: snap.balance,
    })
}

// =============================================================================
// Commands
// =============================================================================

async fn open_trade(
    State(session): State<SessionHandle>,
    Json(command): Json<OpenTradeCommand>,
) -> Result<impl IntoResponse, SessionError> {
    match session.open_trade(command).await {
        Ok(trade) => {
            info!(id = %trade.id, contract = %trade.contract_type, "trade placed via API");
            Ok(Json(trade))
        }
        Err(e) => {
            warn!(error = %e, "trade placement refused");
            Err(e)
        }
    }
}

#[derive(Deserialize)]
struct BalanceResetRequest {
    balance: f64,
}

#[derive(Serialize)]
struct BalanceResetResponse {
    balance: f64,
}

async fn reset_balance(
    State(session): State<SessionHandle>,
    Json(req): Json<BalanceResetRequest>,
) -> Result<impl IntoResponse, SessionError> {
    let balance = session.reset_balance(req.balance).await?;
    info!(balance, "balance reset via API");
    Ok(Json(BalanceResetResponse { balance }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::runtime_config::RuntimeConfig;
    use crate::session::Session;
    use crate::types::Tick;

    fn start() -> SessionHandle {
        let cfg = RuntimeConfig {
            rng_seed: Some(3),
            ..RuntimeConfig::default()
        };
        let (handle, _task) = Session::start(&cfg);
        handle
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(start());
        let resp = app.oneshot(get_req("/api/v1/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn trade_without_ticks_is_unavailable() {
        let app = router(start());
        let body = serde_json::json!({ "contract_type": "Rise", "stake": 1.0 });
        let resp = app.oneshot(post_json("/api/v1/trades", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn trade_lifecycle_over_http() {
        let session = start();
        let app = router(session.clone());
        session.submit_tick(Tick::new("R_100", 60, 100.0)).await.unwrap();

        let body = serde_json::json!({
            "contract_type": "Rise",
            "stake": 2.0,
            "expiry": { "kind": "ticks", "value": 1 }
        });
        let resp = app
            .clone()
            .oneshot(post_json("/api/v1/trades", body.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let trade = body_json(resp).await;
        assert_eq!(trade["status"], "Pending");
        assert_eq!(trade["entry_price"], 100.0);

        // Second trade while the first is pending.
        let resp = app
            .clone()
            .oneshot(post_json("/api/v1/trades", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        session.submit_tick(Tick::new("R_100", 61, 101.0)).await.unwrap();
        // Balance reset doubles as a barrier: the tick above is applied first.
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/v1/balance/reset",
                serde_json::json!({ "balance": 500.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.clone().oneshot(get_req("/api/v1/ledger")).await.unwrap();
        let ledger = body_json(resp).await;
        assert_eq!(ledger.as_array().unwrap().len(), 1);
        assert_eq!(ledger[0]["result"], "Win");

        let resp = app.oneshot(get_req("/api/v1/stats")).await.unwrap();
        let stats = body_json(resp).await;
        assert_eq!(stats["total_trades"], 1);
        assert_eq!(stats["balance"], 500.0);
    }

    #[tokio::test]
    async fn unsupported_contract_is_unprocessable() {
        let session = start();
        session.submit_tick(Tick::new("R_100", 60, 100.0)).await.unwrap();
        let app = router(session);

        let body = serde_json::json!({ "contract_type": "Multiplier", "stake": 1.0 });
        let resp = app.oneshot(post_json("/api/v1/trades", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("Multiplier"));
    }

    #[tokio::test]
    async fn negative_balance_reset_is_refused() {
        let app = router(start());
        let resp = app
            .oneshot(post_json(
                "/api/v1/balance/reset",
                serde_json::json!({ "balance": -5.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
