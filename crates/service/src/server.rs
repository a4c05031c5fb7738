//! HTTP server: merges the operator routes with the order-path endpoints.
//!
//! Adds `/orders/check`, `/risk-events`, `/volatility`, `/drawdown`,
//! `/backfill` and `/metrics` alongside the operator routes (`/kill`, `/reset`, `/status`,
//! `/breakers`, `/breakers/reset`, `/health`).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use tg_core::types::{AssetId, TenantId};
use tg_oms::backfill::{BackfillRequest, NewBackfill};
use tg_oms::OmsError;
use tg_risk::circuit_breaker::{BreakerCheck, BreakerContext, BreakerState};
use tg_risk::drawdown::{DrawdownScope, DrawdownState};
use tg_risk::http::{operator_router, ApiError, OperatorState};
use tg_risk::kill_switch::{KillSwitchState, RiskEvent};
use tg_risk::volatility::{IndexType, VolatilityState};
use tg_risk::{Approval, OrderIntent, RiskReject};

use crate::engine::RiskEngine;

/// Body for `POST /risk-events`.
#[derive(Debug, Deserialize)]
pub struct RiskEventRequest {
    pub tenant_id: TenantId,
    pub event: RiskEvent,
    /// Breaker context evaluated alongside the kill switch triggers.
    #[serde(default)]
    pub context: Option<BreakerContext>,
}

#[derive(Debug, Serialize)]
pub struct RiskEventResponse {
    /// Set when an automatic trigger activated the tenant switch.
    pub kill_switch: Option<KillSwitchState>,
    pub breakers: Option<BreakerCheck>,
}

/// Body for `POST /volatility`.
#[derive(Debug, Deserialize)]
pub struct VolatilityUpdate {
    pub asset_id: AssetId,
    pub value: f64,
    #[serde(default = "default_index_type")]
    pub index_type: IndexType,
}

fn default_index_type() -> IndexType {
    IndexType::Atr
}

/// Body for `POST /drawdown`.
#[derive(Debug, Deserialize)]
pub struct DrawdownUpdate {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub strategy_id: Option<tg_core::types::StrategyId>,
    pub current_value: f64,
}

/// Body for `POST /backfill`.
#[derive(Debug, Deserialize)]
pub struct BackfillSubmit {
    pub tenant_id: TenantId,
    #[serde(flatten)]
    pub request: NewBackfill,
}

/// Progress reported by a backfill worker.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillAction {
    Start,
    Complete { records_fetched: u64 },
    Fail { error: String },
    Cancel,
}

/// Body for `POST /backfill/{request_id}`.
#[derive(Debug, Deserialize)]
pub struct BackfillTransition {
    pub tenant_id: TenantId,
    #[serde(flatten)]
    pub action: BackfillAction,
}

#[derive(Debug, Deserialize)]
pub struct BackfillQuery {
    pub tenant: TenantId,
}

fn reject_status(reject: &RiskReject) -> StatusCode {
    match reject {
        RiskReject::InvalidOrder(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RiskReject::CheckUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::FORBIDDEN,
    }
}

fn reject_error(reject: RiskReject) -> ApiError {
    ApiError::new(reject_status(&reject), reject.code(), reject.to_string())
}

fn oms_error(err: OmsError) -> ApiError {
    let status = match &err {
        OmsError::Rejected(r) => reject_status(r),
        OmsError::InvalidBackfillRequest(_) | OmsError::Validation(_) => StatusCode::BAD_REQUEST,
        OmsError::BackfillAlreadyInProgress { .. } | OmsError::BackfillCannotBeCancelled { .. } => {
            StatusCode::CONFLICT
        }
        OmsError::NotFound { .. } | OmsError::AdapterNotRegistered { .. } => StatusCode::NOT_FOUND,
        OmsError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        OmsError::Store(_) => {
            tracing::error!(error = %err, "order-path request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    ApiError::new(status, err.code(), err.to_string())
}

/// `POST /orders/check`: run an order intent through the risk gate.
async fn check_order_handler(
    State(engine): State<Arc<RiskEngine>>,
    Json(intent): Json<OrderIntent>,
) -> Result<Json<Approval>, ApiError> {
    engine.check_order(&intent).map(Json).map_err(reject_error)
}

/// `POST /risk-events`: feed kill switch auto triggers and, when a context
/// is supplied, the tenant's circuit breakers.
async fn risk_event_handler(
    State(engine): State<Arc<RiskEngine>>,
    Json(req): Json<RiskEventRequest>,
) -> Result<Json<RiskEventResponse>, ApiError> {
    let kill_switch = engine
        .kill_switch
        .evaluate_auto_triggers(&req.tenant_id, &req.event)
        .await?;
    let breakers = match &req.context {
        Some(ctx) => Some(engine.breakers.check_breakers(&req.tenant_id, ctx)?),
        None => None,
    };
    Ok(Json(RiskEventResponse {
        kill_switch,
        breakers,
    }))
}

/// `POST /volatility`: publish a market-wide index reading.
async fn volatility_handler(
    State(engine): State<Arc<RiskEngine>>,
    Json(req): Json<VolatilityUpdate>,
) -> Result<Json<VolatilityState>, ApiError> {
    let state = engine
        .volatility
        .update_volatility_index(&req.asset_id, req.value, req.index_type, None)?;
    Ok(Json(state))
}

/// `POST /drawdown`: record a portfolio or strategy value.
async fn drawdown_handler(
    State(engine): State<Arc<RiskEngine>>,
    Json(req): Json<DrawdownUpdate>,
) -> Result<Json<DrawdownState>, ApiError> {
    let scope = match req.strategy_id {
        Some(id) => DrawdownScope::Strategy(id),
        None => DrawdownScope::Portfolio,
    };
    let state = engine
        .drawdown
        .update_value(&req.tenant_id, &scope, req.current_value)?;
    Ok(Json(state))
}

/// `POST /backfill`: queue a historical data backfill.
async fn backfill_submit_handler(
    State(engine): State<Arc<RiskEngine>>,
    Json(req): Json<BackfillSubmit>,
) -> Result<(StatusCode, Json<BackfillRequest>), ApiError> {
    let stored = engine
        .backfill
        .submit(&req.tenant_id, req.request)
        .map_err(oms_error)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// `GET /backfill?tenant=..`
async fn backfill_list_handler(
    State(engine): State<Arc<RiskEngine>>,
    Query(q): Query<BackfillQuery>,
) -> Result<Json<Vec<BackfillRequest>>, ApiError> {
    engine.backfill.list(&q.tenant).map(Json).map_err(oms_error)
}

/// `POST /backfill/{request_id}`: worker progress or operator cancel.
async fn backfill_transition_handler(
    State(engine): State<Arc<RiskEngine>>,
    Path(request_id): Path<String>,
    Json(req): Json<BackfillTransition>,
) -> Result<Json<BackfillRequest>, ApiError> {
    let tracker = &engine.backfill;
    let tenant = &req.tenant_id;
    let stored = match req.action {
        BackfillAction::Start => tracker.start(tenant, &request_id),
        BackfillAction::Complete { records_fetched } => tracker.complete(tenant, &request_id, records_fetched),
        BackfillAction::Fail { error } => tracker.fail(tenant, &request_id, &error),
        BackfillAction::Cancel => tracker.cancel(tenant, &request_id),
    }
    .map_err(oms_error)?;
    Ok(Json(stored))
}

/// `GET /metrics`: Prometheus-style text.
async fn metrics_handler(State(engine): State<Arc<RiskEngine>>) -> String {
    let m = &engine.metrics;
    let mut out = String::new();

    let counters = [
        ("tg_orders_checked_total", "Orders evaluated by the risk gate", &m.orders_checked),
        ("tg_orders_approved_total", "Orders approved by the risk gate", &m.orders_approved),
        ("tg_orders_rejected_total", "Orders rejected by the risk gate", &m.orders_rejected),
        ("tg_breakers_closed_total", "Breakers closed by auto-reset", &m.breakers_closed),
        ("tg_breakers_retripped_total", "HALF_OPEN breakers tripped again", &m.breakers_retripped),
        ("tg_idempotency_pruned_total", "Expired idempotency records removed", &m.idempotency_pruned),
        ("tg_backfills_expired_total", "Stale backfills failed by the prune sweep", &m.backfills_expired),
        ("tg_sweep_failures_total", "Sweep steps that failed", &m.sweep_failures),
    ];
    for (name, help, value) in counters {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
            value.load(Ordering::Relaxed)
        ));
    }

    out.push_str(
        "# HELP tg_breakers_by_state Circuit breakers per state\n\
         # TYPE tg_breakers_by_state gauge\n",
    );
    if let Ok(tenants) = engine.breakers.tenants() {
        for tenant in tenants {
            let Ok(breakers) = engine.breakers.list_breakers(&tenant) else {
                continue;
            };
            for state in [BreakerState::Closed, BreakerState::Open, BreakerState::HalfOpen] {
                let count = breakers.iter().filter(|b| b.state == state).count();
                out.push_str(&format!(
                    "tg_breakers_by_state{{tenant_id=\"{}\",state=\"{}\"}} {}\n",
                    tenant, state, count
                ));
            }
        }
    }

    out
}

/// Full application router.
pub fn router(engine: Arc<RiskEngine>) -> Router {
    let operator = operator_router(Arc::new(OperatorState {
        kill_switch: engine.kill_switch.clone(),
        breakers: engine.breakers.clone(),
        verifier: engine.verifier.clone(),
    }));

    let orders = Router::new()
        .route("/orders/check", post(check_order_handler))
        .route("/risk-events", post(risk_event_handler))
        .route("/volatility", post(volatility_handler))
        .route("/drawdown", post(drawdown_handler))
        .route("/backfill", post(backfill_submit_handler).get(backfill_list_handler))
        .route("/backfill/:request_id", post(backfill_transition_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(engine);

    orders.merge(operator)
}

/// Bind and serve until `cancel` fires.
pub async fn run_server(engine: Arc<RiskEngine>, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("{}:{}", engine.config.server.host, engine.config.server.port);
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use tg_core::alert::RecordingAlertSink;
    use tg_core::config::AppConfig;
    use tg_core::types::ManualClock;
    use tg_risk::http::ErrorBody;

    fn make_engine() -> Arc<RiskEngine> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let mut config = AppConfig::load(None).unwrap();
        config.kill_switch.operator_token = "secret123".to_string();
        Arc::new(RiskEngine::build(config, clock, Arc::new(RecordingAlertSink::new())).unwrap())
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_check_order_approved() {
        let app = router(make_engine());
        let req = json_post(
            "/orders/check",
            serde_json::json!({
                "tenant_id": "acme",
                "asset_id": "BTC",
                "is_entry": true,
                "quantity": 5.0
            }),
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["approved_quantity"], 5.0);
    }

    #[tokio::test]
    async fn test_check_order_invalid_quantity() {
        let app = router(make_engine());
        let req = json_post(
            "/orders/check",
            serde_json::json!({
                "tenant_id": "acme",
                "asset_id": "BTC",
                "is_entry": true,
                "quantity": -1.0
            }),
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.code, "invalid_order");
    }

    #[tokio::test]
    async fn test_kill_then_check_is_forbidden() {
        let engine = make_engine();
        let app = router(engine.clone());

        let resp = app
            .clone()
            .oneshot(json_post(
                "/kill",
                serde_json::json!({"tenant_id": "acme", "reason": "manual halt"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(json_post(
                "/orders/check",
                serde_json::json!({
                    "tenant_id": "acme",
                    "asset_id": "BTC",
                    "is_entry": false,
                    "quantity": 1.0
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "kill_switch_active");
    }

    #[tokio::test]
    async fn test_volatility_update_throttles_entries() {
        let app = router(make_engine());
        let resp = app
            .clone()
            .oneshot(json_post(
                "/volatility",
                serde_json::json!({"asset_id": "ETH", "value": 60.0}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["level"], "HIGH");

        let resp = app
            .oneshot(json_post(
                "/orders/check",
                serde_json::json!({
                    "tenant_id": "acme",
                    "asset_id": "ETH",
                    "is_entry": true,
                    "quantity": 10.0
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["approved_quantity"], 5.0);
        assert_eq!(json["throttle_percent"], 50.0);
    }

    #[tokio::test]
    async fn test_risk_event_triggers_kill_switch() {
        let app = router(make_engine());
        let resp = app
            .clone()
            .oneshot(json_post(
                "/risk-events",
                serde_json::json!({
                    "tenant_id": "acme",
                    "event": {"type": "LOSS", "loss_percent": 7.5}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["kill_switch"]["active"], true);

        let req = Request::builder()
            .uri("/status?tenant=acme")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["trading_enabled"], false);
    }

    #[tokio::test]
    async fn test_drawdown_update_rejects_negative_value() {
        let app = router(make_engine());
        let resp = app
            .oneshot(json_post(
                "/drawdown",
                serde_json::json!({"tenant_id": "acme", "current_value": -5.0}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_exposes_counters() {
        let engine = make_engine();
        let intent = OrderIntent {
            tenant_id: TenantId::new("acme"),
            strategy_id: None,
            asset_id: AssetId::new("BTC"),
            is_entry: true,
            quantity: 1.0,
        };
        engine.check_order(&intent).unwrap();

        let app = router(engine);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("tg_orders_checked_total 1"));
        assert!(text.contains("tg_orders_approved_total 1"));
    }

    fn backfill_body() -> serde_json::Value {
        serde_json::json!({
            "tenant_id": "acme",
            "asset_id": "BTC",
            "source": "binance",
            "start": "2024-04-01T00:00:00Z",
            "end": "2024-04-08T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_backfill_lifecycle_over_http() {
        let app = router(make_engine());
        let resp = app
            .clone()
            .oneshot(json_post("/backfill", backfill_body()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "PENDING");
        let id = json["request_id"].as_str().unwrap().to_string();

        // Same (asset, source) while the first is in flight.
        let resp = app
            .clone()
            .oneshot(json_post("/backfill", backfill_body()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["code"], "backfill_already_in_progress");

        let uri = format!("/backfill/{}", id);
        let resp = app
            .clone()
            .oneshot(json_post(&uri, serde_json::json!({"tenant_id": "acme", "action": "START"})))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["status"], "RUNNING");

        let resp = app
            .clone()
            .oneshot(json_post(
                &uri,
                serde_json::json!({"tenant_id": "acme", "action": "COMPLETE", "records_fetched": 168}),
            ))
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["records_fetched"], 168);

        let resp = app
            .clone()
            .oneshot(json_post(&uri, serde_json::json!({"tenant_id": "acme", "action": "CANCEL"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["code"], "backfill_cannot_be_cancelled");

        let req = Request::builder()
            .uri("/backfill?tenant=acme")
            .body(Body::empty())
            .unwrap();
        let json = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backfill_rejects_inverted_range() {
        let app = router(make_engine());
        let mut body = backfill_body();
        body["start"] = serde_json::json!("2024-04-09T00:00:00Z");
        let resp = app.clone().oneshot(json_post("/backfill", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "invalid_backfill_request");

        let resp = app
            .oneshot(json_post(
                "/backfill/bf-missing",
                serde_json::json!({"tenant_id": "acme", "action": "START"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_is_merged() {
        let app = router(make_engine());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
