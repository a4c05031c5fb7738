//! Operator HTTP API.
//!
//! A small axum surface for emergency control that stays usable even when
//! the order path is wedged.
//!
//! ## Endpoints
//!
//! - `POST /kill`: activate a kill switch (no auth; speed first)
//! - `POST /reset?tenant=..&token=..`: deactivate a kill switch
//! - `GET /status?tenant=..`: kill switch states for a tenant
//! - `GET /breakers?tenant=..`: circuit breakers for a tenant
//! - `POST /breakers/reset?tenant=..&breaker_id=..&token=..`: close a breaker
//! - `GET /health`: liveness

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use tg_core::types::{AssetId, BreakerId, StrategyId, TenantId};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerService};
use crate::error::{CircuitBreakerError, RiskError};
use crate::kill_switch::{KillSwitchScope, KillSwitchService, KillSwitchState, TokenVerifier};

/// Shared state for operator handlers.
pub struct OperatorState {
    pub kill_switch: Arc<KillSwitchService>,
    pub breakers: Arc<CircuitBreakerService>,
    /// Checks tokens presented to `/breakers/reset`.
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Error body: `{"error": "...", "code": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RiskError> for ApiError {
    fn from(err: RiskError) -> Self {
        let (status, code) = match &err {
            RiskError::AuthenticationRequired(_) => (StatusCode::UNAUTHORIZED, "authentication_required"),
            RiskError::NotFound { .. } | RiskError::CircuitBreaker(CircuitBreakerError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            RiskError::CircuitBreaker(CircuitBreakerError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, "invalid_transition")
            }
            RiskError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
            RiskError::ConcurrentModification(_) => (StatusCode::CONFLICT, "concurrent_modification"),
            RiskError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "operator request failed");
        }
        Self::new(status, code, err.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Body for `POST /kill`.
#[derive(Debug, Deserialize)]
pub struct KillRequest {
    pub tenant_id: TenantId,
    /// `TENANT` (default), `STRATEGY` or `ASSET`.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub scope_id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResetQuery {
    tenant: TenantId,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scope_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TenantQuery {
    tenant: TenantId,
}

#[derive(Debug, Deserialize)]
struct BreakerResetQuery {
    tenant: TenantId,
    breaker_id: BreakerId,
    #[serde(default)]
    token: Option<String>,
}

/// JSON response for `/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// `false` while the tenant-wide switch is active.
    pub trading_enabled: bool,
    pub switches: Vec<KillSwitchState>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Build the operator router.
pub fn operator_router(state: Arc<OperatorState>) -> Router {
    Router::new()
        .route("/kill", post(kill_handler))
        .route("/reset", post(reset_handler))
        .route("/status", get(status_handler))
        .route("/breakers", get(breakers_handler))
        .route("/breakers/reset", post(breaker_reset_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

fn parse_scope(scope: Option<&str>, scope_id: Option<&str>) -> Result<KillSwitchScope, ApiError> {
    let id = scope_id.map(str::trim).filter(|s| !s.is_empty());
    match (scope.map(str::to_ascii_uppercase).as_deref(), id) {
        (None | Some("TENANT"), _) => Ok(KillSwitchScope::Tenant),
        (Some("STRATEGY"), Some(id)) => Ok(KillSwitchScope::Strategy(StrategyId::new(id))),
        (Some("ASSET"), Some(id)) => Ok(KillSwitchScope::Asset(AssetId::new(id))),
        (Some(s @ ("STRATEGY" | "ASSET")), None) => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "validation_failed",
            format!("scope {} requires scope_id", s),
        )),
        (Some(other), _) => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "validation_failed",
            format!("unknown kill switch scope {}", other),
        )),
    }
}

/// `POST /kill`: activate immediately. Never authenticated.
async fn kill_handler(
    State(state): State<Arc<OperatorState>>,
    Json(req): Json<KillRequest>,
) -> Result<Json<KillSwitchState>, ApiError> {
    let scope = parse_scope(req.scope.as_deref(), req.scope_id.as_deref())?;
    let stored = state
        .kill_switch
        .activate(&req.tenant_id, &scope, &req.reason, req.actor.as_deref())
        .await?;
    Ok(Json(stored))
}

/// `POST /reset`: deactivate a switch. Token rules come from the tenant's
/// kill switch config.
async fn reset_handler(
    State(state): State<Arc<OperatorState>>,
    Query(query): Query<ResetQuery>,
) -> Result<Json<KillSwitchState>, ApiError> {
    let scope = parse_scope(query.scope.as_deref(), query.scope_id.as_deref())?;
    let stored = state.kill_switch.deactivate(
        &query.tenant,
        &scope,
        query.token.as_deref(),
        query.actor.as_deref(),
    )?;
    Ok(Json(stored))
}

async fn status_handler(
    State(state): State<Arc<OperatorState>>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let mut switches = state.kill_switch.list_states(&query.tenant)?;
    switches.sort_by_key(|s| s.scope.key());
    let trading_enabled = !switches
        .iter()
        .any(|s| s.active && s.scope == KillSwitchScope::Tenant);
    Ok(Json(StatusResponse {
        trading_enabled,
        switches,
    }))
}

async fn breakers_handler(
    State(state): State<Arc<OperatorState>>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<Vec<CircuitBreaker>>, ApiError> {
    Ok(Json(state.breakers.list_breakers(&query.tenant)?))
}

/// `POST /breakers/reset`: a supplied token must pass the verifier before
/// the breaker service sees it.
async fn breaker_reset_handler(
    State(state): State<Arc<OperatorState>>,
    Query(query): Query<BreakerResetQuery>,
) -> Result<Json<CircuitBreaker>, ApiError> {
    let token = query.token.as_deref().filter(|t| !t.trim().is_empty());
    if let Some(t) = token {
        if !state.verifier.verify(&query.tenant, t) {
            tracing::warn!(
                tenant_id = %query.tenant,
                breaker_id = %query.breaker_id,
                "breaker reset with unrecognised token"
            );
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "authentication_required",
                "invalid operator token",
            ));
        }
    }
    let stored = state
        .breakers
        .reset_breaker(&query.tenant, &query.breaker_id, token)?;
    Ok(Json(stored))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
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
    use tg_core::config::CircuitBreakerDefaults;
    use tg_core::types::{Clock, ManualClock};

    use crate::circuit_breaker::{BreakerCondition, BreakerScope, BreakerState, NewBreaker};
    use crate::kill_switch::{KillSwitchConfig, NoopCanceller, StaticTokenVerifier};

    fn make_state() -> Arc<OperatorState> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let alerts = Arc::new(RecordingAlertSink::new());
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(StaticTokenVerifier::new(vec!["secret123".to_string()]));
        let kill_switch = Arc::new(KillSwitchService::in_memory(
            verifier.clone(),
            Arc::new(NoopCanceller),
            alerts.clone(),
            clock.clone(),
            KillSwitchConfig {
                require_auth_for_deactivation: true,
                triggers: vec![],
            },
        ));
        let breakers = Arc::new(CircuitBreakerService::in_memory(
            alerts,
            clock,
            CircuitBreakerDefaults {
                cooldown_minutes: 15,
                auto_reset_enabled: true,
            },
        ));
        Arc::new(OperatorState {
            kill_switch,
            breakers,
            verifier,
        })
    }

    fn make_open_breaker(state: &OperatorState) {
        let tenant = TenantId::new("acme");
        let id = BreakerId::new("cb-1");
        state
            .breakers
            .create_breaker(
                &tenant,
                NewBreaker {
                    breaker_id: Some(id.clone()),
                    name: "loss".into(),
                    scope: BreakerScope::Portfolio,
                    scope_id: None,
                    condition: BreakerCondition::LossRate { loss_percent: 5.0 },
                    cooldown_minutes: None,
                    auto_reset_enabled: None,
                },
            )
            .unwrap();
        state.breakers.trip_breaker(&tenant, &id, "test").unwrap();
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = operator_router(make_state());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_initially_enabled() {
        let app = operator_router(make_state());
        let req = Request::builder()
            .uri("/status?tenant=acme")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert!(json.trading_enabled);
        assert!(json.switches.is_empty());
    }

    #[tokio::test]
    async fn test_kill_activates_tenant_switch() {
        let state = make_state();
        let app = operator_router(state.clone());
        let req = post_json(
            "/kill",
            serde_json::json!({"tenant_id": "acme", "reason": "runaway algo", "actor": "ops"}),
        );
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["active"], true);
        assert_eq!(json["trigger_type"], "MANUAL");

        let blocked = state
            .kill_switch
            .is_blocked(&TenantId::new("acme"), None, None)
            .unwrap();
        assert!(blocked.is_some());

        let req = Request::builder()
            .uri("/status?tenant=acme")
            .body(Body::empty())
            .unwrap();
        let json = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(json["trading_enabled"], false);
    }

    #[tokio::test]
    async fn test_kill_asset_scope_requires_id() {
        let app = operator_router(make_state());
        let req = post_json(
            "/kill",
            serde_json::json!({"tenant_id": "acme", "scope": "ASSET", "reason": "x"}),
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "validation_failed");
    }

    #[tokio::test]
    async fn test_reset_with_valid_token() {
        let state = make_state();
        let tenant = TenantId::new("acme");
        state
            .kill_switch
            .activate(&tenant, &KillSwitchScope::Tenant, "test", None)
            .await
            .unwrap();
        let app = operator_router(state.clone());
        let resp = app
            .oneshot(post_empty("/reset?tenant=acme&token=secret123&actor=ops"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.kill_switch.is_blocked(&tenant, None, None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_with_invalid_token() {
        let state = make_state();
        state
            .kill_switch
            .activate(&TenantId::new("acme"), &KillSwitchScope::Tenant, "test", None)
            .await
            .unwrap();
        let app = operator_router(state);
        let resp = app
            .oneshot(post_empty("/reset?tenant=acme&token=wrong"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reset_without_token() {
        let state = make_state();
        state
            .kill_switch
            .activate(&TenantId::new("acme"), &KillSwitchScope::Tenant, "test", None)
            .await
            .unwrap();
        let app = operator_router(state);
        let resp = app.oneshot(post_empty("/reset?tenant=acme")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reset_unknown_switch_is_not_found() {
        let app = operator_router(make_state());
        let resp = app
            .oneshot(post_empty("/reset?tenant=acme&scope=STRATEGY&scope_id=mm-1&token=secret123"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_breakers() {
        let state = make_state();
        make_open_breaker(&state);
        let app = operator_router(state);
        let req = Request::builder()
            .uri("/breakers?tenant=acme")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json.as_array().map(Vec::len), Some(1));
        assert_eq!(json[0]["state"], "OPEN");
    }

    #[tokio::test]
    async fn test_breaker_reset_requires_valid_token() {
        let state = make_state();
        make_open_breaker(&state);
        let app = operator_router(state.clone());

        let resp = app
            .clone()
            .oneshot(post_empty("/breakers/reset?tenant=acme&breaker_id=cb-1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(post_empty("/breakers/reset?tenant=acme&breaker_id=cb-1&token=wrong"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(post_empty("/breakers/reset?tenant=acme&breaker_id=cb-1&token=secret123"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let b = state
            .breakers
            .get_breaker(&TenantId::new("acme"), &BreakerId::new("cb-1"))
            .unwrap();
        assert_eq!(b.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_reset_unknown_is_not_found() {
        let app = operator_router(make_state());
        let resp = app
            .oneshot(post_empty("/breakers/reset?tenant=acme&breaker_id=nope&token=secret123"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
