use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tg_core::alert::{dispatch_alert, Alert, AlertSink, AlertType};
use tg_core::config::CircuitBreakerDefaults;
use tg_core::store::{update_versioned, Change, InMemoryRepository, Repository, StoreError};
use tg_core::types::{AssetId, BreakerId, Clock, StrategyId, TenantId};

use super::{
    evaluate_condition, BreakerCondition, BreakerContext, BreakerEvent, BreakerEventKind,
    BreakerHistory, BreakerScope, BreakerState, CircuitBreaker, ConditionResult, ContextProvider,
    ContextSnapshots,
};
use crate::error::{CircuitBreakerError, RiskError, RiskResult};

/// Request to create a breaker. Unset fields fall back to configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBreaker {
    /// Explicit id; generated when absent.
    #[serde(default)]
    pub breaker_id: Option<BreakerId>,
    pub name: String,
    pub scope: BreakerScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    pub condition: BreakerCondition,
    #[serde(default)]
    pub cooldown_minutes: Option<u32>,
    #[serde(default)]
    pub auto_reset_enabled: Option<bool>,
}

/// Result of [`CircuitBreakerService::check_breakers`].
#[derive(Debug, Clone, Serialize)]
pub struct BreakerCheck {
    /// Breakers in scope that are OPEN after this evaluation.
    pub open_breakers: Vec<CircuitBreaker>,
    /// Breakers this call moved into OPEN.
    pub tripped: Vec<BreakerId>,
    /// Every breaker in scope is CLOSED.
    pub all_closed: bool,
}

/// What one auto-reset sweep did for a tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutoResetReport {
    pub half_opened: Vec<BreakerId>,
    pub closed: Vec<BreakerId>,
    pub retripped: Vec<BreakerId>,
    /// HALF_OPEN breakers left alone because no context was available.
    pub awaiting_context: Vec<BreakerId>,
}

/// Circuit breaker service: evaluation, manual control and auto-reset.
pub struct CircuitBreakerService {
    breakers: Arc<dyn Repository<CircuitBreaker>>,
    history: Arc<dyn Repository<BreakerHistory>>,
    snapshots: Arc<ContextSnapshots>,
    provider: Arc<dyn ContextProvider>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    defaults: CircuitBreakerDefaults,
    seq: AtomicU64,
}

impl CircuitBreakerService {
    pub fn new(
        breakers: Arc<dyn Repository<CircuitBreaker>>,
        history: Arc<dyn Repository<BreakerHistory>>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        defaults: CircuitBreakerDefaults,
    ) -> Self {
        let snapshots = Arc::new(ContextSnapshots::new());
        let provider: Arc<dyn ContextProvider> = snapshots.clone();
        Self {
            breakers,
            history,
            snapshots,
            provider,
            alerts,
            clock,
            defaults,
            seq: AtomicU64::new(1),
        }
    }

    /// Service over fresh in-process repositories.
    pub fn in_memory(
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        defaults: CircuitBreakerDefaults,
    ) -> Self {
        Self::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
            alerts,
            clock,
            defaults,
        )
    }

    /// Use `provider` instead of the built-in snapshot cache when
    /// re-evaluating HALF_OPEN breakers.
    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn snapshots(&self) -> &Arc<ContextSnapshots> {
        &self.snapshots
    }

    /// Create a CLOSED breaker.
    pub fn create_breaker(&self, tenant: &TenantId, req: NewBreaker) -> RiskResult<CircuitBreaker> {
        req.condition.validate().map_err(RiskError::Validation)?;
        if req.name.trim().is_empty() {
            return Err(RiskError::validation("breaker name must not be empty"));
        }
        let scope_id = match req.scope {
            BreakerScope::Portfolio => String::new(),
            BreakerScope::Asset | BreakerScope::Strategy => match req.scope_id {
                Some(id) if !id.trim().is_empty() => id,
                _ => {
                    return Err(RiskError::validation(format!(
                        "{:?} breaker requires a scope id",
                        req.scope
                    )))
                }
            },
        };

        let now = self.clock.now();
        let breaker_id = req.breaker_id.unwrap_or_else(|| {
            BreakerId::new(format!(
                "cb-{}-{}",
                now.timestamp_millis(),
                self.seq.fetch_add(1, Ordering::Relaxed)
            ))
        });
        let breaker = CircuitBreaker {
            breaker_id: breaker_id.clone(),
            tenant_id: tenant.clone(),
            name: req.name,
            scope: req.scope,
            scope_id,
            condition: req.condition,
            state: BreakerState::Closed,
            trip_count: 0,
            last_tripped_at: None,
            cooldown_minutes: req.cooldown_minutes.unwrap_or(self.defaults.cooldown_minutes),
            auto_reset_enabled: req
                .auto_reset_enabled
                .unwrap_or(self.defaults.auto_reset_enabled),
            updated_at: now,
            version: 0,
        };

        if self
            .breakers
            .insert_if_absent(tenant, breaker_id.as_str(), breaker)?
            .is_some()
        {
            return Err(RiskError::validation(format!(
                "breaker {} already exists",
                breaker_id
            )));
        }
        let stored = self.get_breaker(tenant, &breaker_id)?;
        tracing::info!(
            tenant_id = %tenant,
            breaker_id = %breaker_id,
            scope = ?stored.scope,
            condition = stored.condition.name(),
            threshold = stored.condition.threshold(),
            "circuit breaker created"
        );
        Ok(stored)
    }

    pub fn get_breaker(&self, tenant: &TenantId, id: &BreakerId) -> RiskResult<CircuitBreaker> {
        self.breakers
            .get(tenant, id.as_str())?
            .ok_or_else(|| CircuitBreakerError::NotFound(id.clone()).into())
    }

    pub fn list_breakers(&self, tenant: &TenantId) -> RiskResult<Vec<CircuitBreaker>> {
        let mut all = self.breakers.list(tenant)?;
        all.sort_by(|a, b| a.breaker_id.cmp(&b.breaker_id));
        Ok(all)
    }

    /// Tenants that own at least one breaker.
    pub fn tenants(&self) -> RiskResult<Vec<TenantId>> {
        Ok(self.breakers.tenants()?)
    }

    /// Breakers covering an order on `asset`/`strategy` that are not CLOSED.
    pub fn blocking_breakers(
        &self,
        tenant: &TenantId,
        asset: Option<&AssetId>,
        strategy: Option<&StrategyId>,
    ) -> RiskResult<Vec<CircuitBreaker>> {
        Ok(self
            .breakers
            .list_where(tenant, &|b| b.state != BreakerState::Closed && b.covers(asset, strategy))?)
    }

    /// Evaluate every breaker matching `ctx` and trip the ones whose
    /// condition holds.
    pub fn check_breakers(&self, tenant: &TenantId, ctx: &BreakerContext) -> RiskResult<BreakerCheck> {
        self.snapshots.record(tenant, ctx);

        let in_scope = self.breakers.list_where(tenant, &|b| b.applies_to(ctx))?;
        let mut current = Vec::with_capacity(in_scope.len());
        let mut tripped = Vec::new();

        for breaker in in_scope {
            let result = self.evaluate(tenant, &breaker, ctx)?;
            if result.triggered && breaker.state != BreakerState::Open {
                let (stored, moved) = self.trip_inner(
                    tenant,
                    &breaker.breaker_id,
                    None,
                    trip_reason(&breaker.condition, &result),
                    Some(result),
                )?;
                if moved {
                    tripped.push(stored.breaker_id.clone());
                }
                current.push(stored);
            } else {
                current.push(breaker);
            }
        }

        let all_closed = current.iter().all(|b| b.state == BreakerState::Closed);
        let open_breakers = current
            .into_iter()
            .filter(|b| b.state == BreakerState::Open)
            .collect();
        Ok(BreakerCheck {
            open_breakers,
            tripped,
            all_closed,
        })
    }

    /// Force a breaker OPEN. Already-OPEN breakers are left untouched.
    pub fn trip_breaker(
        &self,
        tenant: &TenantId,
        id: &BreakerId,
        reason: &str,
    ) -> RiskResult<CircuitBreaker> {
        let (stored, _) = self.trip_inner(tenant, id, None, reason.to_string(), None)?;
        Ok(stored)
    }

    /// Close a breaker. OPEN breakers need a non-empty `auth_token`;
    /// HALF_OPEN breakers do not. Clears the breaker's event history.
    pub fn reset_breaker(
        &self,
        tenant: &TenantId,
        id: &BreakerId,
        auth_token: Option<&str>,
    ) -> RiskResult<CircuitBreaker> {
        let has_token = auth_token.is_some_and(|t| !t.trim().is_empty());
        let now = self.clock.now();
        let (stored, moved) = self.mutate(tenant, id, |b| match b.state {
            BreakerState::Closed => Ok(Change::Keep(false)),
            BreakerState::Open if !has_token => Err(RiskError::AuthenticationRequired(format!(
                "resetting OPEN breaker {} requires an auth token",
                id
            ))),
            BreakerState::Open | BreakerState::HalfOpen => {
                b.state = BreakerState::Closed;
                b.updated_at = now;
                Ok(Change::Write(true))
            }
        })?;

        self.clear_history(tenant, id)?;
        if moved {
            tracing::info!(tenant_id = %tenant, breaker_id = %id, "circuit breaker reset");
            self.alert(AlertType::BreakerClosed, &stored, Some("manual reset".to_string()));
        }
        Ok(stored)
    }

    /// OPEN -> HALF_OPEN. Any other starting state is an error.
    pub fn transition_to_half_open(
        &self,
        tenant: &TenantId,
        id: &BreakerId,
    ) -> RiskResult<CircuitBreaker> {
        let now = self.clock.now();
        let (stored, ()) = self
            .mutate(tenant, id, |b| {
                if b.state != BreakerState::Open {
                    return Err(CircuitBreakerError::InvalidTransition {
                        breaker_id: id.clone(),
                        from: b.state,
                        to: BreakerState::HalfOpen,
                    }
                    .into());
                }
                b.state = BreakerState::HalfOpen;
                b.updated_at = now;
                Ok(Change::Write(()))
            })
            .inspect_err(|e| {
                if matches!(e, RiskError::CircuitBreaker(CircuitBreakerError::InvalidTransition { .. })) {
                    tracing::error!(tenant_id = %tenant, breaker_id = %id, error = %e, "rejected breaker transition");
                }
            })?;

        self.record_event(tenant, id, BreakerEventKind::HalfOpened, None);
        tracing::info!(tenant_id = %tenant, breaker_id = %id, "circuit breaker half-open");
        self.alert(AlertType::BreakerHalfOpen, &stored, Some("cooldown elapsed".to_string()));
        Ok(stored)
    }

    /// One auto-reset pass over a tenant's breakers.
    ///
    /// OPEN breakers with auto-reset enabled and an elapsed cooldown move to
    /// HALF_OPEN. Every HALF_OPEN breaker is then re-evaluated against the
    /// latest context recorded for its scope since it tripped: clear means
    /// CLOSED, triggered means OPEN again.
    pub fn process_auto_reset(&self, tenant: &TenantId) -> RiskResult<AutoResetReport> {
        let now = self.clock.now();
        let mut report = AutoResetReport::default();

        let due = self.breakers.list_where(tenant, &|b| {
            b.state == BreakerState::Open && b.auto_reset_enabled && b.cooldown_elapsed(now)
        })?;
        for breaker in due {
            match self.transition_to_half_open(tenant, &breaker.breaker_id) {
                Ok(_) => report.half_opened.push(breaker.breaker_id),
                Err(RiskError::CircuitBreaker(CircuitBreakerError::InvalidTransition { .. })) => {
                    // Another writer moved it first.
                }
                Err(e) => return Err(e),
            }
        }

        let half_open = self
            .breakers
            .list_where(tenant, &|b| b.state == BreakerState::HalfOpen)?;
        for breaker in half_open {
            let Some(ctx) = self.provider.context_for(tenant, &breaker) else {
                tracing::debug!(tenant_id = %tenant, breaker_id = %breaker.breaker_id, "no context, staying half-open");
                report.awaiting_context.push(breaker.breaker_id);
                continue;
            };
            let result = self.evaluate(tenant, &breaker, &ctx)?;
            if result.triggered {
                let (_, moved) = self.trip_inner(
                    tenant,
                    &breaker.breaker_id,
                    Some(BreakerState::HalfOpen),
                    trip_reason(&breaker.condition, &result),
                    Some(result),
                )?;
                if moved {
                    report.retripped.push(breaker.breaker_id);
                }
            } else if self.close_half_open(tenant, &breaker.breaker_id)? {
                report.closed.push(breaker.breaker_id);
            }
        }
        Ok(report)
    }

    /// Record the outcome of an operation guarded by a consecutive-failure
    /// breaker. Returns the current failure streak.
    pub fn record_outcome(&self, tenant: &TenantId, id: &BreakerId, success: bool) -> RiskResult<u32> {
        self.get_breaker(tenant, id)?;
        let kind = if success {
            BreakerEventKind::Success
        } else {
            BreakerEventKind::Failure
        };
        let history = self.append_event(tenant, id, kind, None)?;
        Ok(history.failure_streak())
    }

    pub fn history(&self, tenant: &TenantId, id: &BreakerId) -> RiskResult<Vec<BreakerEvent>> {
        self.get_breaker(tenant, id)?;
        Ok(self
            .history
            .get(tenant, id.as_str())?
            .map(|h| h.events)
            .unwrap_or_default())
    }

    // ── internals ──────────────────────────────────────────────────────

    fn mutate<R>(
        &self,
        tenant: &TenantId,
        id: &BreakerId,
        apply: impl FnMut(&mut CircuitBreaker) -> RiskResult<Change<R>>,
    ) -> RiskResult<(CircuitBreaker, R)> {
        update_versioned(self.breakers.as_ref(), tenant, id.as_str(), apply).map_err(|e| match e {
            RiskError::Store(StoreError::NotFound(_)) => CircuitBreakerError::NotFound(id.clone()).into(),
            other => other,
        })
    }

    /// Move a breaker to OPEN unless it already is. With `only_from`, the
    /// trip only happens from that state. Returns the stored breaker and
    /// whether this call performed the transition.
    fn trip_inner(
        &self,
        tenant: &TenantId,
        id: &BreakerId,
        only_from: Option<BreakerState>,
        reason: String,
        result: Option<ConditionResult>,
    ) -> RiskResult<(CircuitBreaker, bool)> {
        let now = self.clock.now();
        let (stored, moved) = self.mutate(tenant, id, |b| {
            if b.state == BreakerState::Open || only_from.is_some_and(|s| s != b.state) {
                return Ok(Change::Keep(false));
            }
            b.state = BreakerState::Open;
            b.trip_count += 1;
            b.last_tripped_at = Some(now);
            b.updated_at = now;
            Ok(Change::Write(true))
        })?;

        if moved {
            tracing::warn!(
                tenant_id = %tenant,
                breaker_id = %id,
                trip_count = stored.trip_count,
                reason = %reason,
                "circuit breaker tripped"
            );
            self.provider.breaker_tripped(tenant, &stored);
            self.record_event(tenant, id, BreakerEventKind::Tripped, result);
            self.alert(AlertType::BreakerTripped, &stored, Some(reason));
        }
        Ok((stored, moved))
    }

    fn close_half_open(&self, tenant: &TenantId, id: &BreakerId) -> RiskResult<bool> {
        let now = self.clock.now();
        let (stored, moved) = self.mutate(tenant, id, |b| {
            if b.state != BreakerState::HalfOpen {
                return Ok(Change::Keep(false));
            }
            b.state = BreakerState::Closed;
            b.updated_at = now;
            Ok(Change::Write(true))
        })?;
        if moved {
            self.clear_history(tenant, id)?;
            tracing::info!(tenant_id = %tenant, breaker_id = %id, "circuit breaker closed after re-evaluation");
            self.alert(AlertType::BreakerClosed, &stored, Some("condition cleared".to_string()));
        }
        Ok(moved)
    }

    /// Evaluate `breaker` against `ctx`, filling the failure streak from
    /// history when the context has none.
    fn evaluate(
        &self,
        tenant: &TenantId,
        breaker: &CircuitBreaker,
        ctx: &BreakerContext,
    ) -> RiskResult<ConditionResult> {
        if matches!(breaker.condition, BreakerCondition::ConsecutiveFailures { .. })
            && ctx.consecutive_failures.is_none()
        {
            let streak = self
                .history
                .get(tenant, breaker.breaker_id.as_str())?
                .map(|h| h.failure_streak())
                .unwrap_or(0);
            let ctx = BreakerContext {
                consecutive_failures: Some(streak),
                ..ctx.clone()
            };
            return Ok(evaluate_condition(&breaker.condition, &ctx));
        }
        Ok(evaluate_condition(&breaker.condition, ctx))
    }

    fn append_event(
        &self,
        tenant: &TenantId,
        id: &BreakerId,
        kind: BreakerEventKind,
        result: Option<ConditionResult>,
    ) -> RiskResult<BreakerHistory> {
        let event = BreakerEvent {
            kind,
            value: result.map(|r| r.current_value),
            threshold: result.map(|r| r.threshold),
            at: self.clock.now(),
        };
        self.history
            .insert_if_absent(tenant, id.as_str(), BreakerHistory::new(id.clone()))?;
        let (stored, ()) = update_versioned(self.history.as_ref(), tenant, id.as_str(), |h| {
            h.push(event.clone());
            Ok::<_, RiskError>(Change::Write(()))
        })?;
        Ok(stored)
    }

    /// History bookkeeping after a transition that is already persisted.
    /// Failures are logged; the transition stands.
    fn record_event(
        &self,
        tenant: &TenantId,
        id: &BreakerId,
        kind: BreakerEventKind,
        result: Option<ConditionResult>,
    ) {
        if let Err(e) = self.append_event(tenant, id, kind, result) {
            tracing::warn!(tenant_id = %tenant, breaker_id = %id, error = %e, "failed to record breaker event");
        }
    }

    fn clear_history(&self, tenant: &TenantId, id: &BreakerId) -> RiskResult<()> {
        self.history.remove(tenant, id.as_str())?;
        Ok(())
    }

    fn alert(&self, alert_type: AlertType, breaker: &CircuitBreaker, reason: Option<String>) {
        dispatch_alert(
            self.alerts.as_ref(),
            Alert {
                alert_type,
                tenant_id: breaker.tenant_id.clone(),
                entity_id: breaker.breaker_id.to_string(),
                new_state: breaker.state.to_string(),
                reason,
                at: self.clock.now(),
            },
        );
    }
}

fn trip_reason(condition: &BreakerCondition, result: &ConditionResult) -> String {
    format!(
        "{} {} >= {}",
        condition.name(),
        result.current_value,
        result.threshold
    )
}
