//! Kill switches: the coarsest control.
//!
//! A kill switch is a binary per-scope halt. Activation is never gated by
//! authentication (in an emergency speed beats access control) and cancels
//! the scope's pending orders as a side effect. Deactivation may require an
//! operator token.
//!
//! A TENANT-scope switch blocks every strategy and asset of that tenant; a
//! narrower switch never blocks the wider scope.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tg_core::alert::{dispatch_alert, Alert, AlertSink, AlertType};
use tg_core::config::KillSwitchDefaults;
use tg_core::store::{update_versioned, Change, InMemoryRepository, Repository, Versioned};
use tg_core::types::{AssetId, Clock, StrategyId, TenantId};

use crate::error::{RiskError, RiskResult};

/// What a kill switch covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "scope_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillSwitchScope {
    Tenant,
    Strategy(StrategyId),
    Asset(AssetId),
}

impl KillSwitchScope {
    pub fn key(&self) -> String {
        match self {
            KillSwitchScope::Tenant => "tenant".to_string(),
            KillSwitchScope::Strategy(id) => format!("strategy:{}", id),
            KillSwitchScope::Asset(id) => format!("asset:{}", id),
        }
    }
}

impl fmt::Display for KillSwitchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Manual,
    Automatic,
}

/// One logical switch per (tenant, scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub tenant_id: TenantId,
    pub scope: KillSwitchScope,
    pub active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    /// `None` for automatic triggers.
    pub activated_by: Option<String>,
    pub activation_reason: Option<String>,
    pub trigger_type: Option<TriggerType>,
    pub pending_orders_cancelled: u32,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<String>,
    pub version: u64,
}

impl Versioned for KillSwitchState {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl KillSwitchState {
    fn inactive(tenant: &TenantId, scope: &KillSwitchScope) -> Self {
        Self {
            tenant_id: tenant.clone(),
            scope: scope.clone(),
            active: false,
            activated_at: None,
            activated_by: None,
            activation_reason: None,
            trigger_type: None,
            pending_orders_cancelled: 0,
            deactivated_at: None,
            deactivated_by: None,
            version: 0,
        }
    }
}

/// Condition that activates the tenant switch without an operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoTrigger {
    /// Loss within the evaluation window, in percent.
    RapidLoss { threshold_percent: f64 },
    /// Fraction of failed requests.
    ErrorRate { threshold: f64 },
    /// Any reported system error.
    SystemError,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub trigger: AutoTrigger,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    pub require_auth_for_deactivation: bool,
    pub triggers: Vec<TriggerConfig>,
}

impl From<&KillSwitchDefaults> for KillSwitchConfig {
    fn from(d: &KillSwitchDefaults) -> Self {
        Self {
            require_auth_for_deactivation: d.require_auth_for_deactivation,
            triggers: vec![
                TriggerConfig {
                    trigger: AutoTrigger::RapidLoss {
                        threshold_percent: d.rapid_loss_threshold_percent,
                    },
                    enabled: d.rapid_loss_enabled,
                },
                TriggerConfig {
                    trigger: AutoTrigger::ErrorRate {
                        threshold: d.error_rate_threshold,
                    },
                    enabled: d.error_rate_enabled,
                },
                TriggerConfig {
                    trigger: AutoTrigger::SystemError,
                    enabled: d.system_error_enabled,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchConfigRecord {
    pub config: KillSwitchConfig,
    pub version: u64,
}

impl Versioned for KillSwitchConfigRecord {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Incoming risk signal for automatic trigger evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskEvent {
    Loss { loss_percent: f64 },
    ErrorRate { error_rate: f64 },
    SystemError { message: String },
}

impl AutoTrigger {
    /// Reason string if this trigger fires for `event`. A NaN signal fires:
    /// an unreadable loss or error rate is treated as a breach.
    pub fn matches(&self, event: &RiskEvent) -> Option<String> {
        match (self, event) {
            (AutoTrigger::RapidLoss { .. }, RiskEvent::Loss { loss_percent }) if loss_percent.is_nan() => {
                Some("RAPID_LOSS signal is not a number".to_string())
            }
            (AutoTrigger::RapidLoss { threshold_percent }, RiskEvent::Loss { loss_percent })
                if *loss_percent >= *threshold_percent =>
            {
                Some(format!("RAPID_LOSS {}% >= {}%", loss_percent, threshold_percent))
            }
            (AutoTrigger::ErrorRate { .. }, RiskEvent::ErrorRate { error_rate }) if error_rate.is_nan() => {
                Some("ERROR_RATE signal is not a number".to_string())
            }
            (AutoTrigger::ErrorRate { threshold }, RiskEvent::ErrorRate { error_rate })
                if *error_rate >= *threshold =>
            {
                Some(format!("ERROR_RATE {} >= {}", error_rate, threshold))
            }
            (AutoTrigger::SystemError, RiskEvent::SystemError { message }) => {
                Some(format!("SYSTEM_ERROR: {}", message))
            }
            _ => None,
        }
    }
}

/// Checks operator tokens.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, tenant: &TenantId, token: &str) -> bool;
}

/// Accepts a fixed set of operator tokens for every tenant.
pub struct StaticTokenVerifier {
    tokens: Vec<String>,
}

impl StaticTokenVerifier {
    /// Blank tokens are dropped; with none left every token is rejected.
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().filter(|t| !t.trim().is_empty()).collect(),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, _tenant: &TenantId, token: &str) -> bool {
        self.tokens.iter().any(|t| constant_time_eq(t.as_bytes(), token.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Outcome of cancelling a scope's pending orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationReport {
    pub attempted: u32,
    pub cancelled: u32,
    pub failed: u32,
}

/// Cancels pending orders when a switch activates. Must tolerate partial
/// failure and report what actually happened.
#[async_trait]
pub trait PendingOrderCanceller: Send + Sync {
    async fn cancel_pending(&self, tenant: &TenantId, scope: &KillSwitchScope) -> CancellationReport;
}

/// Canceller for deployments without an order book to sweep.
pub struct NoopCanceller;

#[async_trait]
impl PendingOrderCanceller for NoopCanceller {
    async fn cancel_pending(&self, _tenant: &TenantId, _scope: &KillSwitchScope) -> CancellationReport {
        CancellationReport::default()
    }
}

pub struct KillSwitchService {
    states: Arc<dyn Repository<KillSwitchState>>,
    configs: Arc<dyn Repository<KillSwitchConfigRecord>>,
    verifier: Arc<dyn TokenVerifier>,
    canceller: Arc<dyn PendingOrderCanceller>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    defaults: KillSwitchConfig,
}

impl KillSwitchService {
    pub fn new(
        states: Arc<dyn Repository<KillSwitchState>>,
        configs: Arc<dyn Repository<KillSwitchConfigRecord>>,
        verifier: Arc<dyn TokenVerifier>,
        canceller: Arc<dyn PendingOrderCanceller>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        defaults: KillSwitchConfig,
    ) -> Self {
        Self {
            states,
            configs,
            verifier,
            canceller,
            alerts,
            clock,
            defaults,
        }
    }

    pub fn in_memory(
        verifier: Arc<dyn TokenVerifier>,
        canceller: Arc<dyn PendingOrderCanceller>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        defaults: KillSwitchConfig,
    ) -> Self {
        Self::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
            verifier,
            canceller,
            alerts,
            clock,
            defaults,
        )
    }

    pub fn verifier(&self) -> &Arc<dyn TokenVerifier> {
        &self.verifier
    }

    pub fn set_config(&self, tenant: &TenantId, config: KillSwitchConfig) -> RiskResult<()> {
        for t in &config.triggers {
            let bad = match t.trigger {
                AutoTrigger::RapidLoss { threshold_percent } => !(threshold_percent > 0.0),
                AutoTrigger::ErrorRate { threshold } => !(threshold > 0.0 && threshold <= 1.0),
                AutoTrigger::SystemError => false,
            };
            if bad {
                return Err(RiskError::validation(format!("invalid trigger {:?}", t.trigger)));
            }
        }
        self.configs
            .put(tenant, "config", KillSwitchConfigRecord { config, version: 0 })?;
        Ok(())
    }

    pub fn config_for(&self, tenant: &TenantId) -> RiskResult<KillSwitchConfig> {
        Ok(self
            .configs
            .get(tenant, "config")?
            .map(|r| r.config)
            .unwrap_or_else(|| self.defaults.clone()))
    }

    /// Manually activate a switch and cancel the scope's pending orders.
    pub async fn activate(
        &self,
        tenant: &TenantId,
        scope: &KillSwitchScope,
        reason: &str,
        actor: Option<&str>,
    ) -> RiskResult<KillSwitchState> {
        self.activate_inner(tenant, scope, reason, actor, TriggerType::Manual)
            .await
    }

    /// Activate the tenant switch if any enabled trigger matches `event`.
    pub async fn evaluate_auto_triggers(
        &self,
        tenant: &TenantId,
        event: &RiskEvent,
    ) -> RiskResult<Option<KillSwitchState>> {
        let cfg = self.config_for(tenant)?;
        let Some(reason) = cfg
            .triggers
            .iter()
            .filter(|t| t.enabled)
            .find_map(|t| t.trigger.matches(event))
        else {
            return Ok(None);
        };
        let state = self
            .activate_inner(tenant, &KillSwitchScope::Tenant, &reason, None, TriggerType::Automatic)
            .await?;
        Ok(Some(state))
    }

    async fn activate_inner(
        &self,
        tenant: &TenantId,
        scope: &KillSwitchScope,
        reason: &str,
        actor: Option<&str>,
        trigger_type: TriggerType,
    ) -> RiskResult<KillSwitchState> {
        let key = scope.key();
        let now = self.clock.now();
        self.states
            .insert_if_absent(tenant, &key, KillSwitchState::inactive(tenant, scope))?;

        let (stored, activated) = update_versioned(self.states.as_ref(), tenant, &key, |s| {
            if s.active {
                return Ok::<_, RiskError>(Change::Keep(false));
            }
            s.active = true;
            s.activated_at = Some(now);
            s.activated_by = actor.map(str::to_string);
            s.activation_reason = Some(reason.to_string());
            s.trigger_type = Some(trigger_type);
            s.pending_orders_cancelled = 0;
            s.deactivated_at = None;
            s.deactivated_by = None;
            Ok(Change::Write(true))
        })?;
        if !activated {
            tracing::debug!(tenant_id = %tenant, scope = %scope, "kill switch already active");
            return Ok(stored);
        }

        tracing::warn!(
            tenant_id = %tenant,
            scope = %scope,
            trigger = ?trigger_type,
            actor = ?actor,
            reason,
            "KILL SWITCH ACTIVATED"
        );
        dispatch_alert(
            self.alerts.as_ref(),
            Alert {
                alert_type: AlertType::KillSwitchActivated,
                tenant_id: tenant.clone(),
                entity_id: key.clone(),
                new_state: "ACTIVE".to_string(),
                reason: Some(reason.to_string()),
                at: now,
            },
        );

        // The switch is already blocking; cancellation is best effort.
        let report = self.canceller.cancel_pending(tenant, scope).await;
        if report.failed > 0 {
            tracing::warn!(
                tenant_id = %tenant,
                scope = %scope,
                attempted = report.attempted,
                cancelled = report.cancelled,
                failed = report.failed,
                "some pending orders could not be cancelled"
            );
        }
        let (stored, ()) = update_versioned(self.states.as_ref(), tenant, &key, |s| {
            s.pending_orders_cancelled = report.cancelled;
            Ok::<_, RiskError>(Change::Write(()))
        })?;
        Ok(stored)
    }

    /// Deactivate a switch. With `require_auth_for_deactivation`, `token`
    /// must pass the verifier.
    pub fn deactivate(
        &self,
        tenant: &TenantId,
        scope: &KillSwitchScope,
        token: Option<&str>,
        actor: Option<&str>,
    ) -> RiskResult<KillSwitchState> {
        let cfg = self.config_for(tenant)?;
        if cfg.require_auth_for_deactivation {
            let ok = token
                .filter(|t| !t.trim().is_empty())
                .is_some_and(|t| self.verifier.verify(tenant, t));
            if !ok {
                tracing::warn!(tenant_id = %tenant, scope = %scope, "kill switch deactivation refused");
                return Err(RiskError::AuthenticationRequired(format!(
                    "deactivating kill switch {} requires a valid operator token",
                    scope
                )));
            }
        }

        let key = scope.key();
        let now = self.clock.now();
        if self.states.get(tenant, &key)?.is_none() {
            return Err(RiskError::NotFound {
                entity: "kill switch",
                id: format!("{}:{}", tenant, key),
            });
        }
        let (stored, deactivated) = update_versioned(self.states.as_ref(), tenant, &key, |s| {
            if !s.active {
                return Ok::<_, RiskError>(Change::Keep(false));
            }
            s.active = false;
            s.deactivated_at = Some(now);
            s.deactivated_by = actor.map(str::to_string);
            Ok(Change::Write(true))
        })?;

        if deactivated {
            tracing::info!(tenant_id = %tenant, scope = %scope, actor = ?actor, "kill switch deactivated");
            dispatch_alert(
                self.alerts.as_ref(),
                Alert {
                    alert_type: AlertType::KillSwitchDeactivated,
                    tenant_id: tenant.clone(),
                    entity_id: key,
                    new_state: "INACTIVE".to_string(),
                    reason: actor.map(|a| format!("deactivated by {}", a)),
                    at: now,
                },
            );
        }
        Ok(stored)
    }

    pub fn get_state(
        &self,
        tenant: &TenantId,
        scope: &KillSwitchScope,
    ) -> RiskResult<Option<KillSwitchState>> {
        Ok(self.states.get(tenant, &scope.key())?)
    }

    pub fn list_states(&self, tenant: &TenantId) -> RiskResult<Vec<KillSwitchState>> {
        Ok(self.states.list(tenant)?)
    }

    /// Active switch blocking an order on `asset` placed by `strategy`, if
    /// any. The tenant switch is consulted first.
    pub fn is_blocked(
        &self,
        tenant: &TenantId,
        strategy: Option<&StrategyId>,
        asset: Option<&AssetId>,
    ) -> RiskResult<Option<KillSwitchState>> {
        let mut scopes = vec![KillSwitchScope::Tenant];
        if let Some(s) = strategy {
            scopes.push(KillSwitchScope::Strategy(s.clone()));
        }
        if let Some(a) = asset {
            scopes.push(KillSwitchScope::Asset(a.clone()));
        }
        for scope in scopes {
            if let Some(state) = self.states.get(tenant, &scope.key())? {
                if state.active {
                    return Ok(Some(state));
                }
            }
        }
        Ok(None)
    }
}
