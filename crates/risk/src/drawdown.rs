//! Peak-to-current drawdown tracking.
//!
//! Each (tenant, scope) tracks the highest value seen since its last reset.
//! The decline from that peak is classified against two thresholds:
//! NORMAL below warning, WARNING up to max, CRITICAL at or above max.
//! With `pause_on_critical`, a breach moves straight to PAUSED. Only PAUSED
//! halts new entries; a CRITICAL state without pausing is reported but not
//! enforced.
//!
//! Recovery is cooldown-gated. Leaving CRITICAL/PAUSED additionally needs a
//! period boundary (for DAILY/WEEKLY/MONTHLY) to have passed since the
//! breach, and `auto_resume_enabled`. MANUAL intervals only recover through
//! [`DrawdownService::reset_drawdown`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use tg_core::alert::{dispatch_alert, Alert, AlertSink, AlertType};
use tg_core::config::DrawdownDefaults;
pub use tg_core::config::ResetInterval;
use tg_core::store::{update_versioned, Change, InMemoryRepository, Repository, StoreError, Versioned};
use tg_core::types::{Clock, StrategyId, TenantId};

use crate::error::{RiskError, RiskResult};
use crate::threshold::{CooldownTracker, Level, LeveledThreshold};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrawdownStatus {
    Normal,
    Warning,
    Critical,
    /// CRITICAL and trading halted.
    Paused,
}

impl DrawdownStatus {
    /// At or past the max threshold, paused or not.
    pub fn is_breached(self) -> bool {
        matches!(self, DrawdownStatus::Critical | DrawdownStatus::Paused)
    }

    pub fn blocks_entries(self) -> bool {
        self == DrawdownStatus::Paused
    }
}

impl Level for DrawdownStatus {
    fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DrawdownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DrawdownStatus::Normal => "NORMAL",
            DrawdownStatus::Warning => "WARNING",
            DrawdownStatus::Critical => "CRITICAL",
            DrawdownStatus::Paused => "PAUSED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrawdownScope {
    Portfolio,
    Strategy(StrategyId),
}

impl DrawdownScope {
    pub fn key(&self) -> String {
        match self {
            DrawdownScope::Portfolio => "portfolio".to_string(),
            DrawdownScope::Strategy(id) => format!("strategy:{}", id),
        }
    }

    pub fn strategy_id(&self) -> Option<&StrategyId> {
        match self {
            DrawdownScope::Portfolio => None,
            DrawdownScope::Strategy(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownConfig {
    pub warning_threshold_percent: f64,
    pub max_threshold_percent: f64,
    pub reset_interval: ResetInterval,
    pub auto_resume_enabled: bool,
    pub cooldown_minutes: u32,
    pub pause_on_critical: bool,
}

impl From<&DrawdownDefaults> for DrawdownConfig {
    fn from(d: &DrawdownDefaults) -> Self {
        Self {
            warning_threshold_percent: d.warning_threshold_percent,
            max_threshold_percent: d.max_threshold_percent,
            reset_interval: d.reset_interval,
            auto_resume_enabled: d.auto_resume_enabled,
            cooldown_minutes: d.cooldown_minutes,
            pause_on_critical: d.pause_on_critical,
        }
    }
}

impl DrawdownConfig {
    pub fn validate(&self) -> RiskResult<()> {
        let (w, m) = (self.warning_threshold_percent, self.max_threshold_percent);
        if !(w > 0.0 && w < m && m <= 100.0) {
            return Err(RiskError::validation(format!(
                "drawdown thresholds must satisfy 0 < warning ({}) < max ({}) <= 100",
                w, m
            )));
        }
        Ok(())
    }

    fn levels(&self) -> RiskResult<LeveledThreshold<DrawdownStatus>> {
        LeveledThreshold::new(
            DrawdownStatus::Normal,
            vec![
                (self.warning_threshold_percent, DrawdownStatus::Warning),
                (self.max_threshold_percent, DrawdownStatus::Critical),
            ],
        )
    }

    /// Status a drawdown percentage maps to, before hysteresis.
    pub fn classify(&self, drawdown_percent: f64) -> RiskResult<DrawdownStatus> {
        let status = self.levels()?.classify(drawdown_percent);
        Ok(match status {
            DrawdownStatus::Critical if self.pause_on_critical => DrawdownStatus::Paused,
            s => s,
        })
    }

    fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.cooldown_minutes))
    }
}

/// Start of the reset period containing `now` (UTC). `None` for MANUAL.
pub fn period_start(interval: ResetInterval, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let date = now.date_naive();
    let start = match interval {
        ResetInterval::Daily => date,
        ResetInterval::Weekly => {
            date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
        }
        ResetInterval::Monthly => date.with_day(1)?,
        ResetInterval::Manual => return None,
    };
    Some(Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0)?))
}

/// Has a period boundary passed strictly after `since`?
pub fn boundary_passed(interval: ResetInterval, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    period_start(interval, now).is_some_and(|start| start > since)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownState {
    pub state_id: String,
    pub tenant_id: TenantId,
    pub strategy_id: Option<StrategyId>,
    pub scope: DrawdownScope,
    pub peak_value: f64,
    pub current_value: f64,
    pub drawdown_percent: f64,
    /// `peak_value - current_value`.
    pub drawdown_absolute: f64,
    pub status: DrawdownStatus,
    pub last_reset_at: DateTime<Utc>,
    /// When the current CRITICAL/PAUSED episode began.
    pub breached_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for DrawdownState {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl DrawdownState {
    fn fresh(tenant: &TenantId, scope: &DrawdownScope, value: f64, now: DateTime<Utc>) -> Self {
        Self {
            state_id: format!("{}:{}", tenant, scope.key()),
            tenant_id: tenant.clone(),
            strategy_id: scope.strategy_id().cloned(),
            scope: scope.clone(),
            peak_value: value,
            current_value: value,
            drawdown_percent: 0.0,
            drawdown_absolute: 0.0,
            status: DrawdownStatus::Normal,
            last_reset_at: now,
            breached_at: None,
            updated_at: now,
            version: 0,
        }
    }

    fn recompute(&mut self) {
        self.drawdown_absolute = self.peak_value - self.current_value;
        self.drawdown_percent = if self.peak_value > 0.0 {
            self.drawdown_absolute / self.peak_value * 100.0
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownConfigRecord {
    pub config: DrawdownConfig,
    pub version: u64,
}

impl Versioned for DrawdownConfigRecord {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

pub struct DrawdownService {
    states: Arc<dyn Repository<DrawdownState>>,
    configs: Arc<dyn Repository<DrawdownConfigRecord>>,
    cooldowns: CooldownTracker,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    defaults: DrawdownConfig,
}

impl DrawdownService {
    pub fn new(
        states: Arc<dyn Repository<DrawdownState>>,
        configs: Arc<dyn Repository<DrawdownConfigRecord>>,
        cooldowns: CooldownTracker,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        defaults: DrawdownConfig,
    ) -> RiskResult<Self> {
        defaults.validate()?;
        Ok(Self {
            states,
            configs,
            cooldowns,
            alerts,
            clock,
            defaults,
        })
    }

    pub fn in_memory(
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        defaults: DrawdownConfig,
    ) -> RiskResult<Self> {
        Self::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
            CooldownTracker::in_memory(),
            alerts,
            clock,
            defaults,
        )
    }

    /// Override config for one scope (`Some`) or the whole tenant (`None`).
    pub fn set_config(
        &self,
        tenant: &TenantId,
        scope: Option<&DrawdownScope>,
        config: DrawdownConfig,
    ) -> RiskResult<()> {
        config.validate()?;
        self.configs.put(
            tenant,
            &config_key(scope),
            DrawdownConfigRecord { config, version: 0 },
        )?;
        Ok(())
    }

    /// Effective config: scope override, tenant override, then defaults.
    pub fn config_for(&self, tenant: &TenantId, scope: &DrawdownScope) -> RiskResult<DrawdownConfig> {
        if let Some(r) = self.configs.get(tenant, &config_key(Some(scope)))? {
            return Ok(r.config);
        }
        if let Some(r) = self.configs.get(tenant, &config_key(None))? {
            return Ok(r.config);
        }
        Ok(self.defaults.clone())
    }

    /// Record a new portfolio/strategy value and reclassify.
    pub fn update_value(
        &self,
        tenant: &TenantId,
        scope: &DrawdownScope,
        current_value: f64,
    ) -> RiskResult<DrawdownState> {
        if !current_value.is_finite() || current_value < 0.0 {
            return Err(RiskError::validation(format!(
                "drawdown value must be a non-negative finite number, got {}",
                current_value
            )));
        }
        let cfg = self.config_for(tenant, scope)?;
        let now = self.clock.now();
        let key = scope.key();
        self.states.insert_if_absent(
            tenant,
            &key,
            DrawdownState::fresh(tenant, scope, current_value, now),
        )?;

        let (stored, previous) = update_versioned(self.states.as_ref(), tenant, &key, |s| {
            let previous = s.status;
            if boundary_passed(cfg.reset_interval, s.last_reset_at, now) {
                s.peak_value = current_value;
                s.last_reset_at = now;
            } else {
                s.peak_value = s.peak_value.max(current_value);
            }
            s.current_value = current_value;
            s.recompute();

            let computed = cfg.classify(s.drawdown_percent)?;
            let gate = self.release_gate(&cfg, s);
            let r = self
                .cooldowns
                .resolve(tenant, &key, previous, computed, cfg.cooldown(), now, gate)?;
            s.status = r.effective;
            if s.status.is_breached() {
                s.breached_at.get_or_insert(now);
            } else {
                s.breached_at = None;
            }
            s.updated_at = now;
            Ok::<_, RiskError>(Change::Write(previous))
        })?;

        if stored.status != previous {
            self.announce(&stored, previous, None);
        }
        Ok(stored)
    }

    pub fn get_status(&self, tenant: &TenantId, scope: &DrawdownScope) -> RiskResult<DrawdownState> {
        self.states
            .get(tenant, &scope.key())?
            .ok_or_else(|| RiskError::NotFound {
                entity: "drawdown state",
                id: format!("{}:{}", tenant, scope.key()),
            })
    }

    pub fn list_states(&self, tenant: &TenantId) -> RiskResult<Vec<DrawdownState>> {
        Ok(self.states.list(tenant)?)
    }

    pub fn tenants(&self) -> RiskResult<Vec<TenantId>> {
        Ok(self.states.tenants()?)
    }

    /// Operator reset: rebase the peak to the current value and return to
    /// NORMAL immediately.
    pub fn reset_drawdown(
        &self,
        tenant: &TenantId,
        scope: &DrawdownScope,
        actor: Option<&str>,
    ) -> RiskResult<DrawdownState> {
        let now = self.clock.now();
        let key = scope.key();
        let (stored, previous) = update_versioned(self.states.as_ref(), tenant, &key, |s| {
            let previous = s.status;
            s.peak_value = s.current_value;
            s.recompute();
            s.status = DrawdownStatus::Normal;
            s.breached_at = None;
            s.last_reset_at = now;
            s.updated_at = now;
            Ok::<_, RiskError>(Change::Write(previous))
        })
        .map_err(|e| match e {
            RiskError::Store(StoreError::NotFound(_)) => RiskError::NotFound {
                entity: "drawdown state",
                id: format!("{}:{}", tenant, key),
            },
            other => other,
        })?;
        self.cooldowns.cancel(tenant, &key)?;

        tracing::info!(tenant_id = %tenant, scope = %key, actor = ?actor, "drawdown reset");
        if stored.status != previous {
            self.announce(&stored, previous, Some(format!("reset by {}", actor.unwrap_or("system"))));
        }
        Ok(stored)
    }

    /// Re-run classification for every non-NORMAL state of `tenant` at its
    /// last known value, so period rollovers and elapsed cooldowns take
    /// effect without a fresh update.
    pub fn refresh(&self, tenant: &TenantId) -> RiskResult<Vec<DrawdownState>> {
        let pending = self
            .states
            .list_where(tenant, &|s| s.status != DrawdownStatus::Normal)?;
        pending
            .into_iter()
            .map(|s| self.update_value(tenant, &s.scope, s.current_value))
            .collect()
    }

    /// First drawdown state that blocks new entries for an order placed by
    /// `strategy` (portfolio scope is always consulted).
    pub fn entry_block(
        &self,
        tenant: &TenantId,
        strategy: Option<&StrategyId>,
    ) -> RiskResult<Option<DrawdownState>> {
        let mut scopes = vec![DrawdownScope::Portfolio];
        if let Some(s) = strategy {
            scopes.push(DrawdownScope::Strategy(s.clone()));
        }
        for scope in scopes {
            if let Some(state) = self.states.get(tenant, &scope.key())? {
                if state.status.blocks_entries() {
                    return Ok(Some(state));
                }
            }
        }
        Ok(None)
    }

    /// May a held status be relaxed?
    fn release_gate(&self, cfg: &DrawdownConfig, s: &DrawdownState) -> bool {
        if !s.status.is_breached() {
            return true;
        }
        if !cfg.auto_resume_enabled || cfg.reset_interval == ResetInterval::Manual {
            return false;
        }
        match s.breached_at {
            Some(breached) => s.last_reset_at > breached,
            None => true,
        }
    }

    fn announce(&self, state: &DrawdownState, previous: DrawdownStatus, reason: Option<String>) {
        if state.status.blocks_entries() {
            tracing::warn!(
                tenant_id = %state.tenant_id,
                scope = %state.scope.key(),
                drawdown_percent = state.drawdown_percent,
                status = %state.status,
                "drawdown limit breached, new entries halted"
            );
        } else if state.status.is_breached() {
            tracing::warn!(
                tenant_id = %state.tenant_id,
                scope = %state.scope.key(),
                drawdown_percent = state.drawdown_percent,
                status = %state.status,
                "drawdown limit breached, trading not paused"
            );
        } else {
            tracing::info!(
                tenant_id = %state.tenant_id,
                scope = %state.scope.key(),
                from = %previous,
                to = %state.status,
                drawdown_percent = state.drawdown_percent,
                "drawdown status changed"
            );
        }
        dispatch_alert(
            self.alerts.as_ref(),
            Alert {
                alert_type: AlertType::DrawdownStatusChanged,
                tenant_id: state.tenant_id.clone(),
                entity_id: state.state_id.clone(),
                new_state: state.status.to_string(),
                reason: reason
                    .or_else(|| Some(format!("drawdown {:.2}%", state.drawdown_percent))),
                at: state.updated_at,
            },
        );
    }
}

fn config_key(scope: Option<&DrawdownScope>) -> String {
    match scope {
        Some(s) => s.key(),
        None => "tenant".to_string(),
    }
}
