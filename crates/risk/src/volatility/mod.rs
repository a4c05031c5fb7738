//! Volatility throttle.
//!
//! A per-asset volatility index is classified into LOW/NORMAL/HIGH/EXTREME.
//! HIGH and EXTREME shrink order quantities by a throttle percentage, and
//! EXTREME refuses new entries. Exits are always allowed.
//!
//! Market state is shared by all tenants and lives in the
//! [`TenantId::global()`] partition. A tenant with its own thresholds gets a
//! derived view stored in its own partition, with its own cooldown.
//!
//! De-escalating from HIGH or EXTREME holds the previous level's settings for
//! `cooldown_minutes`; re-escalation cancels the hold.

pub mod calc;

pub use calc::{atr, compute_index, realized_vol, std_dev, Candle, IndexParams, IndexType};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tg_core::alert::{dispatch_alert, Alert, AlertSink, AlertType};
use tg_core::config::VolatilityDefaults;
use tg_core::store::{update_versioned, Change, InMemoryRepository, Repository, Versioned};
use tg_core::types::{AssetId, Clock, TenantId};

use crate::error::{RiskError, RiskResult};
use crate::threshold::{CooldownTracker, Level, LeveledThreshold};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolatilityLevel {
    Low,
    Normal,
    High,
    Extreme,
}

impl Level for VolatilityLevel {
    fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for VolatilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VolatilityLevel::Low => "LOW",
            VolatilityLevel::Normal => "NORMAL",
            VolatilityLevel::High => "HIGH",
            VolatilityLevel::Extreme => "EXTREME",
        })
    }
}

/// Thresholds (index units) and throttle percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityConfig {
    pub normal_threshold: f64,
    pub high_threshold: f64,
    pub extreme_threshold: f64,
    pub high_throttle_percent: f64,
    pub extreme_throttle_percent: f64,
    pub cooldown_minutes: u32,
}

impl From<&VolatilityDefaults> for VolatilityConfig {
    fn from(d: &VolatilityDefaults) -> Self {
        Self {
            normal_threshold: d.normal_threshold,
            high_threshold: d.high_threshold,
            extreme_threshold: d.extreme_threshold,
            high_throttle_percent: d.high_throttle_percent,
            extreme_throttle_percent: d.extreme_throttle_percent,
            cooldown_minutes: d.cooldown_minutes,
        }
    }
}

impl VolatilityConfig {
    pub fn validate(&self) -> RiskResult<()> {
        self.levels()?;
        let (hi, ex) = (self.high_throttle_percent, self.extreme_throttle_percent);
        if !(0.0..=100.0).contains(&hi) || !(0.0..=100.0).contains(&ex) {
            return Err(RiskError::validation(format!(
                "throttle percents must be within [0, 100] (high {}, extreme {})",
                hi, ex
            )));
        }
        if hi >= ex {
            return Err(RiskError::validation(format!(
                "high throttle percent {} must be below extreme throttle percent {}",
                hi, ex
            )));
        }
        Ok(())
    }

    /// The step function for these thresholds.
    pub fn levels(&self) -> RiskResult<LeveledThreshold<VolatilityLevel>> {
        LeveledThreshold::new(
            VolatilityLevel::Low,
            vec![
                (self.normal_threshold, VolatilityLevel::Normal),
                (self.high_threshold, VolatilityLevel::High),
                (self.extreme_threshold, VolatilityLevel::Extreme),
            ],
        )
    }

    pub fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.cooldown_minutes))
    }
}

/// Classify an index value. Fails if the thresholds are not strictly
/// increasing.
pub fn determine_level(
    index: f64,
    normal_threshold: f64,
    high_threshold: f64,
    extreme_threshold: f64,
) -> RiskResult<VolatilityLevel> {
    let cfg = VolatilityConfig {
        normal_threshold,
        high_threshold,
        extreme_threshold,
        high_throttle_percent: 0.0,
        extreme_throttle_percent: 0.0,
        cooldown_minutes: 0,
    };
    Ok(cfg.levels()?.classify(index))
}

pub fn get_throttle_percent(level: VolatilityLevel, high_percent: f64, extreme_percent: f64) -> f64 {
    match level {
        VolatilityLevel::Low | VolatilityLevel::Normal => 0.0,
        VolatilityLevel::High => high_percent,
        VolatilityLevel::Extreme => extreme_percent,
    }
}

pub fn allow_new_entries(level: VolatilityLevel) -> bool {
    level != VolatilityLevel::Extreme
}

/// `quantity * (1 - throttle_percent / 100)`. A throttle of 100% or more
/// (or NaN) yields zero; negative throttles are treated as zero.
pub fn apply_throttle(quantity: f64, throttle_percent: f64) -> f64 {
    if !(throttle_percent < 100.0) {
        return 0.0;
    }
    quantity * (1.0 - throttle_percent.max(0.0) / 100.0)
}

/// Volatility state of one asset (market-wide, or a tenant's derived view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityState {
    pub state_id: String,
    pub asset_id: AssetId,
    pub current_index: f64,
    pub index_type: IndexType,
    /// Level in effect, including any level held during cooldown.
    pub level: VolatilityLevel,
    /// Level the current index alone maps to.
    pub computed_level: VolatilityLevel,
    pub throttle_percent: f64,
    pub allow_new_entries: bool,
    pub in_cooldown: bool,
    /// Config the level was computed with.
    pub config: VolatilityConfig,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for VolatilityState {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Stored override config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityConfigRecord {
    pub config: VolatilityConfig,
    pub version: u64,
}

impl Versioned for VolatilityConfigRecord {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// What the throttle says about trading an asset right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleDecision {
    pub asset_id: AssetId,
    pub level: VolatilityLevel,
    pub throttle_percent: f64,
    pub allow_new_entries: bool,
    pub in_cooldown: bool,
    /// `None` when no index has been published for the asset yet.
    pub index: Option<f64>,
}

impl ThrottleDecision {
    fn unthrottled(asset: &AssetId) -> Self {
        Self {
            asset_id: asset.clone(),
            level: VolatilityLevel::Low,
            throttle_percent: 0.0,
            allow_new_entries: true,
            in_cooldown: false,
            index: None,
        }
    }

    fn from_state(state: &VolatilityState) -> Self {
        Self {
            asset_id: state.asset_id.clone(),
            level: state.level,
            throttle_percent: state.throttle_percent,
            allow_new_entries: state.allow_new_entries,
            in_cooldown: state.in_cooldown,
            index: Some(state.current_index),
        }
    }
}

pub struct VolatilityService {
    states: Arc<dyn Repository<VolatilityState>>,
    configs: Arc<dyn Repository<VolatilityConfigRecord>>,
    cooldowns: CooldownTracker,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    defaults: VolatilityConfig,
}

impl VolatilityService {
    pub fn new(
        states: Arc<dyn Repository<VolatilityState>>,
        configs: Arc<dyn Repository<VolatilityConfigRecord>>,
        cooldowns: CooldownTracker,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        defaults: VolatilityConfig,
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
        defaults: VolatilityConfig,
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

    /// Install a tenant-wide (`asset = None`) or per-asset override.
    pub fn set_config(
        &self,
        tenant: &TenantId,
        asset: Option<&AssetId>,
        config: VolatilityConfig,
    ) -> RiskResult<()> {
        config.validate()?;
        let key = config_key(asset);
        self.configs
            .put(tenant, &key, VolatilityConfigRecord { config, version: 0 })?;
        tracing::info!(tenant_id = %tenant, key = %key, "volatility config override set");
        Ok(())
    }

    pub fn remove_config(&self, tenant: &TenantId, asset: Option<&AssetId>) -> RiskResult<bool> {
        Ok(self.configs.remove(tenant, &config_key(asset))?.is_some())
    }

    /// The tenant's override for `asset`, if any: asset first, then tenant-wide.
    pub fn override_config(
        &self,
        tenant: &TenantId,
        asset: &AssetId,
    ) -> RiskResult<Option<VolatilityConfig>> {
        if let Some(r) = self.configs.get(tenant, &config_key(Some(asset)))? {
            return Ok(Some(r.config));
        }
        Ok(self.configs.get(tenant, &config_key(None))?.map(|r| r.config))
    }

    /// Publish a new market-wide index value for `asset`.
    pub fn update_volatility_index(
        &self,
        asset: &AssetId,
        value: f64,
        index_type: IndexType,
        config: Option<&VolatilityConfig>,
    ) -> RiskResult<VolatilityState> {
        let cfg = match config {
            Some(c) => {
                c.validate()?;
                c.clone()
            }
            None => self.defaults.clone(),
        };
        if !value.is_finite() || value < 0.0 {
            return Err(RiskError::validation(format!(
                "volatility index for {} must be a non-negative finite number, got {}",
                asset, value
            )));
        }
        self.apply_reading(&TenantId::global(), asset, value, index_type, &cfg)
    }

    /// Current throttle for `tenant` trading `asset`. Also releases a held
    /// level whose cooldown has elapsed.
    pub fn check_throttle(&self, tenant: &TenantId, asset: &AssetId) -> RiskResult<ThrottleDecision> {
        let global = TenantId::global();
        let Some(market) = self.states.get(&global, asset.as_str())? else {
            return Ok(ThrottleDecision::unthrottled(asset));
        };

        let state = match self.override_config(tenant, asset)? {
            Some(cfg) => self.apply_reading(tenant, asset, market.current_index, market.index_type, &cfg)?,
            None if market.level != market.computed_level => self.apply_reading(
                &global,
                asset,
                market.current_index,
                market.index_type,
                &market.config,
            )?,
            None => market,
        };
        Ok(ThrottleDecision::from_state(&state))
    }

    /// Exits are always allowed; entries follow the throttle decision.
    pub fn is_trading_allowed(
        &self,
        tenant: &TenantId,
        asset: &AssetId,
        is_entry: bool,
    ) -> RiskResult<bool> {
        if !is_entry {
            return Ok(true);
        }
        Ok(self.check_throttle(tenant, asset)?.allow_new_entries)
    }

    /// Whether the market-wide level for `asset` is being held by a cooldown.
    pub fn is_in_cooldown(&self, asset: &AssetId) -> RiskResult<bool> {
        let global = TenantId::global();
        let cooldown = match self.states.get(&global, asset.as_str())? {
            Some(s) => s.config.cooldown(),
            None => return Ok(false),
        };
        self.cooldowns
            .is_in_cooldown(&global, asset.as_str(), cooldown, self.clock.now())
    }

    pub fn get_state(&self, asset: &AssetId) -> RiskResult<Option<VolatilityState>> {
        Ok(self.states.get(&TenantId::global(), asset.as_str())?)
    }

    /// Re-evaluate every held market-wide level so elapsed cooldowns are
    /// released without waiting for the next reading. Returns the assets
    /// whose level changed.
    pub fn refresh_cooldowns(&self) -> RiskResult<Vec<AssetId>> {
        let global = TenantId::global();
        let held = self
            .states
            .list_where(&global, &|s| s.level != s.computed_level)?;
        let mut released = Vec::new();
        for state in held {
            let updated = self.apply_reading(
                &global,
                &state.asset_id,
                state.current_index,
                state.index_type,
                &state.config,
            )?;
            if updated.level != state.level {
                released.push(state.asset_id);
            }
        }
        Ok(released)
    }

    /// Classify `value`, apply hysteresis and persist under `partition`.
    fn apply_reading(
        &self,
        partition: &TenantId,
        asset: &AssetId,
        value: f64,
        index_type: IndexType,
        cfg: &VolatilityConfig,
    ) -> RiskResult<VolatilityState> {
        let now = self.clock.now();
        let computed = cfg.levels()?.classify(value);
        self.states.insert_if_absent(
            partition,
            asset.as_str(),
            VolatilityState {
                state_id: format!("{}:{}", partition, asset),
                asset_id: asset.clone(),
                current_index: value,
                index_type,
                level: VolatilityLevel::Low,
                computed_level: VolatilityLevel::Low,
                throttle_percent: 0.0,
                allow_new_entries: true,
                in_cooldown: false,
                config: cfg.clone(),
                updated_at: now,
                version: 0,
            },
        )?;

        let (stored, previous) =
            update_versioned(self.states.as_ref(), partition, asset.as_str(), |s| {
                let previous = s.level;
                let (effective, in_cooldown) = if previous >= VolatilityLevel::High {
                    let r = self.cooldowns.resolve(
                        partition,
                        asset.as_str(),
                        previous,
                        computed,
                        cfg.cooldown(),
                        now,
                        true,
                    )?;
                    (r.effective, r.in_cooldown)
                } else {
                    self.cooldowns.cancel(partition, asset.as_str())?;
                    (computed, false)
                };
                s.current_index = value;
                s.index_type = index_type;
                s.level = effective;
                s.computed_level = computed;
                s.throttle_percent = get_throttle_percent(
                    effective,
                    cfg.high_throttle_percent,
                    cfg.extreme_throttle_percent,
                );
                s.allow_new_entries = allow_new_entries(effective);
                s.in_cooldown = in_cooldown;
                s.config = cfg.clone();
                s.updated_at = now;
                Ok::<_, RiskError>(Change::Write(previous))
            })?;

        if stored.level != previous {
            if stored.level == VolatilityLevel::Extreme {
                tracing::warn!(tenant_id = %partition, asset_id = %asset, index = value, "volatility EXTREME, new entries blocked");
            } else {
                tracing::info!(
                    tenant_id = %partition,
                    asset_id = %asset,
                    from = %previous,
                    to = %stored.level,
                    index = value,
                    "volatility level changed"
                );
            }
            dispatch_alert(
                self.alerts.as_ref(),
                Alert {
                    alert_type: AlertType::VolatilityLevelChanged,
                    tenant_id: partition.clone(),
                    entity_id: asset.to_string(),
                    new_state: stored.level.to_string(),
                    reason: Some(format!("index {} ({:?})", value, index_type)),
                    at: now,
                },
            );
        }
        Ok(stored)
    }
}

fn config_key(asset: Option<&AssetId>) -> String {
    match asset {
        Some(a) => format!("asset:{}", a),
        None => "tenant".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tg_core::alert::RecordingAlertSink;
    use tg_core::types::{minutes, ManualClock};

    fn make_config() -> VolatilityConfig {
        VolatilityConfig {
            normal_threshold: 20.0,
            high_threshold: 50.0,
            extreme_threshold: 80.0,
            high_throttle_percent: 50.0,
            extreme_throttle_percent: 100.0,
            cooldown_minutes: 30,
        }
    }

    fn make_service() -> (VolatilityService, Arc<ManualClock>, Arc<RecordingAlertSink>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let alerts = Arc::new(RecordingAlertSink::new());
        let svc = VolatilityService::in_memory(alerts.clone(), clock.clone(), make_config()).unwrap();
        (svc, clock, alerts)
    }

    fn btc() -> AssetId {
        AssetId::new("BTC-USD")
    }

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    #[test]
    fn test_determine_level_step_function() {
        let lvl = |v| determine_level(v, 20.0, 50.0, 80.0).unwrap();
        assert_eq!(lvl(0.0), VolatilityLevel::Low);
        assert_eq!(lvl(19.9), VolatilityLevel::Low);
        assert_eq!(lvl(20.0), VolatilityLevel::Normal);
        assert_eq!(lvl(49.9), VolatilityLevel::Normal);
        assert_eq!(lvl(50.0), VolatilityLevel::High);
        assert_eq!(lvl(80.0), VolatilityLevel::Extreme);
        assert_eq!(lvl(500.0), VolatilityLevel::Extreme);
    }

    #[test]
    fn test_determine_level_rejects_misordered_thresholds() {
        assert!(determine_level(10.0, 50.0, 20.0, 80.0).is_err());
    }

    #[test]
    fn test_throttle_zero_below_high_threshold() {
        let cfg = make_config();
        for v in [0.0, 10.0, 20.0, 35.0, 49.99] {
            let level = determine_level(v, 20.0, 50.0, 80.0).unwrap();
            let pct = get_throttle_percent(level, cfg.high_throttle_percent, cfg.extreme_throttle_percent);
            assert_eq!(pct, 0.0, "value {}", v);
            assert!(allow_new_entries(level));
        }
        for v in [50.0, 79.0, 80.0, 1000.0] {
            let level = determine_level(v, 20.0, 50.0, 80.0).unwrap();
            let pct = get_throttle_percent(level, cfg.high_throttle_percent, cfg.extreme_throttle_percent);
            assert!(pct > 0.0 && pct <= 100.0);
            assert_eq!(allow_new_entries(level), level != VolatilityLevel::Extreme);
        }
    }

    #[test]
    fn test_apply_throttle() {
        assert_eq!(apply_throttle(100.0, 0.0), 100.0);
        assert_eq!(apply_throttle(100.0, 50.0), 50.0);
        assert_eq!(apply_throttle(100.0, 100.0), 0.0);
        assert_eq!(apply_throttle(100.0, 150.0), 0.0);
        assert_eq!(apply_throttle(100.0, -20.0), 100.0);
        assert_eq!(apply_throttle(100.0, f64::NAN), 0.0);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = make_config();
        assert!(cfg.validate().is_ok());
        cfg.high_throttle_percent = 100.0;
        assert!(cfg.validate().is_err());
        let mut cfg = make_config();
        cfg.extreme_throttle_percent = 120.0;
        assert!(cfg.validate().is_err());
        let mut cfg = make_config();
        cfg.high_threshold = 90.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_asset_is_unthrottled() {
        let (svc, _, _) = make_service();
        let d = svc.check_throttle(&tenant(), &btc()).unwrap();
        assert!(d.allow_new_entries);
        assert_eq!(d.throttle_percent, 0.0);
        assert!(d.index.is_none());
    }

    #[test]
    fn test_normal_to_extreme_blocks_entries() {
        let (svc, _, alerts) = make_service();
        let s = svc.update_volatility_index(&btc(), 40.0, IndexType::RealizedVol, None).unwrap();
        assert_eq!(s.level, VolatilityLevel::Normal);
        assert!(svc.is_trading_allowed(&tenant(), &btc(), true).unwrap());

        let s = svc.update_volatility_index(&btc(), 85.0, IndexType::RealizedVol, None).unwrap();
        assert_eq!(s.level, VolatilityLevel::Extreme);
        assert!(!s.allow_new_entries);
        assert_eq!(s.throttle_percent, 100.0);
        assert!(!svc.is_trading_allowed(&tenant(), &btc(), true).unwrap());
        assert!(svc.is_trading_allowed(&tenant(), &btc(), false).unwrap());
        assert_eq!(apply_throttle(100.0, s.throttle_percent), 0.0);
        assert_eq!(alerts.alerts_of(AlertType::VolatilityLevelChanged).len(), 2);
    }

    #[test]
    fn test_deescalation_held_during_cooldown() {
        let (svc, clock, _) = make_service();
        svc.update_volatility_index(&btc(), 85.0, IndexType::RealizedVol, None).unwrap();

        let s = svc.update_volatility_index(&btc(), 30.0, IndexType::RealizedVol, None).unwrap();
        assert_eq!(s.computed_level, VolatilityLevel::Normal);
        assert_eq!(s.level, VolatilityLevel::Extreme);
        assert!(!s.allow_new_entries);
        assert!(svc.is_in_cooldown(&btc()).unwrap());

        clock.advance(minutes(29));
        let d = svc.check_throttle(&tenant(), &btc()).unwrap();
        assert_eq!(d.level, VolatilityLevel::Extreme);
        assert!(svc.is_in_cooldown(&btc()).unwrap());

        clock.advance(minutes(1));
        let d = svc.check_throttle(&tenant(), &btc()).unwrap();
        assert_eq!(d.level, VolatilityLevel::Normal);
        assert_eq!(d.throttle_percent, 0.0);
        assert!(d.allow_new_entries);
        assert!(!svc.is_in_cooldown(&btc()).unwrap());
    }

    #[test]
    fn test_reescalation_cancels_cooldown() {
        let (svc, clock, _) = make_service();
        svc.update_volatility_index(&btc(), 60.0, IndexType::StdDev, None).unwrap();
        svc.update_volatility_index(&btc(), 10.0, IndexType::StdDev, None).unwrap();
        assert!(svc.is_in_cooldown(&btc()).unwrap());

        clock.advance(minutes(5));
        let s = svc.update_volatility_index(&btc(), 90.0, IndexType::StdDev, None).unwrap();
        assert_eq!(s.level, VolatilityLevel::Extreme);
        assert!(!svc.is_in_cooldown(&btc()).unwrap());
    }

    #[test]
    fn test_no_cooldown_below_high() {
        let (svc, _, _) = make_service();
        svc.update_volatility_index(&btc(), 40.0, IndexType::Atr, None).unwrap();
        let s = svc.update_volatility_index(&btc(), 5.0, IndexType::Atr, None).unwrap();
        assert_eq!(s.level, VolatilityLevel::Low);
        assert!(!svc.is_in_cooldown(&btc()).unwrap());
    }

    #[test]
    fn test_refresh_cooldowns_releases_elapsed() {
        let (svc, clock, _) = make_service();
        svc.update_volatility_index(&btc(), 60.0, IndexType::StdDev, None).unwrap();
        svc.update_volatility_index(&btc(), 10.0, IndexType::StdDev, None).unwrap();
        assert!(svc.refresh_cooldowns().unwrap().is_empty());

        clock.advance(minutes(30));
        assert_eq!(svc.refresh_cooldowns().unwrap(), vec![btc()]);
        assert_eq!(svc.get_state(&btc()).unwrap().unwrap().level, VolatilityLevel::Low);
    }

    #[test]
    fn test_tenant_override_changes_view() {
        let (svc, _, _) = make_service();
        svc.update_volatility_index(&btc(), 60.0, IndexType::StdDev, None).unwrap();

        let strict = VolatilityConfig {
            normal_threshold: 10.0,
            high_threshold: 30.0,
            extreme_threshold: 55.0,
            ..make_config()
        };
        svc.set_config(&tenant(), Some(&btc()), strict).unwrap();

        let d = svc.check_throttle(&tenant(), &btc()).unwrap();
        assert_eq!(d.level, VolatilityLevel::Extreme);
        assert!(!d.allow_new_entries);

        let other = svc.check_throttle(&TenantId::new("other"), &btc()).unwrap();
        assert_eq!(other.level, VolatilityLevel::High);
        assert_eq!(other.throttle_percent, 50.0);
    }

    #[test]
    fn test_asset_override_beats_tenant_override() {
        let (svc, _, _) = make_service();
        let tenant_cfg = VolatilityConfig {
            cooldown_minutes: 5,
            ..make_config()
        };
        let asset_cfg = VolatilityConfig {
            cooldown_minutes: 99,
            ..make_config()
        };
        svc.set_config(&tenant(), None, tenant_cfg).unwrap();
        svc.set_config(&tenant(), Some(&btc()), asset_cfg).unwrap();
        let cfg = svc.override_config(&tenant(), &btc()).unwrap().unwrap();
        assert_eq!(cfg.cooldown_minutes, 99);
        let cfg = svc
            .override_config(&tenant(), &AssetId::new("ETH-USD"))
            .unwrap()
            .unwrap();
        assert_eq!(cfg.cooldown_minutes, 5);
    }

    #[test]
    fn test_rejects_invalid_index() {
        let (svc, _, _) = make_service();
        assert!(svc
            .update_volatility_index(&btc(), f64::NAN, IndexType::Atr, None)
            .is_err());
        assert!(svc
            .update_volatility_index(&btc(), -1.0, IndexType::Atr, None)
            .is_err());
    }

    #[test]
    fn test_supplied_config_is_used_and_kept() {
        let (svc, _, _) = make_service();
        let loose = VolatilityConfig {
            normal_threshold: 100.0,
            high_threshold: 200.0,
            extreme_threshold: 300.0,
            ..make_config()
        };
        let s = svc
            .update_volatility_index(&btc(), 85.0, IndexType::Atr, Some(&loose))
            .unwrap();
        assert_eq!(s.level, VolatilityLevel::Low);
        assert_eq!(s.config, loose);
    }
}
