//! Layered configuration for the trade-guard risk core.
//!
//! Configuration is loaded in layers with increasing priority:
//! 1. Compiled-in defaults (conservative thresholds, auth required)
//! 2. TOML configuration file (if provided)
//! 3. Environment variable overrides (prefix `TG_`, nested with `__`)
//! 4. `TG_OPERATOR_TOKEN` for the operator authentication token
//!
//! The operator token **must** come from the environment, never from a
//! configuration file, so credentials are not checked in by accident.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

// ── Default value functions ────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Auto-reset sweep: every 30 s.
fn default_auto_reset_interval_ms() -> u64 {
    30_000
}

/// Idempotency/backfill pruning sweep: every 60 s.
fn default_prune_interval_ms() -> u64 {
    60_000
}

/// Backfills with no progress for an hour are failed.
fn default_backfill_stale_after_secs() -> i64 {
    3_600
}

fn default_breaker_cooldown_minutes() -> u32 {
    15
}

fn default_true() -> bool {
    true
}

/// Idempotency records live for 24 h.
fn default_idempotency_ttl_secs() -> i64 {
    86_400
}

fn default_exchange_timeout_ms() -> u64 {
    5_000
}

fn default_max_submit_attempts() -> u32 {
    3
}

fn default_rate_window_ms() -> u64 {
    60_000
}

fn default_rate_max_requests() -> usize {
    60
}

fn default_alert_channel_capacity() -> usize {
    1_024
}

// ── Configuration structs ──────────────────────────────────────────────

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Operator HTTP API.
    pub server: ServerConfig,
    /// Background sweep cadence.
    pub sweeps: SweepConfig,
    /// Circuit breaker defaults.
    pub circuit_breaker: CircuitBreakerDefaults,
    /// Default volatility thresholds.
    pub volatility: VolatilityDefaults,
    /// Default drawdown thresholds.
    pub drawdown: DrawdownDefaults,
    /// Kill switch behaviour and automatic triggers.
    pub kill_switch: KillSwitchDefaults,
    /// Duplicate order prevention.
    pub duplicate: DuplicateConfig,
    /// Exchange / backfill request rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Alert channel sizing.
    #[serde(default)]
    pub alerts: AlertConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Periodic sweep intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// How often `processAutoReset` runs for every tenant.
    #[serde(default = "default_auto_reset_interval_ms")]
    pub auto_reset_interval_ms: u64,
    /// How often expired idempotency records are pruned.
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
    /// PENDING/RUNNING backfills untouched this long are failed by the
    /// prune sweep.
    #[serde(default = "default_backfill_stale_after_secs")]
    pub backfill_stale_after_secs: i64,
}

/// Defaults applied to newly created circuit breakers.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerDefaults {
    #[serde(default = "default_breaker_cooldown_minutes")]
    pub cooldown_minutes: u32,
    #[serde(default = "default_true")]
    pub auto_reset_enabled: bool,
}

/// Default volatility thresholds (index units) and throttle percentages.
#[derive(Debug, Clone, Deserialize)]
pub struct VolatilityDefaults {
    pub normal_threshold: f64,
    pub high_threshold: f64,
    pub extreme_threshold: f64,
    pub high_throttle_percent: f64,
    pub extreme_throttle_percent: f64,
    pub cooldown_minutes: u32,
}

/// Period after which a drawdown peak is rebased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetInterval {
    Daily,
    Weekly,
    Monthly,
    /// Only an operator can reset.
    Manual,
}

/// Default drawdown thresholds (percent of peak).
#[derive(Debug, Clone, Deserialize)]
pub struct DrawdownDefaults {
    pub warning_threshold_percent: f64,
    pub max_threshold_percent: f64,
    pub reset_interval: ResetInterval,
    #[serde(default = "default_true")]
    pub auto_resume_enabled: bool,
    pub cooldown_minutes: u32,
    #[serde(default = "default_true")]
    pub pause_on_critical: bool,
}

/// Kill switch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KillSwitchDefaults {
    #[serde(default = "default_true")]
    pub require_auth_for_deactivation: bool,
    /// Loss percent within the evaluation window that activates the switch.
    pub rapid_loss_threshold_percent: f64,
    #[serde(default = "default_true")]
    pub rapid_loss_enabled: bool,
    /// Error rate (0..=1) that activates the switch.
    pub error_rate_threshold: f64,
    #[serde(default = "default_true")]
    pub error_rate_enabled: bool,
    #[serde(default = "default_true")]
    pub system_error_enabled: bool,
    /// Operator token — loaded from `TG_OPERATOR_TOKEN`.
    #[serde(default)]
    pub operator_token: String,
}

/// Duplicate order prevention settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DuplicateConfig {
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: i64,
    /// Upper bound on any single exchange round-trip.
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,
}

/// Sliding-window rate limit per request source.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: usize,
}

/// Alert delivery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_alert_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_alert_channel_capacity(),
        }
    }
}

impl AppConfig {
    /// Load configuration using layered sources.
    ///
    /// 1. Compiled-in defaults.
    /// 2. TOML file at `config_path` (if `Some`).
    /// 3. Environment variable overrides with prefix `TG_` and `__` as the
    ///    nesting separator (e.g., `TG_DRAWDOWN__MAX_THRESHOLD_PERCENT=12`).
    /// 4. Operator token from `TG_OPERATOR_TOKEN`.
    ///
    /// The result is validated before it is returned.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder()
            // ── Layer 1: compiled-in defaults ───────────────────────
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080i64)?
            .set_default("sweeps.auto_reset_interval_ms", 30_000i64)?
            .set_default("sweeps.prune_interval_ms", 60_000i64)?
            .set_default("sweeps.backfill_stale_after_secs", 3_600i64)?
            .set_default("circuit_breaker.cooldown_minutes", 15i64)?
            .set_default("circuit_breaker.auto_reset_enabled", true)?
            // Volatility (index units; ATR-percent by default)
            .set_default("volatility.normal_threshold", 20.0)?
            .set_default("volatility.high_threshold", 50.0)?
            .set_default("volatility.extreme_threshold", 80.0)?
            .set_default("volatility.high_throttle_percent", 50.0)?
            .set_default("volatility.extreme_throttle_percent", 100.0)?
            .set_default("volatility.cooldown_minutes", 30i64)?
            // Drawdown
            .set_default("drawdown.warning_threshold_percent", 5.0)?
            .set_default("drawdown.max_threshold_percent", 10.0)?
            .set_default("drawdown.reset_interval", "daily")?
            .set_default("drawdown.auto_resume_enabled", true)?
            .set_default("drawdown.cooldown_minutes", 60i64)?
            .set_default("drawdown.pause_on_critical", true)?
            // Kill switch
            .set_default("kill_switch.require_auth_for_deactivation", true)?
            .set_default("kill_switch.rapid_loss_threshold_percent", 5.0)?
            .set_default("kill_switch.rapid_loss_enabled", true)?
            .set_default("kill_switch.error_rate_threshold", 0.5)?
            .set_default("kill_switch.error_rate_enabled", true)?
            .set_default("kill_switch.system_error_enabled", true)?
            .set_default("kill_switch.operator_token", "")?
            // Duplicate order prevention
            .set_default("duplicate.idempotency_ttl_secs", 86_400i64)?
            .set_default("duplicate.exchange_timeout_ms", 5_000i64)?
            .set_default("duplicate.max_submit_attempts", 3i64)?
            // Rate limiting
            .set_default("rate_limit.window_ms", 60_000i64)?
            .set_default("rate_limit.max_requests", 60i64)?;

        // ── Layer 2: TOML file ─────────────────────────────────────
        if let Some(path) = config_path {
            let path_str = path.to_str().context("config path is not valid UTF-8")?;
            builder = builder.add_source(File::with_name(path_str).required(true));
        }

        // ── Layer 3: env var overrides (TG_ prefix) ────────────────
        // The prefix separator is set to `_` explicitly; otherwise the
        // `config` crate reuses the `__` nesting separator for the prefix.
        builder = builder.add_source(
            Environment::with_prefix("TG")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: AppConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        // ── Layer 4: dedicated secret env var ──────────────────────
        if let Ok(v) = std::env::var("TG_OPERATOR_TOKEN") {
            cfg.kill_switch.operator_token = v;
        }

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        let v = &self.volatility;
        if !(v.normal_threshold < v.high_threshold && v.high_threshold < v.extreme_threshold) {
            bail!(
                "volatility thresholds must satisfy normal < high < extreme (got {} / {} / {})",
                v.normal_threshold,
                v.high_threshold,
                v.extreme_threshold
            );
        }
        if !(0.0..=100.0).contains(&v.high_throttle_percent)
            || !(0.0..=100.0).contains(&v.extreme_throttle_percent)
            || v.high_throttle_percent >= v.extreme_throttle_percent
        {
            bail!("volatility throttle percents must satisfy 0 <= high < extreme <= 100");
        }

        let d = &self.drawdown;
        if !(d.warning_threshold_percent > 0.0
            && d.warning_threshold_percent < d.max_threshold_percent
            && d.max_threshold_percent <= 100.0)
        {
            bail!(
                "drawdown thresholds must satisfy 0 < warning < max <= 100 (got {} / {})",
                d.warning_threshold_percent,
                d.max_threshold_percent
            );
        }

        let k = &self.kill_switch;
        if !(0.0..=1.0).contains(&k.error_rate_threshold) {
            bail!("kill_switch.error_rate_threshold must be within [0, 1]");
        }
        if k.require_auth_for_deactivation && k.operator_token.is_empty() {
            tracing::warn!("kill switch requires auth but no operator token is configured; deactivation will be refused");
        }

        if self.duplicate.max_submit_attempts == 0 {
            bail!("duplicate.max_submit_attempts must be at least 1");
        }
        if self.rate_limit.max_requests == 0 {
            bail!("rate_limit.max_requests must be at least 1");
        }
        if self.sweeps.backfill_stale_after_secs <= 0 {
            bail!("sweeps.backfill_stale_after_secs must be positive");
        }
        Ok(())
    }
}
