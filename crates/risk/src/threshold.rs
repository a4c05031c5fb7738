//! Leveled thresholds with cooldown-gated de-escalation.
//!
//! Volatility throttling and drawdown tracking share the same shape: a metric
//! is classified into an ordered set of levels by a step function, escalation
//! takes effect immediately, and de-escalation is held at the previous (more
//! severe) level until a cooldown has elapsed since the de-escalation began.
//! Re-escalating to the held level or above cancels the pending cooldown.
//!
//! [`LeveledThreshold`] is the step function; [`CooldownTracker`] stores the
//! pending de-escalations and applies the hysteresis in
//! [`CooldownTracker::resolve`]. Cooldown entries live behind a
//! [`Repository`] so they can be rebuilt or shared like any other state.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tg_core::store::{InMemoryRepository, Repository, Versioned};
use tg_core::types::TenantId;

use crate::error::{RiskError, RiskResult};

/// An ordered severity level.
pub trait Level: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    /// Numeric rank; higher is more severe.
    fn rank(self) -> u8;
}

/// Step function mapping a metric value onto ordered levels.
///
/// With steps `[(t1, L1), (t2, L2), ...]` and base `L0`, a value `v` maps to
/// `L0` when `v < t1`, to `L1` when `t1 <= v < t2`, and so on. Boundaries
/// belong to the upper (more severe) level. Non-finite values map to the most
/// severe level.
#[derive(Debug, Clone)]
pub struct LeveledThreshold<L: Level> {
    base: L,
    steps: Vec<(f64, L)>,
}

impl<L: Level> LeveledThreshold<L> {
    /// Build a step function. Thresholds must be finite and strictly
    /// increasing, and levels strictly increasing in severity.
    pub fn new(base: L, steps: Vec<(f64, L)>) -> RiskResult<Self> {
        let mut prev_level = base;
        let mut prev_threshold = f64::NEG_INFINITY;
        for &(threshold, level) in &steps {
            if !threshold.is_finite() {
                return Err(RiskError::validation(format!(
                    "threshold for {:?} must be finite",
                    level
                )));
            }
            if threshold <= prev_threshold {
                return Err(RiskError::validation(format!(
                    "thresholds must be strictly increasing ({} after {})",
                    threshold, prev_threshold
                )));
            }
            if level <= prev_level {
                return Err(RiskError::validation(format!(
                    "levels must be strictly increasing ({:?} after {:?})",
                    level, prev_level
                )));
            }
            prev_threshold = threshold;
            prev_level = level;
        }
        Ok(Self { base, steps })
    }

    /// Classify `value`.
    pub fn classify(&self, value: f64) -> L {
        if value.is_nan() {
            return self.most_severe();
        }
        self.steps
            .iter()
            .rev()
            .find(|(threshold, _)| value >= *threshold)
            .map(|&(_, level)| level)
            .unwrap_or(self.base)
    }

    fn most_severe(&self) -> L {
        self.steps.last().map(|&(_, l)| l).unwrap_or(self.base)
    }
}

/// A de-escalation waiting for its cooldown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub key: String,
    /// Rank of the level being held while cooling down.
    pub held_rank: u8,
    pub started_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for CooldownEntry {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Outcome of applying hysteresis to a freshly computed level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<L> {
    /// Level whose settings apply right now.
    pub effective: L,
    /// Level the metric alone would produce.
    pub computed: L,
    /// A de-escalation is pending and its cooldown has not elapsed.
    pub in_cooldown: bool,
    /// This call released a held level.
    pub released: bool,
}

/// Tracks pending de-escalations keyed by `(tenant, entity key)`.
pub struct CooldownTracker {
    entries: Arc<dyn Repository<CooldownEntry>>,
}

impl CooldownTracker {
    pub fn new(entries: Arc<dyn Repository<CooldownEntry>>) -> Self {
        Self { entries }
    }

    /// Tracker backed by a fresh in-process repository.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRepository::new()))
    }

    /// Start a cooldown holding `held_rank`, unless one is already running.
    /// Returns the running entry.
    pub fn begin(
        &self,
        tenant: &TenantId,
        key: &str,
        held_rank: u8,
        now: DateTime<Utc>,
    ) -> RiskResult<CooldownEntry> {
        let entry = CooldownEntry {
            key: key.to_string(),
            held_rank,
            started_at: now,
            version: 0,
        };
        match self.entries.insert_if_absent(tenant, key, entry.clone())? {
            Some(existing) => Ok(existing),
            None => Ok(entry),
        }
    }

    /// Cancel a pending cooldown. Returns `true` if one was running.
    pub fn cancel(&self, tenant: &TenantId, key: &str) -> RiskResult<bool> {
        Ok(self.entries.remove(tenant, key)?.is_some())
    }

    /// The pending cooldown for `key`, if any.
    pub fn entry(&self, tenant: &TenantId, key: &str) -> RiskResult<Option<CooldownEntry>> {
        Ok(self.entries.get(tenant, key)?)
    }

    /// `true` while a de-escalation is pending and `cooldown` has not elapsed.
    pub fn is_in_cooldown(
        &self,
        tenant: &TenantId,
        key: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> RiskResult<bool> {
        Ok(self
            .entry(tenant, key)?
            .map(|e| now - e.started_at < cooldown)
            .unwrap_or(false))
    }

    /// Apply hysteresis to a freshly computed level.
    ///
    /// - `computed >= held`: escalation or steady state. Any pending cooldown
    ///   is cancelled and `computed` applies.
    /// - `computed < held`: de-escalation. A cooldown starts (or continues);
    ///   `held` applies until `cooldown` has elapsed **and** `release_gate`
    ///   is open, then `computed` applies.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve<L: Level>(
        &self,
        tenant: &TenantId,
        key: &str,
        held: L,
        computed: L,
        cooldown: Duration,
        now: DateTime<Utc>,
        release_gate: bool,
    ) -> RiskResult<Resolution<L>> {
        if computed >= held {
            self.cancel(tenant, key)?;
            return Ok(Resolution {
                effective: computed,
                computed,
                in_cooldown: false,
                released: false,
            });
        }

        let entry = self.begin(tenant, key, held.rank(), now)?;
        let elapsed = now - entry.started_at;
        if elapsed >= cooldown && release_gate {
            self.cancel(tenant, key)?;
            return Ok(Resolution {
                effective: computed,
                computed,
                in_cooldown: false,
                released: true,
            });
        }

        Ok(Resolution {
            effective: held,
            computed,
            in_cooldown: elapsed < cooldown,
            released: false,
        })
    }
}
