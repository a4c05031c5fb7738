//! Per-breaker event history.
//!
//! History is not cosmetic: the trailing run of `Failure` events is the
//! consecutive-failure count used when the caller's context carries none.
//! Resetting or closing a breaker clears it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tg_core::store::Versioned;
use tg_core::types::BreakerId;

/// Events kept per breaker; older ones are dropped first.
pub const MAX_HISTORY_EVENTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerEventKind {
    Tripped,
    HalfOpened,
    Closed,
    Reset,
    Failure,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub kind: BreakerEventKind,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub at: DateTime<Utc>,
}

/// All retained events of one breaker, stored as a single versioned record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerHistory {
    pub breaker_id: BreakerId,
    pub events: Vec<BreakerEvent>,
    pub version: u64,
}

impl Versioned for BreakerHistory {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl BreakerHistory {
    pub fn new(breaker_id: BreakerId) -> Self {
        Self {
            breaker_id,
            events: Vec::new(),
            version: 0,
        }
    }

    pub fn push(&mut self, event: BreakerEvent) {
        self.events.push(event);
        if self.events.len() > MAX_HISTORY_EVENTS {
            let excess = self.events.len() - MAX_HISTORY_EVENTS;
            self.events.drain(..excess);
        }
    }

    /// Number of `Failure` events since the last `Success`, `Reset` or `Closed`.
    pub fn failure_streak(&self) -> u32 {
        let mut streak = 0u32;
        for event in self.events.iter().rev() {
            match event.kind {
                BreakerEventKind::Failure => streak = streak.saturating_add(1),
                BreakerEventKind::Success | BreakerEventKind::Reset | BreakerEventKind::Closed => {
                    break
                }
                BreakerEventKind::Tripped | BreakerEventKind::HalfOpened => {}
            }
        }
        streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(kind: BreakerEventKind) -> BreakerEvent {
        BreakerEvent {
            kind,
            value: None,
            threshold: None,
            at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_failure_streak_counts_trailing_failures() {
        let mut h = BreakerHistory::new(BreakerId::new("cb-1"));
        h.push(event(BreakerEventKind::Failure));
        h.push(event(BreakerEventKind::Success));
        h.push(event(BreakerEventKind::Failure));
        h.push(event(BreakerEventKind::Tripped));
        h.push(event(BreakerEventKind::Failure));
        assert_eq!(h.failure_streak(), 2);
    }

    #[test]
    fn test_failure_streak_stops_at_reset() {
        let mut h = BreakerHistory::new(BreakerId::new("cb-1"));
        h.push(event(BreakerEventKind::Failure));
        h.push(event(BreakerEventKind::Reset));
        assert_eq!(h.failure_streak(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut h = BreakerHistory::new(BreakerId::new("cb-1"));
        for _ in 0..MAX_HISTORY_EVENTS + 10 {
            h.push(event(BreakerEventKind::Failure));
        }
        assert_eq!(h.events.len(), MAX_HISTORY_EVENTS);
    }
}
