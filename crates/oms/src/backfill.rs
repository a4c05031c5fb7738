//! Historical data backfill requests.
//!
//! At most one PENDING/RUNNING backfill may exist per (tenant, asset,
//! source). The slot is taken atomically on submit and released on any
//! terminal transition. Submissions are rate-limited per source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tg_core::store::{update_versioned, Change, InMemoryRepository, Repository, StoreError, Versioned};
use tg_core::types::{AssetId, Clock, TenantId};

use crate::error::{OmsError, OmsResult};
use crate::rate_limit::SlidingWindowLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackfillStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub request_id: String,
    pub tenant_id: TenantId,
    pub asset_id: AssetId,
    pub source: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: BackfillStatus,
    pub records_fetched: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for BackfillRequest {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Marks the (asset, source) pair as busy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillSlot {
    pub request_id: String,
    pub version: u64,
}

impl Versioned for BackfillSlot {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBackfill {
    pub asset_id: AssetId,
    pub source: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub struct BackfillTracker {
    requests: Arc<dyn Repository<BackfillRequest>>,
    slots: Arc<dyn Repository<BackfillSlot>>,
    limiter: Arc<SlidingWindowLimiter>,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
}

fn slot_key(asset: &AssetId, source: &str) -> String {
    format!("{}|{}", asset, source)
}

impl BackfillTracker {
    pub fn new(
        requests: Arc<dyn Repository<BackfillRequest>>,
        slots: Arc<dyn Repository<BackfillSlot>>,
        limiter: Arc<SlidingWindowLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            requests,
            slots,
            limiter,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    pub fn in_memory(limiter: Arc<SlidingWindowLimiter>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
            limiter,
            clock,
        )
    }

    pub fn submit(&self, tenant: &TenantId, req: NewBackfill) -> OmsResult<BackfillRequest> {
        let now = self.clock.now();
        if req.source.trim().is_empty() {
            return Err(OmsError::InvalidBackfillRequest("source must not be blank".into()));
        }
        if req.start >= req.end {
            return Err(OmsError::InvalidBackfillRequest(format!(
                "start {} must be before end {}",
                req.start, req.end
            )));
        }
        if req.end > now {
            return Err(OmsError::InvalidBackfillRequest(format!(
                "end {} is in the future",
                req.end
            )));
        }

        let request_id = format!(
            "bf-{}-{}",
            now.timestamp_millis(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        );
        let key = slot_key(&req.asset_id, &req.source);
        let slot = BackfillSlot {
            request_id: request_id.clone(),
            version: 0,
        };
        if let Some(held) = self.slots.insert_if_absent(tenant, &key, slot)? {
            return Err(OmsError::BackfillAlreadyInProgress {
                request_id: held.request_id,
                asset_id: req.asset_id.to_string(),
                source_name: req.source,
            });
        }
        if let Err(e) = self.limiter.try_acquire(&req.source) {
            self.slots.remove(tenant, &key)?;
            return Err(e);
        }

        let request = BackfillRequest {
            request_id: request_id.clone(),
            tenant_id: tenant.clone(),
            asset_id: req.asset_id,
            source: req.source,
            start: req.start,
            end: req.end,
            status: BackfillStatus::Pending,
            records_fetched: 0,
            error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let stored = self.requests.put(tenant, &request_id, request)?;
        tracing::info!(
            tenant_id = %tenant,
            request_id = %stored.request_id,
            asset_id = %stored.asset_id,
            source = %stored.source,
            "backfill submitted"
        );
        Ok(stored)
    }

    pub fn get(&self, tenant: &TenantId, request_id: &str) -> OmsResult<BackfillRequest> {
        self.requests
            .get(tenant, request_id)?
            .ok_or_else(|| OmsError::NotFound {
                entity: "backfill request",
                id: request_id.to_string(),
            })
    }

    pub fn list(&self, tenant: &TenantId) -> OmsResult<Vec<BackfillRequest>> {
        let mut all = self.requests.list(tenant)?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.request_id.cmp(&b.request_id)));
        Ok(all)
    }

    /// PENDING -> RUNNING.
    pub fn start(&self, tenant: &TenantId, request_id: &str) -> OmsResult<BackfillRequest> {
        self.transition(tenant, request_id, |r| match r.status {
            BackfillStatus::Pending => {
                r.status = BackfillStatus::Running;
                Ok(())
            }
            other => Err(OmsError::Validation(format!(
                "backfill {} cannot start from {:?}",
                r.request_id, other
            ))),
        })
    }

    /// RUNNING -> COMPLETED.
    pub fn complete(&self, tenant: &TenantId, request_id: &str, records_fetched: u64) -> OmsResult<BackfillRequest> {
        self.transition(tenant, request_id, |r| match r.status {
            BackfillStatus::Running => {
                r.status = BackfillStatus::Completed;
                r.records_fetched = records_fetched;
                Ok(())
            }
            other => Err(OmsError::Validation(format!(
                "backfill {} cannot complete from {:?}",
                r.request_id, other
            ))),
        })
    }

    /// PENDING/RUNNING -> FAILED.
    pub fn fail(&self, tenant: &TenantId, request_id: &str, error: &str) -> OmsResult<BackfillRequest> {
        self.transition(tenant, request_id, |r| {
            if r.status.is_terminal() {
                return Err(OmsError::Validation(format!(
                    "backfill {} already {:?}",
                    r.request_id, r.status
                )));
            }
            r.status = BackfillStatus::Failed;
            r.error = Some(error.to_string());
            Ok(())
        })
    }

    /// PENDING/RUNNING -> CANCELLED. Terminal requests cannot be cancelled.
    pub fn cancel(&self, tenant: &TenantId, request_id: &str) -> OmsResult<BackfillRequest> {
        self.transition(tenant, request_id, |r| {
            if r.status.is_terminal() {
                return Err(OmsError::BackfillCannotBeCancelled {
                    request_id: r.request_id.clone(),
                    status: format!("{:?}", r.status),
                });
            }
            r.status = BackfillStatus::Cancelled;
            Ok(())
        })
    }

    /// Fail every PENDING/RUNNING request of `tenant` not updated within
    /// `stale_after`, freeing its slot.
    pub fn fail_stale(&self, tenant: &TenantId, stale_after: Duration) -> OmsResult<Vec<BackfillRequest>> {
        let cutoff = self.clock.now() - stale_after;
        let stale = self
            .requests
            .list_where(tenant, &|r| !r.status.is_terminal() && r.updated_at <= cutoff)?;
        let mut failed = Vec::with_capacity(stale.len());
        for r in stale {
            let reason = format!("no progress since {}", r.updated_at);
            match self.fail(tenant, &r.request_id, &reason) {
                Ok(stored) => failed.push(stored),
                // Finished between the scan and the update.
                Err(OmsError::Validation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if !failed.is_empty() {
            tracing::warn!(tenant_id = %tenant, count = failed.len(), "stale backfills failed");
        }
        Ok(failed)
    }

    pub fn tenants(&self) -> OmsResult<Vec<TenantId>> {
        Ok(self.requests.tenants()?)
    }

    fn transition(
        &self,
        tenant: &TenantId,
        request_id: &str,
        mut apply: impl FnMut(&mut BackfillRequest) -> OmsResult<()>,
    ) -> OmsResult<BackfillRequest> {
        let now = self.clock.now();
        let (stored, ()) = update_versioned(self.requests.as_ref(), tenant, request_id, |r| {
            apply(r)?;
            r.updated_at = now;
            Ok(Change::Write(()))
        })
        .map_err(|e| match e {
            OmsError::Store(StoreError::NotFound(id)) => OmsError::NotFound {
                entity: "backfill request",
                id,
            },
            other => other,
        })?;

        if stored.status.is_terminal() {
            self.release_slot(tenant, &stored)?;
        }
        tracing::info!(
            tenant_id = %tenant,
            request_id,
            status = ?stored.status,
            "backfill status changed"
        );
        Ok(stored)
    }

    fn release_slot(&self, tenant: &TenantId, req: &BackfillRequest) -> OmsResult<()> {
        let key = slot_key(&req.asset_id, &req.source);
        if let Some(slot) = self.slots.get(tenant, &key)? {
            // Only the owner frees the slot.
            if slot.request_id == req.request_id {
                self.slots.remove(tenant, &key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tg_core::types::ManualClock;

    fn make_tracker(max_requests: usize) -> BackfillTracker {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        BackfillTracker::in_memory(
            Arc::new(SlidingWindowLimiter::new(std::time::Duration::from_secs(60), max_requests)),
            clock,
        )
    }

    fn make_req(asset: &str, source: &str) -> NewBackfill {
        let end = Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap();
        NewBackfill {
            asset_id: AssetId::new(asset),
            source: source.to_string(),
            start: end - Duration::days(7),
            end,
        }
    }

    #[test]
    fn test_submit_and_lifecycle() {
        let tracker = make_tracker(10);
        let tenant = TenantId::new("acme");
        let r = tracker.submit(&tenant, make_req("BTC-USD", "binance")).unwrap();
        assert_eq!(r.status, BackfillStatus::Pending);

        tracker.start(&tenant, &r.request_id).unwrap();
        let done = tracker.complete(&tenant, &r.request_id, 10_080).unwrap();
        assert_eq!(done.status, BackfillStatus::Completed);
        assert_eq!(done.records_fetched, 10_080);

        // Slot released: the same pair can be backfilled again.
        assert!(tracker.submit(&tenant, make_req("BTC-USD", "binance")).is_ok());
        assert_eq!(tracker.list(&tenant).unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_ranges() {
        let tracker = make_tracker(10);
        let tenant = TenantId::new("acme");
        let mut inverted = make_req("BTC-USD", "binance");
        std::mem::swap(&mut inverted.start, &mut inverted.end);
        assert!(matches!(
            tracker.submit(&tenant, inverted),
            Err(OmsError::InvalidBackfillRequest(_))
        ));

        let mut future = make_req("BTC-USD", "binance");
        future.end = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            tracker.submit(&tenant, future),
            Err(OmsError::InvalidBackfillRequest(_))
        ));

        assert!(matches!(
            tracker.submit(&tenant, make_req("BTC-USD", " ")),
            Err(OmsError::InvalidBackfillRequest(_))
        ));
    }

    #[test]
    fn test_concurrent_same_pair_rejected() {
        let tracker = make_tracker(10);
        let tenant = TenantId::new("acme");
        let first = tracker.submit(&tenant, make_req("BTC-USD", "binance")).unwrap();
        match tracker.submit(&tenant, make_req("BTC-USD", "binance")) {
            Err(OmsError::BackfillAlreadyInProgress { request_id, .. }) => {
                assert_eq!(request_id, first.request_id)
            }
            other => panic!("expected in-progress error, got {:?}", other),
        }
        // Other asset, other source, other tenant are independent.
        assert!(tracker.submit(&tenant, make_req("ETH-USD", "binance")).is_ok());
        assert!(tracker.submit(&tenant, make_req("BTC-USD", "bybit")).is_ok());
        assert!(tracker
            .submit(&TenantId::new("other"), make_req("BTC-USD", "binance"))
            .is_ok());
    }

    #[test]
    fn test_cancel_rules() {
        let tracker = make_tracker(10);
        let tenant = TenantId::new("acme");
        let r = tracker.submit(&tenant, make_req("BTC-USD", "binance")).unwrap();
        tracker.start(&tenant, &r.request_id).unwrap();
        let cancelled = tracker.cancel(&tenant, &r.request_id).unwrap();
        assert_eq!(cancelled.status, BackfillStatus::Cancelled);

        let err = tracker.cancel(&tenant, &r.request_id).unwrap_err();
        assert!(matches!(err, OmsError::BackfillCannotBeCancelled { .. }));
        assert_eq!(err.code(), "backfill_cannot_be_cancelled");

        let r2 = tracker.submit(&tenant, make_req("BTC-USD", "binance")).unwrap();
        tracker.fail(&tenant, &r2.request_id, "source returned 503").unwrap();
        assert!(tracker.cancel(&tenant, &r2.request_id).is_err());
    }

    #[test]
    fn test_invalid_transitions() {
        let tracker = make_tracker(10);
        let tenant = TenantId::new("acme");
        let r = tracker.submit(&tenant, make_req("BTC-USD", "binance")).unwrap();
        assert!(matches!(
            tracker.complete(&tenant, &r.request_id, 1),
            Err(OmsError::Validation(_))
        ));
        assert!(matches!(
            tracker.start(&tenant, "bf-missing"),
            Err(OmsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_stale_requests_are_failed() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let tracker = BackfillTracker::in_memory(
            Arc::new(SlidingWindowLimiter::new(std::time::Duration::from_secs(60), 10)),
            clock.clone(),
        );
        let tenant = TenantId::new("acme");
        let stuck = tracker.submit(&tenant, make_req("BTC-USD", "binance")).unwrap();
        tracker.start(&tenant, &stuck.request_id).unwrap();
        let done = tracker.submit(&tenant, make_req("ETH-USD", "binance")).unwrap();
        tracker.start(&tenant, &done.request_id).unwrap();
        tracker.complete(&tenant, &done.request_id, 5).unwrap();

        clock.advance(Duration::minutes(30));
        let fresh = tracker.submit(&tenant, make_req("SOL-USD", "binance")).unwrap();
        assert!(tracker.fail_stale(&tenant, Duration::hours(1)).unwrap().is_empty());

        clock.advance(Duration::minutes(31));
        let failed = tracker.fail_stale(&tenant, Duration::hours(1)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request_id, stuck.request_id);
        assert_eq!(failed[0].status, BackfillStatus::Failed);
        assert!(failed[0].error.is_some());

        assert_eq!(tracker.get(&tenant, &fresh.request_id).unwrap().status, BackfillStatus::Pending);
        assert_eq!(tracker.get(&tenant, &done.request_id).unwrap().status, BackfillStatus::Completed);
        // The stuck pair is free again.
        assert!(tracker.submit(&tenant, make_req("BTC-USD", "binance")).is_ok());
        assert_eq!(tracker.tenants().unwrap(), vec![tenant]);
    }

    #[test]
    fn test_rate_limited_per_source() {
        let tracker = make_tracker(2);
        let tenant = TenantId::new("acme");
        tracker.submit(&tenant, make_req("BTC-USD", "binance")).unwrap();
        tracker.submit(&tenant, make_req("ETH-USD", "binance")).unwrap();
        let err = tracker.submit(&tenant, make_req("SOL-USD", "binance")).unwrap_err();
        assert!(matches!(err, OmsError::RateLimited { .. }));
        // The rejected submit did not keep the slot.
        assert!(tracker.submit(&tenant, make_req("SOL-USD", "bybit")).is_ok());
        let retry = tracker.submit(&tenant, make_req("SOL-USD", "binance")).unwrap_err();
        assert!(matches!(retry, OmsError::RateLimited { .. }));
    }
}
