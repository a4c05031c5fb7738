//! Idempotency records.
//!
//! One record per (tenant, idempotency key), created on the first
//! submission attempt and moved through PENDING -> SUBMITTED ->
//! COMPLETED/FAILED as the exchange round-trip progresses. Records expire;
//! an expired record is treated as absent everywhere.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tg_core::store::{update_versioned, Change, InMemoryRepository, Repository, StoreError, Versioned};
use tg_core::types::{Clock, ExchangeId, ExchangeOrderId, OrderId, TenantId};

use crate::error::{OmsError, OmsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    /// A submission under this key may still reach the exchange.
    pub fn in_progress(self) -> bool {
        matches!(self, Self::Pending | Self::Submitted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub exchange_id: ExchangeId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Blocks a new claim on the same key.
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.status != IdempotencyStatus::Failed
    }
}

impl Versioned for IdempotencyRecord {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Input to [`IdempotencyRecords::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIdempotencyRecord {
    pub idempotency_key: String,
    pub order_id: OrderId,
    pub exchange_id: ExchangeId,
    /// Overrides the default time-to-live. Negative values produce a record
    /// that is already expired.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

/// Outcome of an atomic claim on a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller owns the key now.
    Acquired(IdempotencyRecord),
    /// A live record already holds the key.
    Held(IdempotencyRecord),
}

pub struct IdempotencyRecords {
    records: Arc<dyn Repository<IdempotencyRecord>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl IdempotencyRecords {
    pub fn new(
        records: Arc<dyn Repository<IdempotencyRecord>>,
        clock: Arc<dyn Clock>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            records,
            clock,
            default_ttl,
        }
    }

    pub fn in_memory(clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryRepository::new()), clock, default_ttl)
    }

    /// Unexpired record for `key`, if any.
    pub fn get_live(&self, tenant: &TenantId, key: &str) -> OmsResult<Option<IdempotencyRecord>> {
        let now = self.clock.now();
        Ok(self.records.get(tenant, key)?.filter(|r| !r.is_expired(now)))
    }

    /// Atomically take `key`. Expired and FAILED records are replaced;
    /// anything else is reported as [`Claim::Held`]. Two concurrent claims
    /// on the same key never both acquire.
    pub fn claim(&self, tenant: &TenantId, req: &NewIdempotencyRecord) -> OmsResult<Claim> {
        if req.idempotency_key.trim().is_empty() {
            return Err(OmsError::Validation("idempotency key must not be blank".into()));
        }
        let now = self.clock.now();
        let ttl = req.ttl_secs.map(Duration::seconds).unwrap_or(self.default_ttl);
        let fresh = IdempotencyRecord {
            idempotency_key: req.idempotency_key.clone(),
            tenant_id: tenant.clone(),
            order_id: req.order_id.clone(),
            exchange_id: req.exchange_id.clone(),
            exchange_order_id: None,
            status: IdempotencyStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            version: 0,
        };
        let key = req.idempotency_key.as_str();

        for _ in 0..tg_core::store::MAX_CAS_ATTEMPTS {
            let Some(existing) = self.records.insert_if_absent(tenant, key, fresh.clone())? else {
                tracing::debug!(tenant_id = %tenant, key, order_id = %req.order_id, "idempotency key claimed");
                let stored = self.records.get(tenant, key)?.unwrap_or(fresh);
                return Ok(Claim::Acquired(stored));
            };
            if existing.is_live(now) {
                return Ok(Claim::Held(existing));
            }
            match self
                .records
                .compare_and_put(tenant, key, existing.version, fresh.clone())
            {
                Ok(stored) => {
                    tracing::debug!(
                        tenant_id = %tenant,
                        key,
                        previous = ?existing.status,
                        "stale idempotency record replaced"
                    );
                    return Ok(Claim::Acquired(stored));
                }
                Err(StoreError::VersionConflict { .. }) | Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Contention {
            id: key.to_string(),
            attempts: tg_core::store::MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Create a record, failing with a duplicate rejection if a live one
    /// already holds the key.
    pub fn create(&self, tenant: &TenantId, req: &NewIdempotencyRecord) -> OmsResult<IdempotencyRecord> {
        match self.claim(tenant, req)? {
            Claim::Acquired(r) => Ok(r),
            Claim::Held(r) => Err(tg_risk::RiskReject::DuplicateDetected {
                reason: format!(
                    "idempotency key {} already held by order {} ({:?})",
                    r.idempotency_key, r.order_id, r.status
                ),
            }
            .into()),
        }
    }

    pub fn update(
        &self,
        tenant: &TenantId,
        key: &str,
        status: IdempotencyStatus,
        exchange_order_id: Option<ExchangeOrderId>,
    ) -> OmsResult<IdempotencyRecord> {
        let now = self.clock.now();
        let (stored, ()) = update_versioned(self.records.as_ref(), tenant, key, |r| {
            r.status = status;
            if exchange_order_id.is_some() {
                r.exchange_order_id = exchange_order_id.clone();
            }
            r.updated_at = now;
            Ok::<_, OmsError>(Change::Write(()))
        })
        .map_err(|e| match e {
            OmsError::Store(StoreError::NotFound(id)) => OmsError::NotFound {
                entity: "idempotency record",
                id,
            },
            other => other,
        })?;
        Ok(stored)
    }

    pub fn remove(&self, tenant: &TenantId, key: &str) -> OmsResult<bool> {
        Ok(self.records.remove(tenant, key)?.is_some())
    }

    /// Delete expired records across all tenants. Returns how many went.
    pub fn prune_expired(&self) -> OmsResult<usize> {
        let now = self.clock.now();
        let mut pruned = 0;
        for tenant in self.records.tenants()? {
            for r in self.records.list_where(&tenant, &|r| r.is_expired(now))? {
                if self.records.remove(&tenant, &r.idempotency_key)?.is_some() {
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            tracing::debug!(pruned, "expired idempotency records pruned");
        }
        Ok(pruned)
    }
}
