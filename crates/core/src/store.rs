//! Keyed repository abstraction for risk state.
//!
//! Every entity is addressed by `(tenant, id)`. Implementations must be
//! strongly consistent per key; nothing is promised across keys. Concurrent
//! writers coordinate through the `version` carried by each record:
//! [`Repository::compare_and_put`] only succeeds against the version the
//! writer read, which is what keeps trip counts from being double-counted
//! when two sweeps race on the same breaker.
//!
//! [`InMemoryRepository`] is the in-process implementation used by the
//! service and by tests. A distributed cache can implement the same trait
//! without touching control logic.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::types::TenantId;

/// Number of read-modify-write attempts before giving up on a hot key.
pub const MAX_CAS_ATTEMPTS: usize = 16;

/// Records that carry an optimistic-concurrency version.
pub trait Versioned {
    /// Current version. `0` means "never stored".
    fn version(&self) -> u64;
    /// Overwrite the version (done by the repository on every write).
    fn set_version(&mut self, version: u64);
}

/// Storage-layer failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The stored version no longer matches the one the writer read.
    #[error("version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict { id: String, expected: u64, found: u64 },
    /// No record under the requested key.
    #[error("record not found: {0}")]
    NotFound(String),
    /// Too many concurrent writers on one key.
    #[error("gave up updating {id} after {attempts} conflicting attempts")]
    Contention { id: String, attempts: usize },
    /// Backend-specific failure (network, serialization, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Keyed, tenant-partitioned repository.
pub trait Repository<T>: Send + Sync {
    /// Fetch one record.
    fn get(&self, tenant: &TenantId, id: &str) -> Result<Option<T>, StoreError>;

    /// All records owned by `tenant`.
    fn list(&self, tenant: &TenantId) -> Result<Vec<T>, StoreError>;

    /// Unconditional write. The stored version becomes `previous + 1`.
    fn put(&self, tenant: &TenantId, id: &str, value: T) -> Result<T, StoreError>;

    /// Atomically insert `value` unless a record already exists.
    ///
    /// Returns `None` when the insert happened, or the existing record.
    fn insert_if_absent(
        &self,
        tenant: &TenantId,
        id: &str,
        value: T,
    ) -> Result<Option<T>, StoreError>;

    /// Write `value` only if the stored version equals `expected_version`.
    ///
    /// Returns the stored record (with its new version).
    fn compare_and_put(
        &self,
        tenant: &TenantId,
        id: &str,
        expected_version: u64,
        value: T,
    ) -> Result<T, StoreError>;

    /// Delete a record, returning it if it existed.
    fn remove(&self, tenant: &TenantId, id: &str) -> Result<Option<T>, StoreError>;

    /// Tenants that currently own at least one record.
    fn tenants(&self) -> Result<Vec<TenantId>, StoreError>;

    /// Records owned by `tenant` that satisfy `filter`.
    fn list_where(
        &self,
        tenant: &TenantId,
        filter: &dyn Fn(&T) -> bool,
    ) -> Result<Vec<T>, StoreError> {
        Ok(self.list(tenant)?.into_iter().filter(|v| filter(v)).collect())
    }
}

/// Outcome of a mutation closure passed to [`update_versioned`].
pub enum Change<R> {
    /// Persist the mutated record.
    Write(R),
    /// Nothing changed; skip the write.
    Keep(R),
}

/// Read-modify-CAS loop over a single key.
///
/// `apply` may be called more than once if another writer wins the race; it
/// always sees the freshest stored record. Returns the record as stored (or
/// as read, for [`Change::Keep`]) together with the closure's result.
pub fn update_versioned<T, R, E>(
    repo: &dyn Repository<T>,
    tenant: &TenantId,
    id: &str,
    mut apply: impl FnMut(&mut T) -> Result<Change<R>, E>,
) -> Result<(T, R), E>
where
    T: Versioned + Clone,
    E: From<StoreError>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let current = repo
            .get(tenant, id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut next = current.clone();
        match apply(&mut next)? {
            Change::Keep(r) => return Ok((current, r)),
            Change::Write(r) => match repo.compare_and_put(tenant, id, current.version(), next) {
                Ok(stored) => return Ok((stored, r)),
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(tenant_id = %tenant, id, "version conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            },
        }
    }
    Err(StoreError::Contention {
        id: id.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    }
    .into())
}

/// In-process repository backed by a sharded `DashMap`.
///
/// Per-key atomicity comes from the shard lock held by the entry API.
pub struct InMemoryRepository<T> {
    records: DashMap<(TenantId, String), T>,
}

impl<T> InMemoryRepository<T> {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Number of records across all tenants.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn key(tenant: &TenantId, id: &str) -> (TenantId, String) {
        (tenant.clone(), id.to_string())
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Repository<T> for InMemoryRepository<T>
where
    T: Versioned + Clone + Send + Sync,
{
    fn get(&self, tenant: &TenantId, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self
            .records
            .get(&Self::key(tenant, id))
            .map(|r| r.value().clone()))
    }

    fn list(&self, tenant: &TenantId) -> Result<Vec<T>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|entry| &entry.key().0 == tenant)
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn put(&self, tenant: &TenantId, id: &str, mut value: T) -> Result<T, StoreError> {
        match self.records.entry(Self::key(tenant, id)) {
            Entry::Occupied(mut occupied) => {
                value.set_version(occupied.get().version() + 1);
                occupied.insert(value.clone());
            }
            Entry::Vacant(vacant) => {
                value.set_version(1);
                vacant.insert(value.clone());
            }
        }
        Ok(value)
    }

    fn insert_if_absent(
        &self,
        tenant: &TenantId,
        id: &str,
        mut value: T,
    ) -> Result<Option<T>, StoreError> {
        match self.records.entry(Self::key(tenant, id)) {
            Entry::Occupied(occupied) => Ok(Some(occupied.get().clone())),
            Entry::Vacant(vacant) => {
                value.set_version(1);
                vacant.insert(value);
                Ok(None)
            }
        }
    }

    fn compare_and_put(
        &self,
        tenant: &TenantId,
        id: &str,
        expected_version: u64,
        mut value: T,
    ) -> Result<T, StoreError> {
        match self.records.entry(Self::key(tenant, id)) {
            Entry::Occupied(mut occupied) => {
                let found = occupied.get().version();
                if found != expected_version {
                    return Err(StoreError::VersionConflict {
                        id: id.to_string(),
                        expected: expected_version,
                        found,
                    });
                }
                value.set_version(found + 1);
                occupied.insert(value.clone());
                Ok(value)
            }
            Entry::Vacant(_) => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn remove(&self, tenant: &TenantId, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.records.remove(&Self::key(tenant, id)).map(|(_, v)| v))
    }

    fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let mut tenants: Vec<TenantId> = self
            .records
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }
}
