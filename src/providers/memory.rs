// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! In-process provider backed by a shared map of [LockRecord]s.
//!
//! It follows the same record semantics as the document-store providers and
//! is meant for tests and single-process deployments. Several providers can
//! share one [MemoryLockStore] to stand in for several nodes.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    clock::{Clock, system_clock},
    config::LockConfiguration,
    error::LockError,
    handle::LockHandle,
    providers::{Lease, LockProvider, hostname},
    record::LockRecord,
};

#[derive(Debug, Default)]
struct Records {
    records: Mutex<HashMap<String, LockRecord>>,
    unavailable: AtomicBool,
}

/// Shared lock table. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    inner: Arc<Records>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for `name`, held or not.
    pub fn record(&self, name: &str) -> Option<LockRecord> {
        self.inner
            .records
            .lock()
            .ok()
            .and_then(|records| records.get(name).cloned())
    }

    /// Make every subsequent operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn write<R>(&self, f: impl FnOnce(&mut HashMap<String, LockRecord>) -> R) -> Result<R, LockError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::provider("lock store is unavailable"));
        }
        let mut records = self
            .inner
            .records
            .lock()
            .map_err(|_| LockError::provider("lock store mutex is poisoned"))?;
        Ok(f(&mut records))
    }
}

/// In-memory implementation of [LockProvider].
#[derive(Builder, Debug, Clone)]
pub struct InMemoryLockProvider {
    #[builder(default)]
    store: MemoryLockStore,
    #[builder(default = system_clock())]
    clock: Arc<dyn Clock>,
    #[builder(into, default = hostname())]
    owner: String,
}

impl InMemoryLockProvider {
    pub fn store(&self) -> &MemoryLockStore {
        &self.store
    }
}

impl LockProvider for InMemoryLockProvider {
    type Lease = InMemoryLease;

    async fn acquire(
        &self,
        config: &LockConfiguration,
    ) -> Result<Option<LockHandle<InMemoryLease>>, LockError> {
        let now = self.clock.now();
        let lease = Uuid::new_v4();

        let acquired = self.store.write(|records| match records.get(config.name()) {
            Some(record) if record.is_held(now) => false,
            _ => {
                records.insert(
                    config.name().to_string(),
                    LockRecord {
                        name: config.name().to_string(),
                        lock_until: config.lock_at_most_until(),
                        locked_at: now,
                        locked_by: self.owner.clone(),
                        lease,
                    },
                );
                true
            }
        })?;

        if !acquired {
            debug!("Lock {} is held by another owner", config.name());
            return Ok(None);
        }

        debug!(
            "Acquired lock {} until {}",
            config.name(),
            config.lock_at_most_until()
        );
        Ok(Some(LockHandle::new(
            config.clone(),
            InMemoryLease {
                provider: self.clone(),
                lease,
            },
        )))
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryLease {
    provider: InMemoryLockProvider,
    lease: Uuid,
}

impl InMemoryLease {
    pub fn id(&self) -> Uuid {
        self.lease
    }
}

impl Lease for InMemoryLease {
    const SUPPORTS_EXTEND: bool = true;

    async fn release(&self, config: &LockConfiguration) -> Result<(), LockError> {
        let unlock_time = config.unlock_time(self.provider.clock.now());

        let released = self.provider.store.write(|records| {
            match records.get_mut(config.name()) {
                Some(record) if record.lease == self.lease => {
                    record.lock_until = unlock_time;
                    true
                }
                _ => false,
            }
        })?;

        if !released {
            warn!(
                "Lock {} is no longer owned by lease {}, leaving it untouched",
                config.name(),
                self.lease
            );
        }
        Ok(())
    }

    async fn extend(&self, config: &LockConfiguration) -> Result<Option<Self>, LockError> {
        let now = self.provider.clock.now();

        let extended = self.provider.store.write(|records| {
            match records.get_mut(config.name()) {
                Some(record) if record.lease == self.lease && record.is_held(now) => {
                    record.lock_until = config.lock_at_most_until();
                    true
                }
                _ => false,
            }
        })?;

        Ok(extended.then(|| self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (ManualClock, InMemoryLockProvider) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let provider = InMemoryLockProvider::builder()
            .clock(Arc::new(clock.clone()))
            .owner("node-a")
            .build();
        (clock, provider)
    }

    fn config(clock: &ManualClock, at_most: u64, at_least: u64) -> LockConfiguration {
        LockConfiguration::builder()
            .now(clock.now())
            .name("test_lock")
            .lock_at_most_for(Duration::from_secs(at_most))
            .lock_at_least_for(Duration::from_secs(at_least))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn acquire_fresh_lock() {
        let (clock, provider) = setup();

        let handle = provider
            .acquire(&config(&clock, 5, 0))
            .await
            .unwrap()
            .expect("should be able to acquire lock");

        let record = provider.store().record("test_lock").unwrap();
        assert_eq!(record.lock_until, clock.now() + chrono::TimeDelta::seconds(5));
        assert_eq!(record.locked_at, clock.now());
        assert_eq!(record.locked_by, "node-a");
        assert_eq!(record.lease, handle.lease().id());
    }

    #[tokio::test]
    async fn reacquire_already_locked() {
        let (clock, provider) = setup();

        let _handle = provider.acquire(&config(&clock, 5, 0)).await.unwrap().unwrap();
        let second = provider.acquire(&config(&clock, 5, 0)).await.unwrap();

        assert!(second.is_none());
    }

    #[tokio::test]
    async fn release_keeps_record_until_minimum_hold() {
        let (clock, provider) = setup();
        let config = config(&clock, 60, 10);

        let handle = provider.acquire(&config).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        handle.release().await.unwrap();

        let record = provider.store().record("test_lock").unwrap();
        assert_eq!(record.lock_until, config.lock_at_least_until());
    }

    #[tokio::test]
    async fn stale_lease_does_not_release_new_owner() {
        let (clock, provider) = setup();

        let stale = provider.acquire(&config(&clock, 1, 0)).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        let current = provider.acquire(&config(&clock, 60, 0)).await.unwrap().unwrap();

        stale.release().await.unwrap();

        let record = provider.store().record("test_lock").unwrap();
        assert_eq!(record.lease, current.lease().id());
        assert!(record.is_held(clock.now()));
    }

    #[tokio::test]
    async fn unavailable_store_is_a_fault_not_contention() {
        let (clock, provider) = setup();
        provider.store().set_unavailable(true);

        let error = provider.acquire(&config(&clock, 5, 0)).await.unwrap_err();

        assert!(error.is_backend_fault());
    }
}
