// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! Provider for key/value stores with native key expiry (Redis style).
//!
//! A lock is the key `job-lock:<environment>:<name>`. Its time-to-live is the
//! lock's expiry, so the store forgets abandoned locks on its own. The value
//! is only a diagnostic payload.
//!
//! Release does not check who wrote the key. If the lock already expired and
//! another node took it, a late release from the previous holder still acts
//! on the new holder's key:
//!
//! - while the previous holder's minimum hold is running, the key is
//!   overwritten only if it exists, which shortens the new holder's lock to
//!   that minimum hold;
//! - once the minimum hold has passed, the key is deleted unconditionally,
//!   which removes the new holder's lock entirely and lets a third node
//!   acquire it at once.
//!
//! Leases of this provider can not be extended.

use std::{
    collections::HashMap,
    fmt::Debug,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bon::Builder;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::{
    clock::{Clock, system_clock},
    config::LockConfiguration,
    error::LockError,
    handle::LockHandle,
    providers::{DEFAULT_TIMEOUT, Lease, LockProvider, hostname, with_timeout},
    record::iso8601,
};

pub const KEY_PREFIX: &str = "job-lock";
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// The primitives a key/value store must offer, each one atomic.
pub trait KeyValueStore: Debug + Send + Sync + 'static {
    /// Set `key` with expiry `ttl` unless it exists. Returns whether it was set.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Overwrite `key` with expiry `ttl` only if it exists. Returns whether it
    /// was set.
    fn set_if_present(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), LockError>> + Send;
}

#[derive(Builder, Debug)]
pub struct KeyValueLockProvider<S: KeyValueStore> {
    store: Arc<S>,
    #[builder(into, default = DEFAULT_ENVIRONMENT.to_string())]
    environment: String,
    #[builder(default = system_clock())]
    clock: Arc<dyn Clock>,
    #[builder(into, default = hostname())]
    owner: String,
    #[builder(default = DEFAULT_TIMEOUT)]
    timeout: Duration,
}

impl<S: KeyValueStore> Clone for KeyValueLockProvider<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            environment: self.environment.clone(),
            clock: Arc::clone(&self.clock),
            owner: self.owner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S: KeyValueStore> KeyValueLockProvider<S> {
    /// Shortest expiry the store accepts; expiries are whole milliseconds.
    pub const MIN_TTL: Duration = Duration::from_millis(1);

    pub fn key(&self, name: &str) -> String {
        format!("{KEY_PREFIX}:{}:{name}", self.environment)
    }

    fn value(&self, now: DateTime<Utc>) -> String {
        format!("ADDED:{}@{}", iso8601::format(&now), self.owner)
    }
}

impl<S: KeyValueStore> LockProvider for KeyValueLockProvider<S> {
    type Lease = KeyValueLease<S>;

    async fn acquire(
        &self,
        config: &LockConfiguration,
    ) -> Result<Option<LockHandle<KeyValueLease<S>>>, LockError> {
        let now = self.clock.now();
        let ttl = ttl_until(config.lock_at_most_until(), now)
            .filter(|ttl| *ttl >= Self::MIN_TTL)
            .ok_or_else(|| {
                LockError::InvalidConfiguration(format!(
                    "lock `{}` must be held for at least {:?}, it expires at {}",
                    config.name(),
                    Self::MIN_TTL,
                    config.lock_at_most_until()
                ))
            })?;

        let key = self.key(config.name());
        let acquired = with_timeout(
            self.timeout,
            self.store.set_if_absent(&key, &self.value(now), ttl),
        )
        .await?;

        if !acquired {
            debug!("Lock {} is held by another owner", config.name());
            return Ok(None);
        }

        debug!("Acquired lock {} for {:?}", config.name(), ttl);
        Ok(Some(LockHandle::new(
            config.clone(),
            KeyValueLease {
                provider: self.clone(),
                key,
            },
        )))
    }
}

#[derive(Debug)]
pub struct KeyValueLease<S: KeyValueStore> {
    provider: KeyValueLockProvider<S>,
    key: String,
}

impl<S: KeyValueStore> Lease for KeyValueLease<S> {
    async fn release(&self, config: &LockConfiguration) -> Result<(), LockError> {
        let provider = &self.provider;
        let now = provider.clock.now();

        match ttl_until(config.lock_at_least_until(), now).filter(|ttl| !ttl.is_zero()) {
            None => with_timeout(provider.timeout, provider.store.delete(&self.key)).await,
            Some(ttl) => {
                let ttl = ttl.max(KeyValueLockProvider::<S>::MIN_TTL);
                let kept = with_timeout(
                    provider.timeout,
                    provider.store.set_if_present(&self.key, &provider.value(now), ttl),
                )
                .await?;
                if !kept {
                    debug!("Lock {} expired before it was released", config.name());
                }
                Ok(())
            }
        }
    }
}

fn ttl_until(until: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (until - now).to_std().ok()
}

/// A [KeyValueStore] living in process memory, expiring keys by its clock.
#[derive(Debug)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKeyValueStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Value of `key` if it has not expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone())
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, (String, DateTime<Utc>)>>, LockError> {
        let now = self.clock.now();
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LockError::provider("key/value store mutex is poisoned"))?;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(entries)
    }

    fn expiry(&self, ttl: Duration) -> Result<DateTime<Utc>, LockError> {
        TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
            .ok_or_else(|| LockError::provider(format!("invalid expire time {ttl:?}")))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let expires_at = self.expiry(ttl)?;
        let mut entries = self.entries()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(true)
    }

    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let expires_at = self.expiry(ttl)?;
        let mut entries = self.entries()?;
        match entries.get_mut(key) {
            Some(entry) => {
                *entry = (value.to_string(), expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), LockError> {
        self.entries()?.remove(key);
        Ok(())
    }
}
