// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::time::Duration;

use bon::bon;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::LockError;

/// Describes a single attempt to take a named lock.
///
/// `lock_at_most_until` bounds how long the lock survives a holder that never
/// releases it. `lock_at_least_until` keeps the lock held after an early
/// release so that other nodes with slightly skewed clocks do not run the
/// same job again straight away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfiguration {
    name: String,
    lock_at_most_until: DateTime<Utc>,
    lock_at_least_until: DateTime<Utc>,
}

#[bon]
impl LockConfiguration {
    /// Build a configuration from absolute instants.
    pub fn new(
        name: impl Into<String>,
        lock_at_most_until: DateTime<Utc>,
        lock_at_least_until: DateTime<Utc>,
    ) -> Result<Self, LockError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LockError::InvalidConfiguration(
                "lock name can not be empty".to_string(),
            ));
        }
        if lock_at_least_until > lock_at_most_until {
            return Err(LockError::InvalidConfiguration(format!(
                "lock `{name}`: lock_at_least_until ({lock_at_least_until}) is after lock_at_most_until ({lock_at_most_until})"
            )));
        }

        Ok(Self {
            name,
            lock_at_most_until,
            lock_at_least_until,
        })
    }

    /// Build a configuration from durations measured from `now`.
    #[builder(start_fn = builder, finish_fn = build)]
    pub fn from_durations(
        now: DateTime<Utc>,
        #[builder(into)] name: String,
        lock_at_most_for: Duration,
        #[builder(default)] lock_at_least_for: Duration,
    ) -> Result<Self, LockError> {
        let lock_at_most_until = offset(&name, now, lock_at_most_for)?;
        let lock_at_least_until = offset(&name, now, lock_at_least_for)?;
        Self::new(name, lock_at_most_until, lock_at_least_until)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_at_most_until(&self) -> DateTime<Utc> {
        self.lock_at_most_until
    }

    pub fn lock_at_least_until(&self) -> DateTime<Utc> {
        self.lock_at_least_until
    }

    /// The instant a released lock stays held until: `lock_at_least_until`,
    /// or `now` if that has already passed.
    pub fn unlock_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.lock_at_least_until.max(now)
    }
}

fn offset(name: &str, now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, LockError> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| {
            LockError::InvalidConfiguration(format!(
                "lock `{name}`: duration {duration:?} is out of range"
            ))
        })
}
