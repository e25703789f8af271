// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{fmt::Debug, future::Future, time::Duration};

use tokio::time::timeout;

use crate::{config::LockConfiguration, error::LockError, handle::LockHandle};

#[cfg(feature = "dynamodb")]
pub mod dynamodb;
pub mod kv;
pub mod memory;

/// Upper bound for a single round-trip to a lock store.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// `LockProvider` is a trait that abstracts the backend specific details of
/// the lock acquisition mechanism.
///
/// Acquisition is a single non-blocking attempt. `Ok(None)` means the lock
/// is held by someone else; an `Err` means the backend could not be asked.
pub trait LockProvider: Send + Sync {
    type Lease: Lease;

    fn acquire(
        &self,
        config: &LockConfiguration,
    ) -> impl Future<Output = Result<Option<LockHandle<Self::Lease>>, LockError>> + Send;
}

/// `Lease` is a trait that abstracts the backend specific details of the
/// lock extension and release mechanism.
///
/// A lease only performs the write. Guarding against a second release or
/// extend is the job of [LockHandle].
pub trait Lease: Debug + Send + Sync + Sized + 'static {
    /// Whether [extend](Lease::extend) is implemented. Leases that override
    /// `extend` must set this, since [LockHandle] checks it before the
    /// handle is consumed.
    const SUPPORTS_EXTEND: bool = false;

    /// Move the lock's expiry to `config.unlock_time(now)`.
    fn release(&self, config: &LockConfiguration) -> impl Future<Output = Result<(), LockError>> + Send;

    /// Move the lock's expiry to `config.lock_at_most_until()` if this lease
    /// still owns an unexpired lock.
    fn extend(
        &self,
        _config: &LockConfiguration,
    ) -> impl Future<Output = Result<Option<Self>, LockError>> + Send {
        async { Err(LockError::ExtendNotSupported) }
    }
}

/// Bound a backend round-trip by `limit`.
pub async fn with_timeout<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T, LockError>>,
) -> Result<T, LockError> {
    timeout(limit, operation)
        .await
        .map_err(|_| LockError::Timeout(limit))?
}

/// Name of this host, recorded as the diagnostic lock owner.
pub fn hostname() -> String {
    ::hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out() {
        let result = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(LockError::Timeout(limit)) if limit == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn fast_operation_passes_through() {
        let value = with_timeout(DEFAULT_TIMEOUT, async { Ok::<_, LockError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
