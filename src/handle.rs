// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::{config::LockConfiguration, error::LockError, providers::Lease};

/// Proof of one successful acquisition.
///
/// A handle allows exactly one [release](LockHandle::release) or
/// [extend](LockHandle::extend). Later calls are no-ops, even when they race
/// with the first one from another thread, so a lock is never written twice
/// on behalf of the same acquisition.
#[derive(Debug)]
pub struct LockHandle<L> {
    config: LockConfiguration,
    lease: L,
    used: AtomicBool,
}

impl<L: Lease> LockHandle<L> {
    pub fn new(config: LockConfiguration, lease: L) -> Self {
        Self {
            config,
            lease,
            used: AtomicBool::new(false),
        }
    }

    pub fn configuration(&self) -> &LockConfiguration {
        &self.config
    }

    pub fn lease(&self) -> &L {
        &self.lease
    }

    /// Whether neither release nor extend has been called yet.
    pub fn is_active(&self) -> bool {
        !self.used.load(Ordering::Acquire)
    }

    /// Release the lock, keeping it held until `lock_at_least_until` if that
    /// is still in the future.
    pub async fn release(&self) -> Result<(), LockError> {
        if !self.claim("release") {
            return Ok(());
        }
        debug!("Releasing lock {}", self.config.name());
        self.lease.release(&self.config).await
    }

    /// Extend the lock to `config.lock_at_most_until()`.
    ///
    /// On success a new handle is returned and this one becomes inert.
    /// `Ok(None)` means the lock expired or changed hands in the meantime.
    ///
    /// A configuration for another lock and a lease without extend support
    /// are rejected before the handle is consumed, so it can still be
    /// released. Any other error consumes it like a successful extend.
    pub async fn extend(&self, config: LockConfiguration) -> Result<Option<LockHandle<L>>, LockError> {
        if config.name() != self.config.name() {
            return Err(LockError::InvalidConfiguration(format!(
                "can not extend lock `{}` with a configuration for `{}`",
                self.config.name(),
                config.name()
            )));
        }
        if !L::SUPPORTS_EXTEND {
            return Err(LockError::ExtendNotSupported);
        }
        if !self.claim("extend") {
            return Ok(None);
        }

        debug!(
            "Extending lock {} until {}",
            config.name(),
            config.lock_at_most_until()
        );
        match self.lease.extend(&config).await {
            Ok(Some(lease)) => Ok(Some(LockHandle::new(config, lease))),
            Ok(None) => {
                debug!("Lock {} could not be extended, it is no longer held", config.name());
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn claim(&self, operation: &str) -> bool {
        let claimed = self
            .used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            warn!(
                "Ignoring {operation} of lock {}, the handle was already released or extended",
                self.config.name()
            );
        }
        claimed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use chrono::{TimeDelta, Utc};
    use tokio::sync::Notify;

    use super::*;

    #[derive(Debug, Default, Clone)]
    struct CountingLease {
        releases: Arc<AtomicUsize>,
        extends: Arc<AtomicUsize>,
        parked: Option<Arc<Notify>>,
    }

    impl Lease for CountingLease {
        const SUPPORTS_EXTEND: bool = true;

        async fn release(&self, _config: &LockConfiguration) -> Result<(), LockError> {
            tokio::task::yield_now().await;
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn extend(&self, _config: &LockConfiguration) -> Result<Option<Self>, LockError> {
            self.extends.fetch_add(1, Ordering::SeqCst);
            if let Some(parked) = &self.parked {
                parked.notified().await;
            }
            Ok(Some(self.clone()))
        }
    }

    /// A lease that keeps the default, unsupported extend.
    #[derive(Debug, Default, Clone)]
    struct ReleaseOnlyLease {
        releases: Arc<AtomicUsize>,
    }

    impl Lease for ReleaseOnlyLease {
        async fn release(&self, _config: &LockConfiguration) -> Result<(), LockError> {
            tokio::task::yield_now().await;
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(name: &str) -> LockConfiguration {
        let now = Utc::now();
        LockConfiguration::new(name, now + TimeDelta::minutes(5), now).unwrap()
    }

    #[tokio::test]
    async fn release_writes_once() {
        let lease = CountingLease::default();
        let handle = LockHandle::new(config("job"), lease.clone());

        handle.release().await.unwrap();
        handle.release().await.unwrap();

        assert_eq!(lease.releases.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_releases_write_once() {
        let lease = CountingLease::default();
        let handle = Arc::new(LockHandle::new(config("job"), lease.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { handle.release().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(lease.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unsupported_extends_racing_a_release_write_once() {
        let lease = ReleaseOnlyLease::default();
        let handle = Arc::new(LockHandle::new(config("job"), lease.clone()));

        let extends: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { handle.extend(config("job")).await })
            })
            .collect();
        let release = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.release().await })
        };

        for extend in extends {
            let error = extend.await.unwrap().unwrap_err();
            assert!(matches!(error, LockError::ExtendNotSupported));
        }
        release.await.unwrap().unwrap();

        assert_eq!(lease.releases.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn release_during_extend_leaves_lock_to_the_new_handle() {
        let parked = Arc::new(Notify::new());
        let lease = CountingLease {
            parked: Some(Arc::clone(&parked)),
            ..Default::default()
        };
        let handle = Arc::new(LockHandle::new(config("job"), lease.clone()));

        let extend = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.extend(config("job")).await })
        };
        while lease.extends.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        handle.release().await.unwrap();
        assert_eq!(lease.releases.load(Ordering::SeqCst), 0);

        parked.notify_one();
        let extended = extend.await.unwrap().unwrap().expect("lease is extendable");
        extended.release().await.unwrap();
        assert_eq!(lease.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extend_makes_old_handle_inert() {
        let lease = CountingLease::default();
        let handle = LockHandle::new(config("job"), lease.clone());

        let extended = handle
            .extend(config("job"))
            .await
            .unwrap()
            .expect("lease is extendable");

        handle.release().await.unwrap();
        assert!(handle.extend(config("job")).await.unwrap().is_none());
        assert_eq!(lease.releases.load(Ordering::SeqCst), 0);
        assert_eq!(lease.extends.load(Ordering::SeqCst), 1);

        extended.release().await.unwrap();
        assert_eq!(lease.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extend_with_other_name_is_rejected_without_consuming_handle() {
        let lease = CountingLease::default();
        let handle = LockHandle::new(config("job"), lease.clone());

        let error = handle.extend(config("other")).await.unwrap_err();

        assert!(matches!(error, LockError::InvalidConfiguration(_)));
        assert!(handle.is_active());
        assert_eq!(lease.extends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_extend_keeps_handle_releasable() {
        let lease = ReleaseOnlyLease::default();
        let handle = LockHandle::new(config("job"), lease.clone());

        let error = handle.extend(config("job")).await.unwrap_err();
        assert!(matches!(error, LockError::ExtendNotSupported));
        assert!(handle.is_active());

        handle.release().await.unwrap();
        assert_eq!(lease.releases.load(Ordering::SeqCst), 1);
    }
}
