// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bon::Builder;
use chrono::TimeDelta;
use tokio::{join, runtime::Handle, select, sync::Notify, time::sleep};
use tracing::{debug, error, warn};

use crate::{
    assert::{is_held, scope},
    clock::{Clock, system_clock},
    config::LockConfiguration,
    error::{LockError, TaskError},
    handle::LockHandle,
    providers::{Lease, LockProvider},
};

/// What to do when the lock store itself fails during acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Return the fault to the caller.
    #[default]
    Propagate,
    /// Log the fault and report the task as not executed, as if the lock
    /// were held elsewhere. The scheduler keeps running through a store
    /// outage, at the price of silently skipping runs.
    SkipExecution,
}

/// Outcome of [LockingTaskExecutor::execute_with_lock].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult<T> {
    Executed(T),
    NotExecuted,
}

impl<T> TaskResult<T> {
    pub fn was_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }

    pub fn into_output(self) -> Option<T> {
        match self {
            Self::Executed(output) => Some(output),
            Self::NotExecuted => None,
        }
    }
}

/// Runs tasks while holding a lock from a [LockProvider].
///
/// A task runs only if the lock could be acquired, and the lock is released
/// on every way out of the task: normal return, error, panic, or the
/// executor's future being dropped.
#[derive(Builder)]
pub struct LockingTaskExecutor<P>
where
    P: LockProvider,
{
    provider: P,
    #[builder(default = system_clock())]
    clock: Arc<dyn Clock>,
    #[builder(default)]
    fault_policy: FaultPolicy,
    /// Extend the lock at this interval while the task runs.
    keep_alive: Option<Duration>,
}

impl<P> LockingTaskExecutor<P>
where
    P: LockProvider,
{
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Execute `task` if the lock described by `config` can be acquired.
    ///
    /// Returns [TaskResult::NotExecuted] when the lock is held elsewhere.
    /// Running under a lock that the current task already holds executes
    /// `task` directly.
    ///
    /// An `Err` does not always mean that `task` was skipped. If releasing
    /// the lock fails, `task` has already run and its output is dropped.
    pub async fn execute_with_lock<T>(
        &self,
        config: LockConfiguration,
        task: impl AsyncFnOnce() -> T,
    ) -> Result<TaskResult<T>, LockError> {
        if is_held(config.name()) {
            debug!("Lock {} is already held by this task", config.name());
            return Ok(TaskResult::Executed(task().await));
        }

        let Some(handle) = self.acquire(&config).await? else {
            return Ok(TaskResult::NotExecuted);
        };

        let guard = ReleaseGuard::new(handle);
        let output = self.run(&guard, &config, task).await;
        guard.release().await?;

        Ok(TaskResult::Executed(output))
    }

    /// Like [execute_with_lock](Self::execute_with_lock) for tasks that can
    /// fail. The lock is released before a task error is returned, and the
    /// task error wins over a failure to release.
    ///
    /// As with `execute_with_lock`, a [TaskError::Lock] can come from the
    /// release after `task` succeeded, in which case `task` did run.
    pub async fn try_execute_with_lock<T, E>(
        &self,
        config: LockConfiguration,
        task: impl AsyncFnOnce() -> Result<T, E>,
    ) -> Result<TaskResult<T>, TaskError<E>> {
        if is_held(config.name()) {
            debug!("Lock {} is already held by this task", config.name());
            return task().await.map(TaskResult::Executed).map_err(TaskError::Task);
        }

        let Some(handle) = self.acquire(&config).await? else {
            return Ok(TaskResult::NotExecuted);
        };

        let guard = ReleaseGuard::new(handle);
        let output = self.run(&guard, &config, task).await;
        let released = guard.release().await;

        match (output, released) {
            (Ok(output), Ok(())) => Ok(TaskResult::Executed(output)),
            (Ok(_), Err(error)) => Err(TaskError::Lock(error)),
            (Err(error), Ok(())) => Err(TaskError::Task(error)),
            (Err(error), Err(release_error)) => {
                error!(
                    "Failed to release lock {} after the task failed: {release_error}",
                    config.name()
                );
                Err(TaskError::Task(error))
            }
        }
    }

    async fn acquire(
        &self,
        config: &LockConfiguration,
    ) -> Result<Option<LockHandle<P::Lease>>, LockError> {
        match self.provider.acquire(config).await {
            Ok(Some(handle)) => Ok(Some(handle)),
            Ok(None) => {
                debug!("Not executing {}, the lock is held elsewhere", config.name());
                Ok(None)
            }
            Err(error)
                if error.is_backend_fault() && self.fault_policy == FaultPolicy::SkipExecution =>
            {
                error!(
                    "Not executing {}, the lock provider failed: {error}",
                    config.name()
                );
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn run<T>(
        &self,
        guard: &ReleaseGuard<P::Lease>,
        config: &LockConfiguration,
        task: impl AsyncFnOnce() -> T,
    ) -> T {
        let work = scope(config.name(), task());
        let Some(interval) = self.keep_alive else {
            return work.await;
        };

        let lock_at_most_for = config.lock_at_most_until() - self.clock.now();
        let notify = Notify::new();

        let wrapper = async {
            let output = work.await;
            notify.notify_one();
            output
        };

        let (output, ()) = join! {
            wrapper,
            self.renew(guard, interval, lock_at_most_for, &notify),
        };

        output
    }

    async fn renew(
        &self,
        guard: &ReleaseGuard<P::Lease>,
        interval: Duration,
        lock_at_most_for: TimeDelta,
        notify: &Notify,
    ) {
        if !P::Lease::SUPPORTS_EXTEND {
            warn!("Lock provider can not extend locks, keep-alive is disabled");
            return;
        }

        loop {
            let stop = select! {
                _ = sleep(interval) => false,
                _ = notify.notified() => true,
            };
            if stop {
                break;
            }

            let Some(handle) = guard.current() else {
                break;
            };
            let name = handle.configuration().name().to_string();
            let config = self
                .clock
                .now()
                .checked_add_signed(lock_at_most_for)
                .ok_or_else(|| {
                    LockError::InvalidConfiguration(format!("lock `{name}` can not be extended further"))
                })
                .and_then(|until| {
                    LockConfiguration::new(
                        name.clone(),
                        until,
                        handle.configuration().lock_at_least_until(),
                    )
                });
            let config = match config {
                Ok(config) => config,
                Err(error) => {
                    warn!("Stopped extending lock {name}: {error}");
                    break;
                }
            };

            // until the extend settles, only the lease can release the lock
            guard.mark_extending();
            match handle.extend(config).await {
                Ok(Some(extended)) => {
                    debug!(
                        "Extended lock {name} until {}",
                        extended.configuration().lock_at_most_until()
                    );
                    guard.replace(extended);
                }
                Ok(None) => {
                    warn!("Lock {name} was lost while its task was running");
                    guard.settle();
                    break;
                }
                Err(LockError::ExtendNotSupported) => {
                    warn!("Lock provider can not extend lock {name}, keep-alive is disabled");
                    break;
                }
                Err(error) => {
                    warn!("Failed to extend lock {name}, it will be released by its lease: {error}");
                    break;
                }
            }
        }
    }
}

/// The newest handle of a running task.
///
/// While `extending` is set the handle may already be consumed by an extend
/// whose outcome is unknown, so the lock is released through the lease with
/// the handle's configuration instead. Extendable leases match on ownership,
/// so this write is harmless if the lock changed hands.
struct Held<L> {
    handle: Arc<LockHandle<L>>,
    extending: bool,
}

impl<L: Lease> Held<L> {
    async fn release(self) -> Result<(), LockError> {
        if self.extending {
            self.handle
                .lease()
                .release(self.handle.configuration())
                .await
        } else {
            self.handle.release().await
        }
    }
}

/// Owns the current handle of a running task and releases it in the
/// background if the task never gets to release it itself.
struct ReleaseGuard<L: Lease> {
    held: Mutex<Option<Held<L>>>,
}

impl<L: Lease> ReleaseGuard<L> {
    fn new(handle: LockHandle<L>) -> Self {
        Self {
            held: Mutex::new(Some(Held {
                handle: Arc::new(handle),
                extending: false,
            })),
        }
    }

    fn with_held<T>(&self, f: impl FnOnce(&mut Option<Held<L>>) -> T) -> T {
        f(&mut self.held.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn current(&self) -> Option<Arc<LockHandle<L>>> {
        self.with_held(|held| held.as_ref().map(|held| Arc::clone(&held.handle)))
    }

    fn mark_extending(&self) {
        self.with_held(|held| {
            if let Some(held) = held {
                held.extending = true;
            }
        });
    }

    fn settle(&self) {
        self.with_held(|held| {
            if let Some(held) = held {
                held.extending = false;
            }
        });
    }

    fn replace(&self, handle: LockHandle<L>) {
        self.with_held(|held| {
            *held = Some(Held {
                handle: Arc::new(handle),
                extending: false,
            })
        });
    }

    async fn release(self) -> Result<(), LockError> {
        match self.with_held(Option::take) {
            Some(held) => held.release().await,
            None => Ok(()),
        }
    }
}

impl<L: Lease> Drop for ReleaseGuard<L> {
    fn drop(&mut self) {
        let Some(held) = self
            .held
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let name = held.handle.configuration().name().to_string();
        match Handle::try_current() {
            Ok(runtime) => {
                warn!("Task holding lock {name} did not complete, releasing the lock in the background");
                runtime.spawn(async move {
                    if let Err(error) = held.release().await {
                        error!("Failed to release lock {name}: {error}");
                    }
                });
            }
            Err(_) => error!(
                "Task holding lock {name} did not complete, the lock expires at {}",
                held.handle.configuration().lock_at_most_until()
            ),
        }
    }
}
