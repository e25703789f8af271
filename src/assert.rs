// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! Checks that code is running under a lock taken by
//! [LockingTaskExecutor](crate::LockingTaskExecutor).
//!
//! The set of held locks is a tokio task-local, so it is visible to the task
//! the executor runs but not to tasks that it spawns.

use std::future::Future;

use crate::error::LockError;

tokio::task_local! {
    static HELD_LOCKS: Vec<String>;
}

/// Returns `Err(LockError::NotLocked)` unless the current task runs under a lock.
pub fn assert_locked() -> Result<(), LockError> {
    let locked = HELD_LOCKS
        .try_with(|held| !held.is_empty())
        .unwrap_or(false);
    if locked { Ok(()) } else { Err(LockError::NotLocked) }
}

/// Whether the current task runs under the lock called `name`.
pub fn is_held(name: &str) -> bool {
    HELD_LOCKS
        .try_with(|held| held.iter().any(|held| held == name))
        .unwrap_or(false)
}

pub(crate) async fn scope<F: Future>(name: &str, task: F) -> F::Output {
    let mut held = HELD_LOCKS.try_with(Clone::clone).unwrap_or_default();
    held.push(name.to_string());
    HELD_LOCKS.scope(held, task).await
}
