// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{error::Error, time::Duration};

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum LockError {
    #[error("invalid lock configuration: {0}")]
    InvalidConfiguration(String),

    #[error("provider error: {0}")]
    ProviderError(Box<dyn Error + Send + Sync>),

    #[error("provider did not respond within {0:?}")]
    Timeout(Duration),

    #[error("provider does not support extending locks")]
    ExtendNotSupported,

    #[error("the current task is not running under a lock")]
    NotLocked,
}

impl LockError {
    pub fn provider(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::ProviderError(error.into())
    }

    /// Whether the error came from the lock store itself rather than from the
    /// caller. Contention is never an error, so this is the only signal that
    /// the store could not be consulted.
    pub fn is_backend_fault(&self) -> bool {
        matches!(self, Self::ProviderError(_) | Self::Timeout(_))
    }
}

/// Error returned when running a fallible task under a lock.
#[derive(ThisError, Debug)]
pub enum TaskError<E> {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("task failed: {0}")]
    Task(E),
}
