// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! Locks that keep a scheduled job from running on more than one node at a
//! time.
//!
//! Every node runs the same schedule. When a job fires, the node tries to
//! take the job's lock in a shared store; the node that gets it runs the job,
//! the others skip that run. There is no waiting and no heartbeat: a lock is
//! held until it is released or until `lock_at_most_until` passes, whichever
//! comes first, and a release never frees it before `lock_at_least_until`.
//!
//! Correctness rests on the store's atomic conditional write and on node
//! clocks being roughly in sync.
//!
//! # Examples
//!
//! You can let [LockingTaskExecutor] manage the lock or manage it yourself:
//!
//! ## Executor
//! [LockingTaskExecutor::execute_with_lock] will acquire the lock, run the
//! task, and release the lock. For more information see the function
//! documentation.
//! ```rust,no_run
//! use schedlock::{InMemoryLockProvider, LockConfiguration, LockingTaskExecutor};
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = LockingTaskExecutor::builder()
//!         .provider(InMemoryLockProvider::builder().build())
//!         .build();
//!
//!     let config = LockConfiguration::builder()
//!         .now(Utc::now())
//!         .name("nightly_report")
//!         .lock_at_most_for(Duration::from_secs(300))
//!         .lock_at_least_for(Duration::from_secs(10))
//!         .build()?;
//!
//!     let result = executor
//!         .execute_with_lock(config, async || {
//!             // do synchronized work!
//!         })
//!         .await?;
//!
//!     if !result.was_executed() {
//!         // another node is running the report
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Manually
//! You are responsible for releasing the lock.
//! ```rust,no_run
//! use schedlock::{InMemoryLockProvider, LockConfiguration, LockProvider};
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = InMemoryLockProvider::builder().build();
//!     let config = LockConfiguration::builder()
//!         .now(Utc::now())
//!         .name("nightly_report")
//!         .lock_at_most_for(Duration::from_secs(300))
//!         .build()?;
//!
//!     if let Some(handle) = provider.acquire(&config).await? {
//!         // do synchronized work!
//!         handle.release().await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod assert;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod handle;
pub mod providers;
pub mod record;

pub use assert::assert_locked;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LockConfiguration;
pub use error::{LockError, TaskError};
pub use executor::{FaultPolicy, LockingTaskExecutor, TaskResult};
pub use handle::LockHandle;
#[cfg(feature = "dynamodb")]
pub use providers::dynamodb::{DynamodbLease, DynamodbLockProvider};
pub use providers::{
    Lease, LockProvider,
    kv::{KeyValueLease, KeyValueLockProvider, KeyValueStore, MemoryKeyValueStore},
    memory::{InMemoryLease, InMemoryLockProvider, MemoryLockStore},
};
pub use record::LockRecord;
