// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! Document-store provider on [DynamoDB](aws_sdk_dynamodb).
//!
//! Every lock is one item shaped like a [LockRecord]:
//! ```json
//! {
//!    "_id" : "lock name",
//!    "lockUntil" : "2017-01-07T16:52:04.071Z",
//!    "lockedAt" : "2017-01-07T16:52:03.932Z",
//!    "lockedBy" : "host name",
//!    "lease" : "6f1c2d56-..."
//! }
//! ```
//! Instants are stored as fixed-precision ISO-8601 strings, so the condition
//! expressions can compare them as strings.

use std::{collections::HashMap, sync::Arc, time::Duration};

use aws_sdk_dynamodb::{
    Client,
    error::SdkError,
    operation::{delete_item::DeleteItemError, put_item::PutItemError, update_item::UpdateItemError},
    types::AttributeValue,
};
use bon::Builder;
use serde_dynamo::aws_sdk_dynamodb_1::to_item;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    clock::{Clock, system_clock},
    config::LockConfiguration,
    error::LockError,
    handle::LockHandle,
    providers::{DEFAULT_TIMEOUT, Lease, LockProvider, hostname, with_timeout},
    record::{LockRecord, iso8601},
};

/// [DynamoDB](aws_sdk_dynamodb) provider for [LockingTaskExecutor](crate::LockingTaskExecutor)
///
/// The table needs a string partition key named [DynamodbLockProvider::ID_ATTRIBUTE].
#[derive(Builder, Debug, Clone)]
pub struct DynamodbLockProvider {
    client: Arc<Client>,
    #[builder(into)]
    table_name: String,
    #[builder(default = system_clock())]
    clock: Arc<dyn Clock>,
    #[builder(into, default = hostname())]
    owner: String,
    #[builder(default = DEFAULT_TIMEOUT)]
    timeout: Duration,
}

impl DynamodbLockProvider {
    pub const ID_ATTRIBUTE: &str = "_id";
    pub const LOCK_UNTIL_ATTRIBUTE: &str = "lockUntil";
    pub const LEASE_ATTRIBUTE: &str = "lease";

    fn key(name: &str) -> AttributeValue {
        AttributeValue::S(name.to_string())
    }

    fn instant(instant: &chrono::DateTime<chrono::Utc>) -> AttributeValue {
        AttributeValue::S(iso8601::format(instant))
    }
}

impl LockProvider for DynamodbLockProvider {
    type Lease = DynamodbLease;

    async fn acquire(
        &self,
        config: &LockConfiguration,
    ) -> Result<Option<LockHandle<DynamodbLease>>, LockError> {
        let now = self.clock.now();
        let record = LockRecord {
            name: config.name().to_string(),
            lock_until: config.lock_at_most_until(),
            locked_at: now,
            locked_by: self.owner.clone(),
            lease: Uuid::new_v4(),
        };
        let item: HashMap<String, AttributeValue> = to_item(&record).map_err(LockError::provider)?;

        // Either the lock was never taken or its holder's time is up.
        let result = with_timeout(self.timeout, async {
            Ok(self
                .client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(item))
                .condition_expression("attribute_not_exists(#id) OR #lock_until <= :now")
                .expression_attribute_names("#id", Self::ID_ATTRIBUTE)
                .expression_attribute_names("#lock_until", Self::LOCK_UNTIL_ATTRIBUTE)
                .expression_attribute_values(":now", Self::instant(&now))
                .send()
                .await)
        })
        .await?;

        match result {
            Ok(_) => {
                debug!("Acquired lock {} until {}", record.name, record.lock_until);
                Ok(Some(LockHandle::new(
                    config.clone(),
                    DynamodbLease {
                        provider: self.clone(),
                        lease: record.lease,
                    },
                )))
            }
            Err(SdkError::ServiceError(e))
                if matches!(e.err(), PutItemError::ConditionalCheckFailedException(_)) =>
            {
                debug!("Lock {} is held by another owner", record.name);
                Ok(None)
            }
            Err(sdk_error) => Err(LockError::provider(sdk_error)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DynamodbLease {
    provider: DynamodbLockProvider,
    lease: Uuid,
}

impl DynamodbLease {
    pub fn id(&self) -> Uuid {
        self.lease
    }

    async fn delete(&self, config: &LockConfiguration) -> Result<(), LockError> {
        let provider = &self.provider;
        let result = with_timeout(provider.timeout, async {
            Ok(provider
                .client
                .delete_item()
                .table_name(&provider.table_name)
                .key(DynamodbLockProvider::ID_ATTRIBUTE, DynamodbLockProvider::key(config.name()))
                .condition_expression("#lease = :lease")
                .expression_attribute_names("#lease", DynamodbLockProvider::LEASE_ATTRIBUTE)
                .expression_attribute_values(":lease", AttributeValue::S(self.lease.to_string()))
                .send()
                .await)
        })
        .await?;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e))
                if matches!(e.err(), DeleteItemError::ConditionalCheckFailedException(_)) =>
            {
                warn!(
                    "Lock {} is no longer owned by lease {}, leaving it untouched",
                    config.name(),
                    self.lease
                );
                Ok(())
            }
            Err(sdk_error) => Err(LockError::provider(sdk_error)),
        }
    }
}

impl Lease for DynamodbLease {
    const SUPPORTS_EXTEND: bool = true;

    async fn release(&self, config: &LockConfiguration) -> Result<(), LockError> {
        let provider = &self.provider;
        let now = provider.clock.now();
        let unlock_time = config.unlock_time(now);
        if unlock_time <= now {
            return self.delete(config).await;
        }

        let result = with_timeout(provider.timeout, async {
            Ok(provider
                .client
                .update_item()
                .table_name(&provider.table_name)
                .key(DynamodbLockProvider::ID_ATTRIBUTE, DynamodbLockProvider::key(config.name()))
                .condition_expression("#lease = :lease")
                .update_expression("SET #lock_until = :unlock_time")
                .expression_attribute_names("#lease", DynamodbLockProvider::LEASE_ATTRIBUTE)
                .expression_attribute_names("#lock_until", DynamodbLockProvider::LOCK_UNTIL_ATTRIBUTE)
                .expression_attribute_values(":lease", AttributeValue::S(self.lease.to_string()))
                .expression_attribute_values(":unlock_time", DynamodbLockProvider::instant(&unlock_time))
                .send()
                .await)
        })
        .await?;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e))
                if matches!(e.err(), UpdateItemError::ConditionalCheckFailedException(_)) =>
            {
                warn!(
                    "Lock {} is no longer owned by lease {}, leaving it untouched",
                    config.name(),
                    self.lease
                );
                Ok(())
            }
            Err(sdk_error) => Err(LockError::provider(sdk_error)),
        }
    }

    async fn extend(&self, config: &LockConfiguration) -> Result<Option<Self>, LockError> {
        let provider = &self.provider;
        let now = provider.clock.now();

        let result = with_timeout(provider.timeout, async {
            Ok(provider
                .client
                .update_item()
                .table_name(&provider.table_name)
                .key(DynamodbLockProvider::ID_ATTRIBUTE, DynamodbLockProvider::key(config.name()))
                .condition_expression("#lease = :lease AND #lock_until > :now")
                .update_expression("SET #lock_until = :lock_until")
                .expression_attribute_names("#lease", DynamodbLockProvider::LEASE_ATTRIBUTE)
                .expression_attribute_names("#lock_until", DynamodbLockProvider::LOCK_UNTIL_ATTRIBUTE)
                .expression_attribute_values(":lease", AttributeValue::S(self.lease.to_string()))
                .expression_attribute_values(":now", DynamodbLockProvider::instant(&now))
                .expression_attribute_values(
                    ":lock_until",
                    DynamodbLockProvider::instant(&config.lock_at_most_until()),
                )
                .send()
                .await)
        })
        .await?;

        match result {
            Ok(_) => Ok(Some(self.clone())),
            Err(SdkError::ServiceError(e))
                if matches!(e.err(), UpdateItemError::ConditionalCheckFailedException(_)) =>
            {
                debug!("Lock {} expired or changed hands, not extending", config.name());
                Ok(None)
            }
            Err(sdk_error) => Err(LockError::provider(sdk_error)),
        }
    }
}
