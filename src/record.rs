// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The durable shape of a lock as document-style backends store it.
///
/// `locked_at` and `locked_by` are kept for troubleshooting only. Ownership is
/// decided by `lease`, which is minted fresh for every successful acquisition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    #[serde(rename = "_id")]
    pub name: String,
    #[serde(with = "iso8601")]
    pub lock_until: DateTime<Utc>,
    #[serde(with = "iso8601")]
    pub locked_at: DateTime<Utc>,
    pub locked_by: String,
    pub lease: Uuid,
}

impl LockRecord {
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.lock_until > now
    }
}

/// ISO-8601 UTC instants with a fixed millisecond precision, so stored values
/// compare correctly as plain strings.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn format(instant: &DateTime<Utc>) -> String {
        instant.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(instant: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(instant))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let value = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&value)
            .map(|instant| instant.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;

    #[test]
    fn millisecond_instants_sort_as_strings() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 9).unwrap();
        let late = early + TimeDelta::milliseconds(1500);

        assert_eq!(iso8601::format(&early), "2024-01-01T00:00:09.000Z");
        assert!(iso8601::format(&early) < iso8601::format(&late));
    }

    #[test]
    fn record_uses_document_field_names() {
        let record = LockRecord {
            name: "nightly-report".to_string(),
            lock_until: Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap(),
            locked_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            locked_by: "worker-1".to_string(),
            lease: Uuid::nil(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "_id": "nightly-report",
                "lockUntil": "2024-01-01T00:05:00.000Z",
                "lockedAt": "2024-01-01T00:00:00.000Z",
                "lockedBy": "worker-1",
                "lease": "00000000-0000-0000-0000-000000000000",
            })
        );

        let decoded: LockRecord = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn held_until_lock_until_passes() {
        let lock_until = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let record = LockRecord {
            name: "job".to_string(),
            lock_until,
            locked_at: lock_until - TimeDelta::minutes(5),
            locked_by: "worker-1".to_string(),
            lease: Uuid::new_v4(),
        };

        assert!(record.is_held(lock_until - TimeDelta::milliseconds(1)));
        assert!(!record.is_held(lock_until));
    }
}
