//! The message package: the serialized unit of work.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CodecError;
use crate::id::PackageId;

/// A queued unit of work.
///
/// Persisted as a flat JSON record
/// (`id, time, delay, attempts, max_attempts, queue, data, error`); only
/// `data` carries application structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// Tracing id (random, not unique).
    pub id: PackageId,
    /// Unix timestamp of the original send.
    pub time: i64,
    /// Requested delay in seconds at send time. Informational only.
    #[serde(default)]
    pub delay: u64,
    /// Failed deliveries so far.
    #[serde(default)]
    pub attempts: u32,
    /// Attempt ceiling, stamped by the consuming side when a delivery fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Destination queue name.
    pub queue: String,
    /// Opaque application payload.
    #[serde(default)]
    pub data: JsonValue,
    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Package {
    /// Build a fresh package for `queue`, stamped with the current time.
    pub fn new(queue: impl Into<String>, data: JsonValue, delay: u64) -> Self {
        Self {
            id: PackageId::random(),
            time: Utc::now().timestamp(),
            delay,
            attempts: 0,
            max_attempts: None,
            queue: queue.into(),
            data,
            error: None,
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        serde_json::from_str(raw).map_err(CodecError::Malformed)
    }

    /// A package past its ceiling is terminal and must never be re-queued.
    ///
    /// Packages that were never stamped with a ceiling are not exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts
            .is_some_and(|max_attempts| self.attempts > max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_package_starts_without_attempts() {
        let package = Package::new("emails", json!({"to": "a@example.com"}), 0);
        assert_eq!(package.attempts, 0);
        assert_eq!(package.max_attempts, None);
        assert_eq!(package.error, None);
        assert!(package.time > 0);
    }

    #[test]
    fn fresh_packages_omit_failure_fields() {
        let package = Package::new("jobs", json!({"n": 1}), 5);
        let raw = package.encode().unwrap();
        let value: JsonValue = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["queue"], "jobs");
        assert_eq!(value["delay"], 5);
        assert_eq!(value["data"], json!({"n": 1}));
        assert!(value.get("error").is_none());
        assert!(value.get("max_attempts").is_none());
    }

    #[test]
    fn decodes_records_written_by_other_producers() {
        let raw = r#"{"id":123,"time":1700000000,"delay":0,"attempts":0,"queue":"emails","data":{"to":"a@example.com"}}"#;
        let package = Package::decode(raw).unwrap();
        assert_eq!(package.id, PackageId(123));
        assert_eq!(package.queue, "emails");
        assert_eq!(package.data["to"], "a@example.com");
    }

    #[test]
    fn rejects_corrupt_payloads() {
        assert!(matches!(
            Package::decode("not json"),
            Err(CodecError::Malformed(_))
        ));
        assert!(Package::decode("[]").is_err());
        assert!(Package::decode(r#"{"id":1,"time":1}"#).is_err());
    }

    #[test]
    fn exhaustion_requires_a_ceiling() {
        let mut package = Package::new("jobs", JsonValue::Null, 0);
        package.attempts = 10;
        assert!(!package.is_exhausted());

        package.max_attempts = Some(10);
        assert!(!package.is_exhausted());

        package.attempts = 11;
        assert!(package.is_exhausted());
    }
}
