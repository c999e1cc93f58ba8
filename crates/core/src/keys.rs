//! Store key layout.
//!
//! Under a configured prefix every logical queue maps to:
//!
//! - `<prefix>-waiting<queue>`: list of packages ready for delivery
//! - `<prefix>-delayed`: one sorted set shared by all queues, scored by due time
//! - `<prefix>-failed`: one dead-letter list shared by all queues

/// Prefix used when a connection does not configure one.
///
/// The braces form a cluster hash tag so every key of one prefix lands on
/// the same slot.
pub const DEFAULT_PREFIX: &str = "{redis-queue}";

const WAITING: &str = "-waiting";
const DELAYED: &str = "-delayed";
const FAILED: &str = "-failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
    delayed: String,
    failed: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            delayed: format!("{prefix}{DELAYED}"),
            failed: format!("{prefix}{FAILED}"),
            prefix,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Waiting list for `queue`.
    pub fn waiting(&self, queue: &str) -> String {
        format!("{}{WAITING}{queue}", self.prefix)
    }

    pub fn delayed(&self) -> &str {
        &self.delayed
    }

    pub fn failed(&self) -> &str {
        &self.failed
    }

    /// Recover the queue name from a waiting-list key.
    pub fn queue_of<'a>(&self, waiting_key: &'a str) -> Option<&'a str> {
        waiting_key
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(WAITING))
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_wire_contract() {
        let keys = QueueKeys::default();
        assert_eq!(keys.waiting("emails"), "{redis-queue}-waitingemails");
        assert_eq!(keys.delayed(), "{redis-queue}-delayed");
        assert_eq!(keys.failed(), "{redis-queue}-failed");
    }

    #[test]
    fn queue_names_round_trip_through_waiting_keys() {
        let keys = QueueKeys::new("app");
        let key = keys.waiting("jobs-high");
        assert_eq!(keys.queue_of(&key), Some("jobs-high"));
        assert_eq!(keys.queue_of("other-waitingjobs"), None);
        assert_eq!(keys.queue_of(keys.failed()), None);
    }

    #[test]
    fn prefixes_isolate_connections() {
        let a = QueueKeys::new("a");
        let b = QueueKeys::new("b");
        assert_ne!(a.waiting("q"), b.waiting("q"));
        assert_ne!(a.delayed(), b.delayed());
    }
}
