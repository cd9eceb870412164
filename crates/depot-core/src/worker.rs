//! Worker registrations, used for introspection and stale-owner detection.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: String,
    /// Number of concurrent build slots.
    pub capacity: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active_jobs: u32,
}

impl WorkerRegistration {
    pub fn new(id: impl Into<String>, capacity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            capacity,
            started_at: now,
            last_heartbeat: now,
            active_jobs: 0,
        }
    }

    /// True if no heartbeat has been seen within `ttl` of `now`.
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness() {
        let mut reg = WorkerRegistration::new("pool-a", 3);
        let now = Utc::now();
        reg.last_heartbeat = now - Duration::seconds(90);

        assert!(reg.is_stale(Duration::seconds(60), now));
        assert!(!reg.is_stale(Duration::seconds(120), now));
    }
}
