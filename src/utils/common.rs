//! Small utilities reused by the orchestration engine and attention inbox.

/// Timestamp helpers used for staleness checks (lock seizure, idle workers).
pub mod time {
    use chrono::{DateTime, Utc};

    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    pub fn age_since(timestamp: DateTime<Utc>) -> chrono::Duration {
        now().signed_duration_since(timestamp)
    }

    pub fn is_older_than(timestamp: DateTime<Utc>, duration: chrono::Duration) -> bool {
        age_since(timestamp) > duration
    }
}

/// Error-construction helpers used at boundaries where an `anyhow::Error`
/// is more convenient than a typed [`crate::error::Error`].
pub mod errors {
    use anyhow::anyhow;

    pub fn not_found_error(entity_type: &str, id: &str) -> anyhow::Error {
        anyhow!("{entity_type} not found: {id}")
    }

    pub fn invalid_state_error(current_state: &str, expected_state: &str) -> anyhow::Error {
        anyhow!("invalid state transition: expected {expected_state}, was {current_state}")
    }
}

#[cfg(test)]
mod tests {
    use super::time::*;
    use chrono::Duration;

    #[test]
    fn age_since_is_non_negative_for_past_timestamps() {
        let past = now() - Duration::seconds(5);
        assert!(age_since(past) >= Duration::seconds(5));
    }

    #[test]
    fn is_older_than_respects_threshold() {
        let past = now() - Duration::minutes(31);
        assert!(is_older_than(past, Duration::minutes(30)));
        assert!(!is_older_than(now(), Duration::minutes(30)));
    }
}
