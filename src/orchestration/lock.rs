//! Per-orchestration advisory lock with staleness seizure.
//!
//! A mutating operation (create workers, sync, automation-policy change,
//! cleanup) must hold the lock for the orchestration it targets. Locks are
//! advisory: nothing prevents a caller from skipping acquisition, the same
//! way the session-core transport handles don't enforce single-writer
//! access beyond the mutex they're built on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

const STALE_AFTER: chrono::Duration = chrono::Duration::minutes(30);

#[derive(Debug, Clone)]
pub struct LockInfo {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Ok(String),
    Busy(LockInfo),
}

/// One advisory lock slot per orchestration id.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, LockInfo>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquires the lock for `orchestration_id`, seizing it first if the
    /// current holder's lock is older than 30 minutes.
    pub fn acquire(&self, orchestration_id: &str, reason: &str) -> AcquireOutcome {
        if let Some(existing) = self.locks.get(orchestration_id) {
            let age = Utc::now().signed_duration_since(existing.acquired_at);
            if age < STALE_AFTER {
                return AcquireOutcome::Busy(existing.clone());
            }
        }
        let owner = Uuid::new_v4().to_string();
        self.locks.insert(
            orchestration_id.to_string(),
            LockInfo {
                owner: owner.clone(),
                acquired_at: Utc::now(),
                reason: reason.to_string(),
            },
        );
        AcquireOutcome::Ok(owner)
    }

    /// Releases the lock iff `owner` still holds it; a seized lock already
    /// has a different owner and this is a no-op.
    pub fn release(&self, orchestration_id: &str, owner: &str) {
        if let Some(existing) = self.locks.get(orchestration_id) {
            if existing.owner == owner {
                drop(existing);
                self.locks.remove(orchestration_id);
            }
        }
    }

    pub fn is_locked(&self, orchestration_id: &str) -> bool {
        match self.locks.get(orchestration_id) {
            Some(info) => {
                Utc::now().signed_duration_since(info.acquired_at) < STALE_AFTER
            }
            None => false,
        }
    }

    pub fn remove(&self, orchestration_id: &str) {
        self.locks.remove(orchestration_id);
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> HashMap<String, LockInfo> {
        self.locks
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let table = LockTable::new();
        let outcome1 = table.acquire("o1", "create");
        assert!(matches!(outcome1, AcquireOutcome::Ok(_)));
        let AcquireOutcome::Ok(owner) = outcome1 else {
            unreachable!()
        };
        assert!(matches!(table.acquire("o1", "sync"), AcquireOutcome::Busy(_)));
        table.release("o1", &owner);
        assert!(matches!(table.acquire("o1", "sync"), AcquireOutcome::Ok(_)));
    }

    #[test]
    fn stale_lock_is_seized() {
        let table = LockTable::new();
        table.locks.insert(
            "o1".to_string(),
            LockInfo {
                owner: "stale-owner".to_string(),
                acquired_at: Utc::now() - chrono::Duration::minutes(31),
                reason: "create".to_string(),
            },
        );
        assert!(matches!(table.acquire("o1", "cleanup"), AcquireOutcome::Ok(_)));
    }

    #[test]
    fn release_with_wrong_owner_is_a_no_op() {
        let table = LockTable::new();
        let AcquireOutcome::Ok(owner) = table.acquire("o1", "create") else {
            unreachable!()
        };
        table.release("o1", "not-the-owner");
        assert!(matches!(table.acquire("o1", "sync"), AcquireOutcome::Busy(_)));
        table.release("o1", &owner);
    }
}
