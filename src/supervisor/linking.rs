//! Tool-native session linking: after spawning a session for an agent that
//! logs its own session index externally (e.g. a `~/.codex/sessions` style
//! directory), scan that index to discover which entry the spawn produced
//! and attach its id to the [`super::SessionRecord`].

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

const MAX_ATTEMPTS: u32 = 30;
const BASE_DELAY: Duration = Duration::from_millis(250);
const STEP_DELAY: Duration = Duration::from_millis(650);
const LOOKBACK: chrono::Duration = chrono::Duration::seconds(12);

/// One entry in a tool's external session index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: String,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Something that can list a tool's external session index. Implemented per
/// tool (codex's `~/.codex/sessions`, etc.); kept behind a trait so the scan
/// loop below is tool-agnostic and independently testable.
pub trait SessionIndex {
    fn list(&self, cwd: &Path) -> Vec<IndexEntry>;
}

/// Picks the newest entry under `cwd` that was touched at or after
/// `spawn_time - 12s`, isn't in `pre_spawn_snapshot`, and isn't already
/// claimed by another [`super::SessionRecord`] (`already_linked`).
pub fn pick_linked_session(
    entries: &[IndexEntry],
    cwd: &Path,
    spawn_time: DateTime<Utc>,
    pre_spawn_snapshot: &HashSet<String>,
    already_linked: &HashSet<String>,
) -> Option<String> {
    let cwd_str = cwd.to_string_lossy();
    let cutoff = spawn_time - LOOKBACK;
    entries
        .iter()
        .filter(|e| e.cwd == cwd_str)
        .filter(|e| e.updated_at.max(e.created_at) >= cutoff)
        .filter(|e| !pre_spawn_snapshot.contains(&e.id))
        .filter(|e| !already_linked.contains(&e.id))
        .max_by_key(|e| e.updated_at.max(e.created_at))
        .map(|e| e.id.clone())
}

/// Runs the bounded exponential-backoff scan, calling `index.list(cwd)` on
/// each attempt until [`pick_linked_session`] finds a candidate or the
/// attempt budget is exhausted.
pub async fn scan_for_link(
    index: &dyn SessionIndex,
    cwd: &Path,
    spawn_time: DateTime<Utc>,
    pre_spawn_snapshot: &HashSet<String>,
    already_linked: &HashSet<String>,
) -> Option<String> {
    for _ in 0..MAX_ATTEMPTS {
        let entries = index.list(cwd);
        if let Some(id) =
            pick_linked_session(&entries, cwd, spawn_time, pre_spawn_snapshot, already_linked)
        {
            return Some(id);
        }
        let jitter_ms = rand::rng().random_range(0..STEP_DELAY.as_millis() as u64);
        tokio::time::sleep(BASE_DELAY + Duration::from_millis(jitter_ms)).await;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, cwd: &str, ts: DateTime<Utc>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            cwd: cwd.to_string(),
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn picks_newest_unlinked_entry_under_cwd_within_window() {
        let now = Utc::now();
        let entries = vec![
            entry("old", "/proj", now - chrono::Duration::seconds(30)),
            entry("other-cwd", "/elsewhere", now),
            entry("candidate", "/proj", now - chrono::Duration::seconds(1)),
            entry("pre-existing", "/proj", now),
        ];
        let mut snapshot = HashSet::new();
        snapshot.insert("pre-existing".to_string());
        let picked = pick_linked_session(
            &entries,
            Path::new("/proj"),
            now,
            &snapshot,
            &HashSet::new(),
        );
        assert_eq!(picked, Some("candidate".to_string()));
    }

    #[test]
    fn excludes_already_linked_entries() {
        let now = Utc::now();
        let entries = vec![entry("taken", "/proj", now)];
        let mut linked = HashSet::new();
        linked.insert("taken".to_string());
        let picked =
            pick_linked_session(&entries, Path::new("/proj"), now, &HashSet::new(), &linked);
        assert_eq!(picked, None);
    }

    #[test]
    fn excludes_entries_outside_the_lookback_window() {
        let now = Utc::now();
        let entries = vec![entry("stale", "/proj", now - chrono::Duration::seconds(30))];
        let picked = pick_linked_session(
            &entries,
            Path::new("/proj"),
            now,
            &HashSet::new(),
            &HashSet::new(),
        );
        assert_eq!(picked, None);
    }
}
