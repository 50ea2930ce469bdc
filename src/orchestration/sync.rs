//! Sync digest: per-worker progress snapshot, deduplicated by a stable hash
//! so `runSync` can skip delivery when nothing changed.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Markdown task-file candidates, searched in order, relative to a worker's
/// `worktreePath | projectPath`.
fn candidate_paths(worker_index: usize, slug: &str) -> Vec<PathBuf> {
    let idx = worker_index + 1;
    [
        format!(".agents/tasks/worker-{idx}-{slug}.md"),
        format!(".agents/tasks/worker-{idx}.md"),
        format!(".agents/tasks/{slug}.md"),
        ".agents/tasks/task.md".to_string(),
        ".agents/tasks/progress.md".to_string(),
        ".fyp/task.md".to_string(),
        ".fyp/progress.md".to_string(),
        "task.md".to_string(),
        "TASK.md".to_string(),
        "progress.md".to_string(),
        "PROGRESS.md".to_string(),
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub rel_path: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub checklist_done: usize,
    pub checklist_total: usize,
    pub preview: Option<String>,
    pub excerpt: Vec<String>,
}

/// Parses already-read markdown content: checklist boxes `- [ ]`/`- [x]`,
/// first ≤3 non-empty non-fence lines as preview, first ≤24 as excerpt.
pub fn parse_progress(content: &str) -> (usize, usize, Option<String>, Vec<String>) {
    let mut done = 0usize;
    let mut total = 0usize;
    let mut in_fence = false;
    let mut meaningful_lines = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(marker) = checklist_marker(trimmed) {
            total += 1;
            if marker {
                done += 1;
            }
        }
        if !trimmed.is_empty() {
            meaningful_lines.push(trimmed.to_string());
        }
    }
    let preview = if meaningful_lines.is_empty() {
        None
    } else {
        Some(meaningful_lines.iter().take(3).cloned().collect::<Vec<_>>().join(" "))
    };
    let excerpt = meaningful_lines.into_iter().take(24).collect();
    (done, total, preview, excerpt)
}

fn checklist_marker(trimmed: &str) -> Option<bool> {
    let rest = trimmed
        .strip_prefix("- [")
        .or_else(|| trimmed.strip_prefix("* ["))?;
    let mut chars = rest.chars();
    let mark = chars.next()?;
    if chars.next()? != ']' {
        return None;
    }
    Some(mark == 'x' || mark == 'X')
}

/// Reads the first existing candidate task file under `root` for this
/// worker, returning its progress snapshot. `None` if no candidate exists.
pub async fn read_worker_progress(
    root: &Path,
    worker_index: usize,
    slug: &str,
) -> Option<ProgressSnapshot> {
    for rel in candidate_paths(worker_index, slug) {
        let full = root.join(&rel);
        let Ok(metadata) = tokio::fs::metadata(&full).await else {
            continue;
        };
        let Ok(content) = tokio::fs::read_to_string(&full).await else {
            continue;
        };
        let (done, total, preview, excerpt) = parse_progress(&content);
        let updated_at = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        return Some(ProgressSnapshot {
            rel_path: Some(rel.to_string_lossy().to_string()),
            updated_at,
            checklist_done: done,
            checklist_total: total,
            preview,
            excerpt,
        });
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewSource {
    Progress,
    Live,
}

const PLACEHOLDER_STALENESS: chrono::Duration = chrono::Duration::milliseconds(250);

fn placeholder_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)^#\s*Worker\s+\d+\s+Task\s+Card").unwrap(),
            Regex::new(r"BOOTSTRAP-ACK").unwrap(),
            Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").unwrap(),
        ]
    })
}

/// Whether `text` looks like an unedited bootstrap placeholder rather than
/// real worker-authored progress (spec open question (b)).
pub fn is_placeholder_preview(text: &str) -> bool {
    let trimmed = text.trim();
    placeholder_patterns().iter().any(|re| re.is_match(trimmed))
}

/// Chooses which preview to surface for a worker: the progress-file preview
/// by default, or the live terminal preview when the progress preview is an
/// unedited placeholder and the live preview is meaningfully newer.
pub fn select_preview_source(
    progress_mtime: Option<DateTime<Utc>>,
    progress_preview: Option<&str>,
    live_ts: Option<DateTime<Utc>>,
) -> PreviewSource {
    let is_placeholder = progress_preview.map(is_placeholder_preview).unwrap_or(true);
    if !is_placeholder {
        return PreviewSource::Progress;
    }
    match (progress_mtime, live_ts) {
        (Some(mtime), Some(live)) if live > mtime + PLACEHOLDER_STALENESS => PreviewSource::Live,
        (None, Some(_)) => PreviewSource::Live,
        _ => PreviewSource::Progress,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerDigestEntry {
    pub name: String,
    pub running: bool,
    pub attention: usize,
    pub last_preview: Option<String>,
    pub branch: Option<String>,
    pub last_event_id: Option<u64>,
    pub progress: Option<ProgressSnapshot>,
    pub preview_source: PreviewSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncDigest {
    pub workers: Vec<WorkerDigestEntry>,
    pub hash: String,
}

/// Builds a digest and its stable hash from per-worker snapshots. The hash
/// is over the serialized entries so any field change is detected.
pub fn build_digest(entries: Vec<WorkerDigestEntry>) -> SyncDigest {
    let canonical = serde_json::to_vec(&entries).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    let hash = format!("{:x}", hasher.finalize());
    SyncDigest {
        workers: entries,
        hash,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Sent,
    Unchanged,
    CollectOnly,
    InFlight,
    Locked,
    DeliverFailed,
    OrchestratorNotRunning,
    OrchestratorPendingAttention,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checklist_done_and_total_ignoring_fenced_blocks() {
        let md = "# Task\n- [x] step one\n- [ ] step two\n```\n- [x] not counted\n```\n- [X] step three\n";
        let (done, total, preview, excerpt) = parse_progress(md);
        assert_eq!(done, 2);
        assert_eq!(total, 3);
        assert!(preview.unwrap().contains("Task"));
        assert!(excerpt.len() <= 24);
    }

    #[test]
    fn digest_hash_is_stable_for_identical_entries() {
        let entry = WorkerDigestEntry {
            name: "w1".to_string(),
            running: true,
            attention: 0,
            last_preview: Some("ok".to_string()),
            branch: None,
            last_event_id: Some(3),
            progress: None,
            preview_source: PreviewSource::Progress,
        };
        let d1 = build_digest(vec![entry.clone()]);
        let d2 = build_digest(vec![entry]);
        assert_eq!(d1.hash, d2.hash);
    }

    #[test]
    fn digest_hash_changes_when_an_entry_changes() {
        let base = WorkerDigestEntry {
            name: "w1".to_string(),
            running: true,
            attention: 0,
            last_preview: Some("ok".to_string()),
            branch: None,
            last_event_id: Some(3),
            progress: None,
            preview_source: PreviewSource::Progress,
        };
        let mut changed = base.clone();
        changed.attention = 1;
        assert_ne!(build_digest(vec![base]).hash, build_digest(vec![changed]).hash);
    }

    #[test]
    fn preview_source_prefers_progress_when_not_a_placeholder() {
        let now = Utc::now();
        let source = select_preview_source(Some(now - chrono::Duration::milliseconds(500)), Some("impl step 3"), Some(now));
        assert_eq!(source, PreviewSource::Progress);
    }

    #[test]
    fn preview_source_switches_to_live_for_stale_placeholder() {
        let mtime = Utc::now() - chrono::Duration::seconds(5);
        let live_ts = mtime + chrono::Duration::milliseconds(500);
        let source = select_preview_source(Some(mtime), Some("# Worker 1 Task Card"), Some(live_ts));
        assert_eq!(source, PreviewSource::Live);
    }

    #[test]
    fn preview_source_stays_on_progress_when_live_not_much_newer() {
        let mtime = Utc::now() - chrono::Duration::seconds(5);
        let live_ts = mtime + chrono::Duration::milliseconds(100);
        let source = select_preview_source(Some(mtime), Some("BOOTSTRAP-ACK"), Some(live_ts));
        assert_eq!(source, PreviewSource::Progress);
    }

    #[test]
    fn placeholder_regex_matches_timestamped_headers() {
        assert!(is_placeholder_preview("2026-08-01T12:00:00 worker ready"));
        assert!(!is_placeholder_preview("implemented the parser"));
    }
}
