//! Append-only per-session transcript chunks and typed event log (C1).
//!
//! Output chunks are batched in memory per session and flushed on a size,
//! count, or timer trigger; reads always flush first so callers never see a
//! torn view of in-flight output.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

/// Accumulated bytes above which a session's buffer is flushed immediately.
pub const FLUSH_BYTES: usize = 96 * 1024;
/// Queued chunk count above which a session's buffer is flushed immediately.
pub const FLUSH_CHUNKS: usize = 120;
/// Timer since the first buffered chunk after which a flush is forced.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(90);

const TRANSCRIPT_LIMIT_MIN: usize = 50;
const TRANSCRIPT_LIMIT_MAX: usize = 2000;
const EVENTS_LIMIT_MIN: usize = 20;
const EVENTS_LIMIT_MAX: usize = 500;

pub fn clamp_transcript_limit(limit: usize) -> usize {
    limit.clamp(TRANSCRIPT_LIMIT_MIN, TRANSCRIPT_LIMIT_MAX)
}

pub fn clamp_events_limit(limit: usize) -> usize {
    limit.clamp(EVENTS_LIMIT_MIN, EVENTS_LIMIT_MAX)
}

/// A contiguous slice of subprocess output, durable once flushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub session_id: String,
    pub id: u64,
    pub ts: DateTime<Utc>,
    pub chunk: Vec<u8>,
}

/// The closed set of event kinds a session-relevant occurrence may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionCreated,
    SessionRestart,
    SessionExit,
    SessionToolLink,
    SessionGit,
    SessionMeta,
    Input,
    Interrupt,
    Stop,
    Kill,
    ProfileStartup,
    InboxRespond,
    InboxDismiss,
    OrchestrationCreated,
    OrchestrationDispatch,
    OrchestrationCommandExecuted,
    OrchestrationQuestionOpen,
    OrchestrationQuestionResolved,
    OrchestrationQuestionTimeout,
    OrchestrationQuestionBatchDispatched,
    OrchestrationQuestionDispatchFailed,
    OrchestrationSteeringReviewDispatched,
    OrchestrationSteeringReviewFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub id: u64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<u64>,
}

#[derive(Default)]
struct SessionBuffer {
    pending: Vec<u8>,
    pending_chunks: usize,
    first_buffered_at: Option<std::time::Instant>,
}

struct SessionLog {
    chunks: VecDeque<TranscriptChunk>,
    events: VecDeque<Event>,
    next_chunk_id: u64,
    next_event_id: u64,
    buffer: SessionBuffer,
}

impl SessionLog {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            events: VecDeque::new(),
            next_chunk_id: 1,
            next_event_id: 1,
            buffer: SessionBuffer::default(),
        }
    }

    fn should_flush(&self) -> bool {
        self.buffer.pending.len() > FLUSH_BYTES
            || self.buffer.pending_chunks > FLUSH_CHUNKS
            || self
                .buffer
                .first_buffered_at
                .is_some_and(|t| t.elapsed() >= FLUSH_INTERVAL)
    }

    fn flush(&mut self) {
        if self.buffer.pending.is_empty() {
            return;
        }
        let chunk = TranscriptChunk {
            session_id: String::new(), // filled in by caller
            id: self.next_chunk_id,
            ts: Utc::now(),
            chunk: std::mem::take(&mut self.buffer.pending),
        };
        self.next_chunk_id += 1;
        self.chunks.push_back(chunk);
        self.buffer.pending_chunks = 0;
        self.buffer.first_buffered_at = None;
    }
}

/// The Transcript Store. One instance is shared (by `Arc`) across the
/// supervisor, interpreter feed path, and any readers.
pub struct TranscriptStore {
    sessions: DashMap<String, Arc<Mutex<SessionLog>>>,
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    fn log_for(&self, session_id: &str) -> Arc<Mutex<SessionLog>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionLog::new())))
            .clone()
    }

    /// Appends output to the session's in-memory batch, flushing
    /// immediately if a trigger is already met.
    pub async fn append_output(&self, session_id: &str, chunk: &[u8]) {
        let log = self.log_for(session_id);
        let mut guard = log.lock().await;
        if guard.buffer.pending.is_empty() {
            guard.buffer.first_buffered_at = Some(std::time::Instant::now());
        }
        guard.buffer.pending.extend_from_slice(chunk);
        guard.buffer.pending_chunks += 1;
        if guard.should_flush() {
            guard.flush();
        }
    }

    /// Appends a typed event, returning its per-session monotonic id.
    pub async fn append_event(
        &self,
        session_id: &str,
        kind: EventKind,
        data: serde_json::Value,
    ) -> u64 {
        let log = self.log_for(session_id);
        let mut guard = log.lock().await;
        let id = guard.next_event_id;
        guard.next_event_id += 1;
        guard.events.push_back(Event {
            session_id: session_id.to_string(),
            id,
            ts: Utc::now(),
            kind,
            data,
        });
        id
    }

    /// Forces a flush of any buffered output for the session. Session exit
    /// and page reads must call this before returning.
    pub async fn flush(&self, session_id: &str) {
        if let Some(log) = self.sessions.get(session_id).map(|e| e.clone()) {
            let mut guard = log.lock().await;
            guard.flush();
        }
    }

    pub async fn get_transcript(
        &self,
        session_id: &str,
        limit: usize,
        cursor: Option<u64>,
    ) -> Result<Page<TranscriptChunk>> {
        self.flush(session_id).await;
        let limit = clamp_transcript_limit(limit);
        let Some(log) = self.sessions.get(session_id).map(|e| e.clone()) else {
            return Ok(Page {
                items: vec![],
                next_cursor: None,
            });
        };
        let guard = log.lock().await;
        let start = cursor.unwrap_or(0);
        let items: Vec<TranscriptChunk> = guard
            .chunks
            .iter()
            .filter(|c| c.id > start)
            .take(limit)
            .map(|c| TranscriptChunk {
                session_id: session_id.to_string(),
                ..c.clone()
            })
            .collect();
        let next_cursor = items.last().map(|c| c.id);
        Ok(Page { items, next_cursor })
    }

    pub async fn get_events(
        &self,
        session_id: &str,
        limit: usize,
        cursor: Option<u64>,
    ) -> Result<Page<Event>> {
        let limit = clamp_events_limit(limit);
        let Some(log) = self.sessions.get(session_id).map(|e| e.clone()) else {
            return Ok(Page {
                items: vec![],
                next_cursor: None,
            });
        };
        let guard = log.lock().await;
        let start = cursor.unwrap_or(0);
        let items: Vec<Event> = guard
            .events
            .iter()
            .filter(|e| e.id > start)
            .take(limit)
            .cloned()
            .collect();
        let next_cursor = items.last().map(|e| e.id);
        Ok(Page { items, next_cursor })
    }

    pub async fn get_latest_event(&self, session_id: &str, kind: EventKind) -> Option<Event> {
        let log = self.sessions.get(session_id)?.clone();
        let guard = log.lock().await;
        guard.events.iter().rev().find(|e| e.kind == kind).cloned()
    }

    /// Drops all state for a session (used by orchestration cleanup).
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

/// Normalizes trailing newline-only input to carriage-return termination,
/// matching the boundary behavior every pty write must honor.
pub fn normalize_trailing_cr(input: &str) -> String {
    if input.ends_with('\r') {
        input.to_string()
    } else if let Some(stripped) = input.strip_suffix('\n') {
        format!("{stripped}\r")
    } else {
        format!("{input}\r")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_makes_output_readable() {
        let store = TranscriptStore::new();
        store.append_output("s1", b"hello").await;
        let page = store.get_transcript("s1", 50, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].chunk, b"hello");
    }

    #[tokio::test]
    async fn reads_are_a_prefix_across_time() {
        let store = TranscriptStore::new();
        store.append_output("s1", b"a").await;
        let first = store.get_transcript("s1", 50, None).await.unwrap();
        store.append_output("s1", b"b").await;
        let second = store.get_transcript("s1", 50, None).await.unwrap();
        assert!(second.items.len() >= first.items.len());
        assert_eq!(second.items[0].chunk, first.items[0].chunk);
    }

    #[tokio::test]
    async fn events_are_monotonic_per_session() {
        let store = TranscriptStore::new();
        let a = store
            .append_event("s1", EventKind::Input, serde_json::json!({}))
            .await;
        let b = store
            .append_event("s1", EventKind::Interrupt, serde_json::json!({}))
            .await;
        assert!(b > a);
    }

    #[test]
    fn clamps_transcript_and_events_limits() {
        assert_eq!(clamp_transcript_limit(10), 50);
        assert_eq!(clamp_transcript_limit(5000), 2000);
        assert_eq!(clamp_events_limit(1), 20);
        assert_eq!(clamp_events_limit(9999), 500);
    }

    #[test]
    fn normalizes_trailing_newline_to_carriage_return() {
        assert_eq!(normalize_trailing_cr("go\n"), "go\r");
        assert_eq!(normalize_trailing_cr("go\r"), "go\r");
        assert_eq!(normalize_trailing_cr("go"), "go\r");
    }
}
