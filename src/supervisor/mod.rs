//! Session Supervisor (C4): subprocess lifecycle for pty and RPC sessions,
//! output batching into the Transcript Store, and interpreter-driven
//! attention/directive detection.

pub mod linking;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use session_core::core::pty::clamp_size;
use session_core::{SessionConfig, SessionId, SessionManager, TransportKind};

use crate::error::{Error, Result};
use crate::inbox::AttentionInbox;
use crate::interpreter::{Directive, Scanner};
use crate::transcript::{normalize_trailing_cr, EventKind, TranscriptStore};

const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(1400);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(15);
/// Recent-activity window the orchestration layer uses to classify a
/// worker as idle; exposed here because the supervisor owns the timestamps
/// it's computed from.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Env-overridable spawn/teardown timing, read once at startup. Config-file
/// parsing is out of scope; this is the handful of values worth tuning
/// without a rebuild (test suites shorten both).
#[derive(Debug, Clone, Copy)]
pub struct SpawnDefaults {
    pub close_grace: Duration,
    pub ready_timeout: Duration,
}

impl SpawnDefaults {
    pub fn from_env() -> Self {
        Self {
            close_grace: env_millis("AGENTD_CLOSE_GRACE_MS").unwrap_or(DEFAULT_CLOSE_GRACE),
            ready_timeout: env_millis("AGENTD_READY_TIMEOUT_MS").unwrap_or(DEFAULT_READY_TIMEOUT),
        }
    }
}

impl Default for SpawnDefaults {
    fn default() -> Self {
        Self {
            close_grace: DEFAULT_CLOSE_GRACE,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key).ok()?.parse::<u64>().ok().map(Duration::from_millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Codex,
    Claude,
    Opencode,
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub tool: ToolKind,
    pub profile_id: Option<String>,
    pub cwd: PathBuf,
    pub transport: TransportKind,
    pub binary: Option<String>,
    pub extra_args: Vec<String>,
    pub env: HashMap<String, String>,
    pub label: Option<String>,
    pub pinned_slot: Option<u8>,
    pub workspace_key: Option<String>,
}

/// The spec's Session entity, layered over `session-core`'s transport
/// plumbing with the orchestration-facing attributes the core doesn't know
/// about (tool kind, pinned slot, tool-native linkage, bootstrap state).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub tool: ToolKind,
    pub profile_id: Option<String>,
    pub transport: TransportKind,
    pub cwd: PathBuf,
    pub tool_session_id: Option<String>,
    pub workspace_key: Option<String>,
    pub label: Option<String>,
    pub pinned_slot: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub last_preview: Option<(String, DateTime<Utc>)>,
    pub bootstrap_fallback: Option<BootstrapFallback>,
}

#[derive(Debug, Clone)]
pub struct BootstrapFallback {
    pub text: String,
    pub queued_at: DateTime<Utc>,
    pub retried: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Live,
    NeedsInput,
    WaitingOrDone,
    Idle,
}

/// Computes the worker activity state per spec 4.5.3 step 2.
pub fn activity_state(
    running: bool,
    attention_count: usize,
    last_preview_at: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
) -> ActivityState {
    if !running {
        return ActivityState::Idle;
    }
    let most_recent = [last_preview_at, last_event_at].into_iter().flatten().max();
    let idle_for = most_recent
        .map(|ts| Utc::now().signed_duration_since(ts))
        .unwrap_or(chrono::Duration::max_value());
    let idle_60s = idle_for >= chrono::Duration::seconds(60);
    if !idle_60s {
        return ActivityState::Live;
    }
    if attention_count > 0 {
        ActivityState::NeedsInput
    } else {
        ActivityState::WaitingOrDone
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputBroadcast {
    pub session_id: String,
    pub chunk: Vec<u8>,
    pub ts: DateTime<Utc>,
}

/// Result of running the output pipeline on one chunk (spec 4.4, steps 3-4).
pub struct PipelineResult {
    pub preview_updated: bool,
    pub approval_created: Option<u64>,
    pub directives: Vec<Directive>,
    pub completion_cue: bool,
    pub question_cue: bool,
}

pub struct SessionSupervisor {
    manager: Arc<SessionManager>,
    transcript: Arc<TranscriptStore>,
    inbox: Arc<AttentionInbox>,
    records: DashMap<String, SessionRecord>,
    scanners: DashMap<String, Arc<Mutex<Scanner>>>,
    output_tx: DashMap<String, broadcast::Sender<OutputBroadcast>>,
    defaults: SpawnDefaults,
}

impl SessionSupervisor {
    pub fn new(transcript: Arc<TranscriptStore>, inbox: Arc<AttentionInbox>) -> Self {
        Self {
            manager: Arc::new(SessionManager::new()),
            transcript,
            inbox,
            records: DashMap::new(),
            scanners: DashMap::new(),
            output_tx: DashMap::new(),
            defaults: SpawnDefaults::from_env(),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        self.defaults.ready_timeout
    }

    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<String> {
        if let Some(slot) = req.pinned_slot {
            if !(1..=6).contains(&slot) {
                return Err(Error::bad_size(format!(
                    "pinned slot {slot} must be in 1..=6"
                )));
            }
        }
        let config = SessionConfig {
            name: req.label.clone(),
            working_directory: req.cwd.clone(),
            environment: req.env,
            binary: req.binary,
            args: req.extra_args,
            transport: req.transport,
            pty_size: (24, 80),
            timeout: None,
            force_headless: false,
            allow_headless_fallback: true,
        };
        let session = self
            .manager
            .create_session_with_config(config)
            .await
            .map_err(|e| Error::spawn_failed(e.to_string()))?;
        let id = session.id.to_string();

        session
            .start()
            .await
            .map_err(|e| Error::spawn_failed(e.to_string()))?;

        let now = Utc::now();
        self.records.insert(
            id.clone(),
            SessionRecord {
                id: id.clone(),
                tool: req.tool,
                profile_id: req.profile_id,
                transport: req.transport,
                cwd: req.cwd,
                tool_session_id: None,
                workspace_key: req.workspace_key,
                label: req.label,
                pinned_slot: req.pinned_slot,
                created_at: now,
                updated_at: now,
                exit_code: None,
                signal: None,
                last_preview: None,
                bootstrap_fallback: None,
            },
        );
        self.scanners
            .insert(id.clone(), Arc::new(Mutex::new(Scanner::new(id.clone()))));
        let (tx, _rx) = broadcast::channel(256);
        self.output_tx.insert(id.clone(), tx);

        self.transcript
            .append_event(&id, EventKind::SessionCreated, serde_json::json!({}))
            .await;

        Ok(id)
    }

    pub fn subscribe_output(&self, session_id: &str) -> Option<broadcast::Receiver<OutputBroadcast>> {
        self.output_tx.get(session_id).map(|tx| tx.subscribe())
    }

    /// Writes raw bytes to a pty session. Fails with `session_not_running`
    /// when the session isn't live.
    pub async fn write(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        let session = self.get_running_session(session_id).await?;
        session
            .write_input(bytes)
            .await
            .map_err(|e| Error::session_not_running(e.to_string()))?;
        self.transcript
            .append_event(
                session_id,
                EventKind::Input,
                serde_json::json!({ "bytes": bytes.len() }),
            )
            .await;
        Ok(())
    }

    /// Writes text, normalizing a trailing newline-only input to `\r`. If a
    /// bootstrap fallback is queued and no interpreter preview activity has
    /// been observed since it was queued, the bootstrap text is prepended
    /// and the fallback is cleared.
    pub async fn write_text(&self, session_id: &str, text: &str) -> Result<()> {
        let prefixed = self.apply_bootstrap_prefix(session_id, text);
        self.write(session_id, normalize_trailing_cr(&prefixed).as_bytes())
            .await
    }

    fn apply_bootstrap_prefix(&self, session_id: &str, text: &str) -> String {
        let Some(mut record) = self.records.get_mut(session_id) else {
            return text.to_string();
        };
        let Some(fallback) = record.bootstrap_fallback.take() else {
            return text.to_string();
        };
        let preview_postdates_queue = record
            .last_preview
            .as_ref()
            .is_some_and(|(_, at)| *at >= fallback.queued_at);
        if preview_postdates_queue {
            text.to_string()
        } else {
            format!("{}\n{}", fallback.text, text)
        }
    }

    /// Auto-retry: resend the queued bootstrap text once, 2.6s after it was
    /// queued, if no interpreter preview activity has been observed since.
    /// Intended to be spawned by a caller holding `Arc<SessionSupervisor>`
    /// (the orchestration engine, right after session creation).
    pub async fn retry_bootstrap_if_idle(self: &Arc<Self>, session_id: &str) {
        const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_millis(2600);
        tokio::time::sleep(BOOTSTRAP_RETRY_DELAY).await;
        let Some(mut record) = self.records.get_mut(session_id) else {
            return;
        };
        let Some(fallback) = record.bootstrap_fallback.clone() else {
            return;
        };
        if fallback.retried {
            return;
        }
        let activity_since_queue = record
            .last_preview
            .as_ref()
            .is_some_and(|(_, at)| *at >= fallback.queued_at);
        if activity_since_queue {
            return;
        }
        record.bootstrap_fallback = None;
        drop(record);
        let _ = self
            .write(session_id, normalize_trailing_cr(&fallback.text).as_bytes())
            .await;
    }

    /// Starts an RPC turn.
    pub async fn start_turn(&self, session_id: &str, text: &str) -> Result<()> {
        let session = self.get_running_session(session_id).await?;
        let outcome = session.rpc_start_turn(text).await;
        match outcome {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(Error::rpc_failed(e.to_string())),
            None => Err(Error::unsupported_transport(
                "start_turn requires an rpc session",
            )),
        }
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        let session = self.get_running_session(session_id).await?;
        match session.config.transport {
            TransportKind::Pty => {
                // tool-specific interrupt byte: ETX (Ctrl-C) for interactive
                // CLIs; the coordinator and workers all speak terminal TUIs.
                session
                    .write_input(b"\x03")
                    .await
                    .map_err(|e| Error::session_not_running(e.to_string()))?;
            }
            TransportKind::Rpc => {
                let outcome = session.rpc_interrupt().await;
                match outcome {
                    Some(Ok(())) => {}
                    Some(Err(e)) => return Err(Error::rpc_failed(e.to_string())),
                    None => return Err(Error::unsupported_transport("not an rpc session")),
                }
            }
        }
        self.transcript
            .append_event(session_id, EventKind::Interrupt, serde_json::json!({}))
            .await;
        Ok(())
    }

    pub async fn stop(&self, session_id: &str) -> Result<()> {
        self.close(session_id, false, self.defaults.close_grace).await
    }

    pub async fn kill(&self, session_id: &str) -> Result<()> {
        self.close(session_id, true, Duration::ZERO).await
    }

    /// Ordered teardown: graceful stop, escalating to kill after `grace`.
    pub async fn close(&self, session_id: &str, force: bool, grace: Duration) -> Result<()> {
        let id = SessionId::parse_str(session_id)
            .map_err(|e| Error::bad_id(format!("{session_id}: {e}")))?;
        let session = self
            .manager
            .get_session(&id)
            .ok_or_else(|| Error::session_not_found(session_id.to_string()))?;

        if force {
            session
                .stop()
                .await
                .map_err(|e| Error::write_failed(e.to_string()))?;
        } else {
            // Best-effort interrupt, then give the process `grace` to exit on
            // its own before escalating to a hard stop.
            if session.config.transport == TransportKind::Pty {
                let _ = session.write_input(b"\x03").await;
            } else {
                let _ = session.rpc_interrupt().await;
            }
            tokio::time::sleep(grace).await;
            if session.is_running().await {
                session
                    .stop()
                    .await
                    .map_err(|e| Error::write_failed(e.to_string()))?;
            }
        }

        self.transcript.flush(session_id).await;
        self.transcript
            .append_event(session_id, EventKind::SessionExit, serde_json::json!({}))
            .await;
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Resizes a pty session, clamping cols/rows to the supported bounds.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self.get_running_session(session_id).await?;
        if session.config.transport != TransportKind::Pty {
            return Ok(());
        }
        let (clamped_rows, clamped_cols) = clamp_size(rows, cols);
        session
            .resize(clamped_rows, clamped_cols)
            .await
            .map_err(|e| Error::write_failed(e.to_string()))
    }

    /// Runs the output pipeline: batches into the Transcript Store, updates
    /// preview, runs the interpreter, and creates attention items. Returns
    /// what changed so the caller can broadcast it (broadcasting itself is
    /// the control surface's job).
    pub async fn ingest_output(&self, session_id: &str, chunk: &[u8]) -> Result<PipelineResult> {
        self.transcript.append_output(session_id, chunk).await;

        let scanner = self
            .scanners
            .get(session_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::session_not_found(session_id.to_string()))?;
        let report = {
            let mut guard = scanner.lock().await;
            guard.feed(chunk)
        };

        let preview_updated = report.preview.is_some();
        if let Some(preview) = &report.preview {
            if let Some(mut record) = self.records.get_mut(session_id) {
                record.last_preview = Some((preview.text.clone(), Utc::now()));
            }
        }

        let mut approval_created = None;
        if let Some(candidate) = report.approval {
            let (_, id) = self
                .inbox
                .create_from_approval(session_id, candidate)
                .await;
            approval_created = Some(id);
        }

        if let Some(tx) = self.output_tx.get(session_id) {
            let _ = tx.send(OutputBroadcast {
                session_id: session_id.to_string(),
                chunk: chunk.to_vec(),
                ts: Utc::now(),
            });
        }

        Ok(PipelineResult {
            preview_updated,
            approval_created,
            directives: report.directives,
            completion_cue: report.completion_cue,
            question_cue: report.question_cue,
        })
    }

    /// Reads one chunk of subprocess output and runs it through the
    /// pipeline. The orchestration engine's output pump calls this in a
    /// loop; it is the only path that drives spec section 2's data flow
    /// (subprocess stdout -> interpreter -> transcript -> attention).
    pub async fn read_and_ingest(&self, session_id: &str) -> Result<PipelineResult> {
        let id = SessionId::parse_str(session_id)
            .map_err(|e| Error::bad_id(format!("{session_id}: {e}")))?;
        let session = self
            .manager
            .get_session(&id)
            .ok_or_else(|| Error::session_not_found(session_id.to_string()))?;
        let chunk = session
            .read_output()
            .await
            .map_err(|e| Error::session_not_running(e.to_string()))?;
        if chunk.is_empty() {
            return Ok(PipelineResult {
                preview_updated: false,
                approval_created: None,
                directives: vec![],
                completion_cue: false,
                question_cue: false,
            });
        }
        self.ingest_output(session_id, &chunk).await
    }

    pub fn record(&self, session_id: &str) -> Option<SessionRecord> {
        self.records.get(session_id).map(|r| r.clone())
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        let Ok(id) = SessionId::parse_str(session_id) else {
            return false;
        };
        match self.manager.get_session(&id) {
            Some(session) => session.is_running().await,
            None => false,
        }
    }

    pub fn register_bootstrap_fallback(&self, session_id: &str, text: String) {
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.bootstrap_fallback = Some(BootstrapFallback {
                text,
                queued_at: Utc::now(),
                retried: false,
            });
        }
    }

    pub fn clear_bootstrap_fallback(&self, session_id: &str) {
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.bootstrap_fallback = None;
        }
    }

    pub fn link_tool_session(&self, session_id: &str, tool_session_id: String) {
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.tool_session_id = Some(tool_session_id);
        }
    }

    pub async fn remove_session(&self, session_id: &str) {
        if let Ok(id) = SessionId::parse_str(session_id) {
            let _ = self.manager.remove_session(&id).await;
        }
        self.records.remove(session_id);
        self.scanners.remove(session_id);
        self.output_tx.remove(session_id);
        self.transcript.remove_session(session_id);
    }

    async fn get_running_session(&self, session_id: &str) -> Result<Arc<session_core::AISession>> {
        let id = SessionId::parse_str(session_id)
            .map_err(|e| Error::bad_id(format!("{session_id}: {e}")))?;
        let session = self
            .manager
            .get_session(&id)
            .ok_or_else(|| Error::session_not_found(session_id.to_string()))?;
        if !session.is_running().await {
            return Err(Error::session_not_running(session_id.to_string()));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn activity_state_classifies_live_vs_idle() {
        let now = Utc::now();
        assert_eq!(
            activity_state(true, 0, Some(now), None),
            ActivityState::Live
        );
        let stale = now - ChronoDuration::seconds(90);
        assert_eq!(
            activity_state(true, 1, Some(stale), None),
            ActivityState::NeedsInput
        );
        assert_eq!(
            activity_state(true, 0, Some(stale), None),
            ActivityState::WaitingOrDone
        );
        assert_eq!(activity_state(false, 0, None, None), ActivityState::Idle);
    }

    #[tokio::test]
    async fn create_session_rejects_out_of_range_pinned_slot() {
        let supervisor = SessionSupervisor::new(
            Arc::new(TranscriptStore::new()),
            Arc::new(AttentionInbox::new()),
        );
        let req = CreateSessionRequest {
            tool: ToolKind::Codex,
            profile_id: None,
            cwd: std::env::temp_dir(),
            transport: TransportKind::Pty,
            binary: Some("/bin/sh".to_string()),
            extra_args: vec![],
            env: HashMap::new(),
            label: None,
            pinned_slot: Some(7),
            workspace_key: None,
        };
        let err = supervisor.create_session(req).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadSize);
    }
}
