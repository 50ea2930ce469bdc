//! Core session primitives: spawn, write to, read from, and tear down a
//! single interactive subprocess over either a pty or an RPC transport.
//!
//! This module is transport-agnostic about *what* runs inside the session —
//! the orchestration layer decides which tool binary and argv to use. It only
//! owns process lifecycle, output buffering, and the write/read/resize
//! surface that both transports expose uniformly through [`TransportHandle`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod lifecycle;
pub mod piped_shell;
pub mod pty;
pub mod transport;

pub use transport::TransportHandle;

/// Errors surfaced by the session transport layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("pty error: {0}")]
    PtyError(String),

    #[error("process error: {0}")]
    ProcessError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Opaque, unique handle identifying a transport-level session.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transport-level session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionStatus {
    #[default]
    Initializing,
    Running,
    Paused,
    Terminating,
    Terminated,
    Error,
}

/// Which wire transport a session's subprocess speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Pty,
    Rpc,
}

/// Configuration used to spawn a session's subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub name: Option<String>,
    pub working_directory: PathBuf,
    pub environment: HashMap<String, String>,
    /// Binary to execute (tool CLI, or a shell when `binary` is `None`).
    pub binary: Option<String>,
    pub args: Vec<String>,
    pub transport: TransportKind,
    /// Initial pty size (rows, cols); ignored for rpc transport.
    pub pty_size: (u16, u16),
    pub timeout: Option<Duration>,
    /// Force piped (non-pty) execution even when transport is `Pty`; useful
    /// in sandboxes that cannot allocate a pseudo-terminal.
    pub force_headless: bool,
    /// Allow automatic fallback to a piped shell when pty allocation fails
    /// with a permission error.
    pub allow_headless_fallback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: None,
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            environment: HashMap::new(),
            binary: None,
            args: Vec::new(),
            transport: TransportKind::Pty,
            pty_size: (24, 80),
            timeout: None,
            force_headless: false,
            allow_headless_fallback: true,
        }
    }
}

/// A single spawned interactive subprocess and its transport handle.
pub struct AISession {
    pub id: SessionId,
    pub config: SessionConfig,
    pub status: RwLock<SessionStatus>,
    terminal: Arc<RwLock<Option<TransportHandle>>>,
    pub created_at: DateTime<Utc>,
    pub last_activity: Arc<RwLock<DateTime<Utc>>>,
    pub metadata: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl AISession {
    pub async fn new(config: SessionConfig) -> Result<Self> {
        Self::new_with_id(SessionId::new(), config, Utc::now()).await
    }

    pub async fn new_with_id(
        id: SessionId,
        config: SessionConfig,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id,
            config,
            status: RwLock::new(SessionStatus::Initializing),
            terminal: Arc::new(RwLock::new(None)),
            created_at,
            last_activity: Arc::new(RwLock::new(Utc::now())),
            metadata: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn start(&self) -> Result<()> {
        lifecycle::start_session(self).await
    }

    pub async fn stop(&self) -> Result<()> {
        lifecycle::stop_session(self).await
    }

    pub async fn pause(&self) -> Result<()> {
        lifecycle::pause_session(self).await
    }

    pub async fn resume(&self) -> Result<()> {
        lifecycle::resume_session(self).await
    }

    pub async fn write_input(&self, data: &[u8]) -> Result<()> {
        let guard = self.terminal.read().await;
        match guard.as_ref() {
            Some(terminal) => {
                terminal.write(data).await?;
                drop(guard);
                *self.last_activity.write().await = Utc::now();
                Ok(())
            }
            None => Err(anyhow::anyhow!("session not started")),
        }
    }

    pub async fn read_output(&self) -> Result<Vec<u8>> {
        let guard = self.terminal.read().await;
        match guard.as_ref() {
            Some(terminal) => {
                let output = terminal.read().await?;
                drop(guard);
                if !output.is_empty() {
                    *self.last_activity.write().await = Utc::now();
                }
                Ok(output)
            }
            None => Err(anyhow::anyhow!("session not started")),
        }
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let guard = self.terminal.read().await;
        match guard.as_ref() {
            Some(TransportHandle::Pty(pty)) => pty.resize(rows, cols).await,
            Some(_) => Ok(()),
            None => Err(anyhow::anyhow!("session not started")),
        }
    }

    pub async fn is_running(&self) -> bool {
        match self.terminal.read().await.as_ref() {
            Some(terminal) => terminal.is_running().await,
            None => false,
        }
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    pub async fn set_metadata(&self, key: String, value: serde_json::Value) {
        self.metadata.write().await.insert(key, value);
    }

    pub async fn get_metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.read().await.get(key).cloned()
    }

    /// Sends `startTurn` over the underlying RPC transport. Returns `None`
    /// for pty sessions.
    pub async fn rpc_start_turn(&self, text: &str) -> Option<Result<crate::rpc::JsonRpcResponse>> {
        match self.terminal.read().await.as_ref() {
            Some(TransportHandle::Rpc(rpc)) => Some(rpc.start_turn(text).await),
            _ => None,
        }
    }

    /// Sends `interrupt` over the underlying RPC transport. Returns `None`
    /// for pty sessions.
    pub async fn rpc_interrupt(&self) -> Option<Result<()>> {
        match self.terminal.read().await.as_ref() {
            Some(TransportHandle::Rpc(rpc)) => Some(rpc.interrupt().await),
            _ => None,
        }
    }

    async fn set_terminal(&self, terminal: Option<TransportHandle>) {
        *self.terminal.write().await = terminal;
    }

    async fn take_terminal(&self) -> Option<TransportHandle> {
        self.terminal.write().await.take()
    }
}

/// Registry of live sessions, keyed by [`SessionId`].
pub struct SessionManager {
    sessions: Arc<DashMap<SessionId, Arc<AISession>>>,
    default_config: SessionConfig,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            default_config: SessionConfig::default(),
        }
    }

    pub async fn create_session(&self) -> Result<Arc<AISession>> {
        self.create_session_with_config(self.default_config.clone())
            .await
    }

    pub async fn create_session_with_config(
        &self,
        config: SessionConfig,
    ) -> Result<Arc<AISession>> {
        let session = Arc::new(AISession::new(config).await?);
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn restore_session(
        &self,
        id: SessionId,
        config: SessionConfig,
        created_at: DateTime<Utc>,
    ) -> Result<Arc<AISession>> {
        if self.sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id).into());
        }
        let session = Arc::new(AISession::new_with_id(id.clone(), config, created_at).await?);
        self.sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn get_session(&self, id: &SessionId) -> Option<Arc<AISession>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn list_session_refs(&self) -> Vec<Arc<AISession>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub async fn remove_session(&self, id: &SessionId) -> Result<()> {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.stop().await?;
        }
        Ok(())
    }

    pub async fn cleanup_terminated(&self) -> Result<usize> {
        let terminated: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .status
                    .try_read()
                    .map(|s| *s == SessionStatus::Terminated)
                    .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in &terminated {
            self.sessions.remove(id);
        }
        Ok(terminated.len())
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_ids() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[tokio::test]
    async fn manager_tracks_sessions() {
        let manager = SessionManager::new();
        let session = manager.create_session().await.unwrap();
        assert!(manager.get_session(&session.id).is_some());
        assert_eq!(manager.list_sessions().len(), 1);
        manager.remove_session(&session.id).await.unwrap();
        assert!(manager.get_session(&session.id).is_none());
    }
}
