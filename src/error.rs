//! Domain error taxonomy for the orchestration control plane.
//!
//! Every public operation returns [`Error`] so callers (the command router,
//! the control surface) can map a failure onto a stable machine-readable
//! `code` without string-matching a display message.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Domain error code, grouped the way section 7 of the design groups them.
/// Serialized as the wire-facing snake_case string callers match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // validation
    BadId,
    BadPath,
    BadTool,
    BadMode,
    BadSize,
    MissingText,
    MissingTask,
    MissingWorkers,
    InvalidCommandPayload,
    UnknownCommand,
    // authz/policy
    Unauthorized,
    CommandPolicyBlocked,
    // lifecycle
    SessionNotFound,
    SessionNotRunning,
    SessionClosing,
    SpawnFailed,
    UnsupportedTransport,
    NoThread,
    // orchestration
    OrchestrationLocked,
    WorktreeCreateFailed,
    WorkerBranchRequiresGitRepo,
    OrchestrationFailed,
    NotActive,
    OrchestratorPendingAttention,
    CollectOnly,
    Cooldown,
    // tool/native
    CodexNativeUnavailable,
    CodexNativeFailed,
    CodexAppServerUnavailable,
    // resource
    WriteFailed,
    RpcFailed,
    DeliverFailed,
    OrchestratorNotRunning,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadId => "bad_id",
            ErrorCode::BadPath => "bad_path",
            ErrorCode::BadTool => "bad_tool",
            ErrorCode::BadMode => "bad_mode",
            ErrorCode::BadSize => "bad_size",
            ErrorCode::MissingText => "missing_text",
            ErrorCode::MissingTask => "missing_task",
            ErrorCode::MissingWorkers => "missing_workers",
            ErrorCode::InvalidCommandPayload => "invalid_command_payload",
            ErrorCode::UnknownCommand => "unknown_command",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::CommandPolicyBlocked => "command_policy_blocked",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::SessionNotRunning => "session_not_running",
            ErrorCode::SessionClosing => "session_closing",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::UnsupportedTransport => "unsupported_transport",
            ErrorCode::NoThread => "no_thread",
            ErrorCode::OrchestrationLocked => "orchestration_locked",
            ErrorCode::WorktreeCreateFailed => "worktree_create_failed",
            ErrorCode::WorkerBranchRequiresGitRepo => "worker_branch_requires_git_repo",
            ErrorCode::OrchestrationFailed => "orchestration_failed",
            ErrorCode::NotActive => "not_active",
            ErrorCode::OrchestratorPendingAttention => "orchestrator_pending_attention",
            ErrorCode::CollectOnly => "collect_only",
            ErrorCode::Cooldown => "cooldown",
            ErrorCode::CodexNativeUnavailable => "codex_native_unavailable",
            ErrorCode::CodexNativeFailed => "codex_native_failed",
            ErrorCode::CodexAppServerUnavailable => "codex_app_server_unavailable",
            ErrorCode::WriteFailed => "write_failed",
            ErrorCode::RpcFailed => "rpc_failed",
            ErrorCode::DeliverFailed => "deliver_failed",
            ErrorCode::OrchestratorNotRunning => "orchestrator_not_running",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The control plane's domain error. `code` is the stable machine-readable
/// classification; `message` is for logs and operator-facing surfaces.
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Whether the router should retry the underlying operation rather than
    /// surface the failure to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::WriteFailed | ErrorCode::RpcFailed | ErrorCode::Cooldown
        )
    }
}

macro_rules! error_ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(message: impl Into<String>) -> Error {
            Error::new(ErrorCode::$code, message)
        }
    };
}

impl Error {
    error_ctor!(bad_id, BadId);
    error_ctor!(bad_path, BadPath);
    error_ctor!(bad_tool, BadTool);
    error_ctor!(bad_mode, BadMode);
    error_ctor!(bad_size, BadSize);
    error_ctor!(missing_text, MissingText);
    error_ctor!(missing_task, MissingTask);
    error_ctor!(missing_workers, MissingWorkers);
    error_ctor!(invalid_command_payload, InvalidCommandPayload);
    error_ctor!(unknown_command, UnknownCommand);
    error_ctor!(unauthorized, Unauthorized);
    error_ctor!(command_policy_blocked, CommandPolicyBlocked);
    error_ctor!(session_not_found, SessionNotFound);
    error_ctor!(session_not_running, SessionNotRunning);
    error_ctor!(session_closing, SessionClosing);
    error_ctor!(spawn_failed, SpawnFailed);
    error_ctor!(unsupported_transport, UnsupportedTransport);
    error_ctor!(no_thread, NoThread);
    error_ctor!(orchestration_locked, OrchestrationLocked);
    error_ctor!(worktree_create_failed, WorktreeCreateFailed);
    error_ctor!(worker_branch_requires_git_repo, WorkerBranchRequiresGitRepo);
    error_ctor!(orchestration_failed, OrchestrationFailed);
    error_ctor!(not_active, NotActive);
    error_ctor!(orchestrator_pending_attention, OrchestratorPendingAttention);
    error_ctor!(collect_only, CollectOnly);
    error_ctor!(cooldown, Cooldown);
    error_ctor!(codex_native_unavailable, CodexNativeUnavailable);
    error_ctor!(codex_native_failed, CodexNativeFailed);
    error_ctor!(codex_app_server_unavailable, CodexAppServerUnavailable);
    error_ctor!(write_failed, WriteFailed);
    error_ctor!(rpc_failed, RpcFailed);
    error_ctor!(deliver_failed, DeliverFailed);
    error_ctor!(orchestrator_not_running, OrchestratorNotRunning);
}

/// Helper trait mirroring the teacher's context-attachment idiom for
/// converting foreign errors into domain errors at call sites.
pub trait ResultExt<T> {
    fn map_code(self, code: ErrorCode, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn map_code(self, code: ErrorCode, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::new(code, message).with_source(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_serde() {
        let json = serde_json::to_string(&ErrorCode::SessionNotRunning).unwrap();
        assert_eq!(json, "\"session_not_running\"");
        let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ErrorCode::SessionNotRunning);
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = Error::session_not_running("session abc123 is not running");
        assert_eq!(
            err.to_string(),
            "session_not_running: session abc123 is not running"
        );
    }
}
