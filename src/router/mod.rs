//! Command Router (C6): a closed catalog of orchestration commands, each
//! validated, policy-checked, clamped, and executed idempotently.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::orchestration::sync::SyncOutcome;
use crate::orchestration::{DispatchOutcome, OrchestrationEngine, SteeringReviewOutcome};

const REPLAY_TTL: chrono::Duration = chrono::Duration::hours(24);
const REPLAY_MAX: usize = 300;
const REPLAY_TRIM_TO: usize = 220;

const TARGET_MAX: usize = 160;
const TEXT_MAX: usize = 5000;
const RAW_PROMPT_MAX: usize = 8000;
const SCOPE_MAX_ITEMS: usize = 40;
const SCOPE_ITEM_MAX: usize = 260;

/// The closed command catalog. Each variant carries exactly the fields its
/// execution mode needs; there is no string-keyed dispatch inside executors.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "commandId")]
pub enum Command {
    #[serde(rename = "system.sync")]
    SystemSync {
        force: Option<bool>,
        #[serde(rename = "deliverToOrchestrator")]
        deliver_to_orchestrator: Option<bool>,
    },
    #[serde(rename = "system.review")]
    SystemReview { force: Option<bool> },
    #[serde(rename = "orchestrator.input")]
    OrchestratorInput {
        text: String,
        #[serde(rename = "rawPrompt")]
        raw_prompt: Option<String>,
    },
    #[serde(rename = "worker.send_task")]
    WorkerSendTask {
        target: String,
        task: String,
        initialize: Option<bool>,
        interrupt: Option<bool>,
        #[serde(rename = "forceInterrupt")]
        force_interrupt: Option<bool>,
    },
    #[serde(rename = "worker.dispatch")]
    WorkerDispatch {
        target: String,
        text: String,
        interrupt: Option<bool>,
        #[serde(rename = "forceInterrupt")]
        force_interrupt: Option<bool>,
    },
}

impl Command {
    pub fn id(&self) -> &'static str {
        match self {
            Command::SystemSync { .. } => "system.sync",
            Command::SystemReview { .. } => "system.review",
            Command::OrchestratorInput { .. } => "orchestrator.input",
            Command::WorkerSendTask { .. } => "worker.send_task",
            Command::WorkerDispatch { .. } => "worker.dispatch",
        }
    }

    /// Validates and clamps the generic fields per spec 4.6 step 4.
    fn validate_and_clamp(mut self) -> Result<Self> {
        match &mut self {
            Command::OrchestratorInput { text, raw_prompt } => {
                if text.is_empty() {
                    return Err(Error::missing_text("text must not be empty"));
                }
                clamp_len(text, TEXT_MAX);
                if let Some(p) = raw_prompt {
                    clamp_len(p, RAW_PROMPT_MAX);
                }
            }
            Command::WorkerSendTask { target, task, .. } => {
                if target.is_empty() {
                    return Err(Error::invalid_command_payload("target must not be empty"));
                }
                if task.is_empty() {
                    return Err(Error::missing_task("task must not be empty"));
                }
                clamp_len(target, TARGET_MAX);
                clamp_len(task, TEXT_MAX);
            }
            Command::WorkerDispatch { target, text, .. } => {
                if target.is_empty() {
                    return Err(Error::invalid_command_payload("target must not be empty"));
                }
                if text.is_empty() {
                    return Err(Error::missing_text("text must not be empty"));
                }
                clamp_len(target, TARGET_MAX);
                clamp_len(text, TEXT_MAX);
            }
            Command::SystemSync { .. } | Command::SystemReview { .. } => {}
        }
        Ok(self)
    }
}

fn clamp_len(s: &mut String, max: usize) {
    if s.len() > max {
        let mut idx = max;
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        s.truncate(idx);
    }
}

/// Policy tier derived from `(commandId, mode)`; a stand-in for a richer
/// external policy engine, matching the spec's closed five-mode catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTier {
    Safe,
    RequiresConfirmation,
    Restricted,
}

pub fn policy_tier(command: &Command) -> PolicyTier {
    match command {
        Command::SystemSync { .. } | Command::SystemReview { .. } => PolicyTier::Safe,
        Command::OrchestratorInput { .. } => PolicyTier::RequiresConfirmation,
        Command::WorkerSendTask { force_interrupt, .. }
        | Command::WorkerDispatch { force_interrupt, .. } => {
            if force_interrupt.unwrap_or(false) {
                PolicyTier::Restricted
            } else {
                PolicyTier::RequiresConfirmation
            }
        }
    }
}

pub struct PolicyDecision {
    pub allowed: bool,
    pub reasons: Vec<String>,
    pub unmet: Vec<String>,
}

/// Evaluates policy for the command's tier. Callers inject the actual
/// authorization decision (e.g. "is this caller allowed `Restricted`
/// commands"); this default policy allows everything but `Restricted`.
pub fn evaluate_policy(tier: PolicyTier, allow_restricted: bool) -> PolicyDecision {
    match tier {
        PolicyTier::Safe | PolicyTier::RequiresConfirmation => PolicyDecision {
            allowed: true,
            reasons: vec![],
            unmet: vec![],
        },
        PolicyTier::Restricted if allow_restricted => PolicyDecision {
            allowed: true,
            reasons: vec![],
            unmet: vec![],
        },
        PolicyTier::Restricted => PolicyDecision {
            allowed: false,
            reasons: vec!["restricted_tier".to_string()],
            unmet: vec!["force_interrupt requires elevated authorization".to_string()],
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub ok: bool,
    pub replayed: bool,
    pub error: Option<String>,
    pub reason: Option<String>,
    pub unmet: Vec<String>,
    pub body: Value,
}

#[derive(Clone)]
struct ReplayEntry {
    ts: DateTime<Utc>,
    response: ExecuteResponse,
}

impl Serialize for ReplayEntry {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.response.serialize(serializer)
    }
}

/// In-memory LRU (max 300, trimmed to 220) backing the idempotency replay
/// store. A durable replay store with the same TTL is the caller's
/// responsibility to layer on top (e.g. a database-backed cache); this is
/// the in-process half of spec 4.6 step 5.
struct ReplayCache {
    order: VecDeque<String>,
    entries: HashMap<String, ReplayEntry>,
}

impl ReplayCache {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<ExecuteResponse> {
        self.prune(now);
        self.entries.get(key).map(|e| e.response.clone())
    }

    fn insert(&mut self, key: String, response: ExecuteResponse, now: DateTime<Utc>) {
        self.prune(now);
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries.insert(key, ReplayEntry { ts: now, response });
        if self.entries.len() > REPLAY_MAX {
            while self.entries.len() > REPLAY_TRIM_TO {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.order.front() {
            match self.entries.get(front) {
                Some(entry) if now.signed_duration_since(entry.ts) > REPLAY_TTL => {
                    let key = self.order.pop_front().unwrap();
                    self.entries.remove(&key);
                }
                _ => break,
            }
        }
    }
}

pub struct CommandRouter {
    engine: std::sync::Arc<OrchestrationEngine>,
    replay: Mutex<ReplayCache>,
}

impl CommandRouter {
    pub fn new(engine: std::sync::Arc<OrchestrationEngine>) -> Self {
        Self {
            engine,
            replay: Mutex::new(ReplayCache::new()),
        }
    }

    /// Runs the full pipeline (spec 4.6): validate, clamp, policy, idempotent
    /// execute, record an `orchestration.command.executed` event.
    pub async fn execute_command(
        &self,
        orchestration_id: &str,
        raw: Value,
        idempotency_key: Option<String>,
        allow_restricted: bool,
    ) -> Result<ExecuteResponse> {
        let command: Command = serde_json::from_value(raw)
            .map_err(|e| Error::unknown_command(e.to_string()))?;
        let command = command.validate_and_clamp()?;

        let tier = policy_tier(&command);
        let decision = evaluate_policy(tier, allow_restricted);
        if !decision.allowed {
            return Ok(ExecuteResponse {
                ok: false,
                replayed: false,
                error: Some("command_policy_blocked".to_string()),
                reason: Some(decision.reasons.join(",")),
                unmet: decision.unmet,
                body: Value::Null,
            });
        }

        let cache_key = idempotency_key
            .map(|key| format!("{orchestration_id}:{}:{key}", command.id()));

        if let Some(key) = &cache_key {
            let now = Utc::now();
            let mut replay = self.replay.lock().expect("replay cache poisoned");
            if let Some(mut cached) = replay.get(key, now) {
                cached.replayed = true;
                return Ok(cached);
            }
        }

        let command_id = command.id();
        let mut response = self.execute(orchestration_id, command).await;
        response.replayed = false;

        self.engine
            .record_command_event(orchestration_id, command_id, response.ok, response.reason.as_deref())
            .await;

        if let Some(key) = cache_key {
            let now = Utc::now();
            let mut replay = self.replay.lock().expect("replay cache poisoned");
            replay.insert(key, response.clone(), now);
        }

        Ok(response)
    }

    async fn execute(&self, orchestration_id: &str, command: Command) -> ExecuteResponse {
        match command {
            Command::SystemSync {
                force,
                deliver_to_orchestrator,
            } => {
                let outcome = self
                    .engine
                    .run_sync(
                        orchestration_id,
                        force.unwrap_or(false),
                        deliver_to_orchestrator.unwrap_or(true),
                        false,
                        chrono::Duration::seconds(20),
                    )
                    .await;
                sync_response(outcome)
            }
            Command::SystemReview { force } => {
                let outcome = self
                    .engine
                    .run_steering_review(orchestration_id, force.unwrap_or(false))
                    .await;
                steering_review_response(outcome)
            }
            Command::OrchestratorInput { text, .. } => {
                match self.engine.write_to_orchestrator(orchestration_id, &text).await {
                    Ok(()) => ExecuteResponse {
                        ok: true,
                        replayed: false,
                        error: None,
                        reason: None,
                        unmet: vec![],
                        body: serde_json::json!({ "sent": true }),
                    },
                    Err(e) => ExecuteResponse {
                        ok: false,
                        replayed: false,
                        error: Some(e.code.as_str().to_string()),
                        reason: Some(e.message.clone()),
                        unmet: vec![],
                        body: Value::Null,
                    },
                }
            }
            Command::WorkerSendTask {
                target,
                task,
                initialize,
                interrupt,
                force_interrupt,
            } => {
                let outcome = self
                    .engine
                    .dispatch(
                        orchestration_id,
                        crate::orchestration::DispatchRequest {
                            text: task,
                            target,
                            interrupt: interrupt.unwrap_or(false),
                            force_interrupt: force_interrupt.unwrap_or(false),
                            include_bootstrap_if_present: initialize.unwrap_or(true),
                            source: "api.command.worker.send_task".to_string(),
                        },
                    )
                    .await;
                dispatch_response(outcome)
            }
            Command::WorkerDispatch {
                target,
                text,
                interrupt,
                force_interrupt,
            } => {
                let outcome = self
                    .engine
                    .dispatch(
                        orchestration_id,
                        crate::orchestration::DispatchRequest {
                            text,
                            target,
                            interrupt: interrupt.unwrap_or(false),
                            force_interrupt: force_interrupt.unwrap_or(false),
                            include_bootstrap_if_present: false,
                            source: "api.command.worker.dispatch".to_string(),
                        },
                    )
                    .await;
                dispatch_response(outcome)
            }
        }
    }
}

fn dispatch_response(outcome: Result<DispatchOutcome>) -> ExecuteResponse {
    match outcome {
        Ok(o) => ExecuteResponse {
            ok: o.failed.is_empty(),
            replayed: false,
            error: None,
            reason: None,
            unmet: vec![],
            body: serde_json::json!({
                "sent": o.sent,
                "failed": o.failed,
                "availableTargets": o.available_targets,
            }),
        },
        Err(e) => ExecuteResponse {
            ok: false,
            replayed: false,
            error: Some(e.code.as_str().to_string()),
            reason: Some(e.message.clone()),
            unmet: vec![],
            body: Value::Null,
        },
    }
}

fn steering_review_response(outcome: Result<SteeringReviewOutcome>) -> ExecuteResponse {
    match outcome {
        Ok(o) => {
            let (sent, reason) = match o {
                SteeringReviewOutcome::Dispatched => (true, None),
                SteeringReviewOutcome::SteeringOff => (false, Some("steering_off")),
                SteeringReviewOutcome::InFlight => (false, Some("in_flight")),
                SteeringReviewOutcome::OrchestratorNotRunning => {
                    (false, Some("orchestrator_not_running"))
                }
                SteeringReviewOutcome::OrchestratorPendingAttention => {
                    (false, Some("orchestrator_pending_attention"))
                }
                SteeringReviewOutcome::DeliverFailed => (false, Some("deliver_failed")),
            };
            ExecuteResponse {
                ok: true,
                replayed: false,
                error: None,
                reason: reason.map(|r| r.to_string()),
                unmet: vec![],
                body: serde_json::json!({ "sent": sent, "mode": "steering_review" }),
            }
        }
        Err(e) => ExecuteResponse {
            ok: false,
            replayed: false,
            error: Some(e.code.as_str().to_string()),
            reason: Some(e.message.clone()),
            unmet: vec![],
            body: Value::Null,
        },
    }
}

fn sync_response(outcome: Result<SyncOutcome>) -> ExecuteResponse {
    match outcome {
        Ok(o) => {
            let (sent, reason) = match o {
                SyncOutcome::Sent => (true, None),
                SyncOutcome::Unchanged => (false, Some("unchanged")),
                SyncOutcome::CollectOnly => (false, Some("collect_only")),
                SyncOutcome::InFlight => (false, Some("in_flight")),
                SyncOutcome::Locked => (false, Some("locked")),
                SyncOutcome::DeliverFailed => (false, Some("deliver_failed")),
                SyncOutcome::OrchestratorNotRunning => (false, Some("orchestrator_not_running")),
                SyncOutcome::OrchestratorPendingAttention => {
                    (false, Some("orchestrator_pending_attention"))
                }
            };
            ExecuteResponse {
                ok: true,
                replayed: false,
                error: None,
                reason: reason.map(|r| r.to_string()),
                unmet: vec![],
                body: serde_json::json!({ "sent": sent }),
            }
        }
        Err(e) => ExecuteResponse {
            ok: false,
            replayed: false,
            error: Some(e.code.as_str().to_string()),
            reason: Some(e.message.clone()),
            unmet: vec![],
            body: Value::Null,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_len_truncates_at_a_char_boundary() {
        let mut s = "a".repeat(200);
        clamp_len(&mut s, 160);
        assert_eq!(s.len(), 160);
    }

    #[test]
    fn policy_tier_restricts_forced_worker_commands() {
        let cmd = Command::WorkerDispatch {
            target: "all".to_string(),
            text: "go".to_string(),
            interrupt: Some(true),
            force_interrupt: Some(true),
        };
        assert_eq!(policy_tier(&cmd), PolicyTier::Restricted);
        assert!(!evaluate_policy(PolicyTier::Restricted, false).allowed);
        assert!(evaluate_policy(PolicyTier::Restricted, true).allowed);
    }

    #[test]
    fn worker_dispatch_rejects_empty_target() {
        let cmd = Command::WorkerDispatch {
            target: String::new(),
            text: "go".to_string(),
            interrupt: None,
            force_interrupt: None,
        };
        assert!(cmd.validate_and_clamp().is_err());
    }

    #[test]
    fn replay_cache_returns_cached_response_and_marks_replayed() {
        let mut cache = ReplayCache::new();
        let now = Utc::now();
        let response = ExecuteResponse {
            ok: true,
            replayed: false,
            error: None,
            reason: None,
            unmet: vec![],
            body: Value::Null,
        };
        cache.insert("k1".to_string(), response, now);
        let cached = cache.get("k1", now).unwrap();
        assert!(cached.ok);
    }

    #[test]
    fn replay_cache_expires_entries_past_ttl() {
        let mut cache = ReplayCache::new();
        let created = Utc::now() - chrono::Duration::hours(25);
        let response = ExecuteResponse {
            ok: true,
            replayed: false,
            error: None,
            reason: None,
            unmet: vec![],
            body: Value::Null,
        };
        cache.insert("k1".to_string(), response, created);
        assert!(cache.get("k1", Utc::now()).is_none());
    }

    #[test]
    fn replay_cache_trims_down_to_220_once_past_300() {
        let mut cache = ReplayCache::new();
        let now = Utc::now();
        for i in 0..305 {
            cache.insert(
                format!("k{i}"),
                ExecuteResponse {
                    ok: true,
                    replayed: false,
                    error: None,
                    reason: None,
                    unmet: vec![],
                    body: Value::Null,
                },
                now,
            );
        }
        assert_eq!(cache.entries.len(), REPLAY_TRIM_TO);
    }
}
