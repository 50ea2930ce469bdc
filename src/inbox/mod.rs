//! Attention Inbox (C3): a deduplicated, signatured store of pending
//! human/coordinator decisions, with timed delivery of responses back into
//! agents.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::interpreter::approval::{ApprovalCandidate, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    Sent,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Option_ {
    pub id: String,
    pub label: String,
    pub effect: OptionEffect,
}

/// Exactly one of these describes what happens when an option is chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum OptionEffect {
    Keys { keys: String },
    Structured { decision: serde_json::Value },
    Rpc { reply: serde_json::Value },
    NestedQuestion { question_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionItem {
    pub id: u64,
    pub session_id: String,
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub signature: String,
    pub options: Vec<Option_>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub workspace_key: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Existing,
}

/// What to do when an option is chosen, resolved by [`AttentionInbox::respond`].
#[derive(Debug, Clone)]
pub enum ResolvedAction {
    TypeKeys(String),
    StructuredDecision(serde_json::Value),
    RpcReply(serde_json::Value),
    NextQuestion(AttentionItem),
}

struct State {
    items: HashMap<u64, AttentionItem>,
    by_signature: HashMap<(String, String), u64>,
    next_id: u64,
}

/// The Attention Inbox. `respond`/`dismiss` are serialized per item via the
/// shared mutex; concurrent detections of the same `(sessionId, signature)`
/// are serialized the same way so create-or-update is atomic.
pub struct AttentionInbox {
    state: Arc<Mutex<State>>,
}

impl Default for AttentionInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl AttentionInbox {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                items: HashMap::new(),
                by_signature: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    pub async fn create_from_approval(
        &self,
        session_id: &str,
        candidate: ApprovalCandidate,
    ) -> (CreateOutcome, u64) {
        let options = candidate
            .options
            .into_iter()
            .map(|o| Option_ {
                id: o.id,
                label: o.label,
                effect: OptionEffect::Keys { keys: o.keys },
            })
            .collect();
        self.create(
            session_id,
            &candidate.kind,
            candidate.severity,
            candidate.title,
            candidate.body,
            candidate.signature,
            options,
        )
        .await
    }

    /// Creates an item, or updates-in-place and returns the existing id if
    /// an open item with the same `(sessionId, signature)` already exists.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        session_id: &str,
        kind: &str,
        severity: Severity,
        title: String,
        body: String,
        signature: String,
        options: Vec<Option_>,
    ) -> (CreateOutcome, u64) {
        let mut state = self.state.lock().await;
        let key = (session_id.to_string(), signature.clone());
        if let Some(&id) = state.by_signature.get(&key) {
            if let Some(item) = state.items.get_mut(&id) {
                if item.status == Status::Open {
                    item.title = title;
                    item.body = body;
                    item.options = options;
                    return (CreateOutcome::Existing, id);
                }
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        state.items.insert(
            id,
            AttentionItem {
                id,
                session_id: session_id.to_string(),
                kind: kind.to_string(),
                severity,
                title,
                body,
                signature,
                options,
                status: Status::Open,
                created_at: Utc::now(),
                workspace_key: None,
                cwd: None,
            },
        );
        state.by_signature.insert(key, id);
        (CreateOutcome::Created, id)
    }

    /// Resolves the chosen option. Double-resolve is a no-op returning the
    /// item's current (terminal) status.
    pub async fn respond(&self, id: u64, option_id: &str) -> Result<(Status, Option<ResolvedAction>)> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::bad_id(format!("no attention item {id}")))?;
        if item.status != Status::Open {
            return Ok((item.status, None));
        }
        let option = item
            .options
            .iter()
            .find(|o| o.id == option_id)
            .ok_or_else(|| Error::bad_id(format!("no option {option_id} on item {id}")))?
            .clone();
        if matches!(option.effect, OptionEffect::NestedQuestion { .. }) {
            // Further questions remain for this RPC request: the item stays
            // open and the caller mutates it via `continue_nested` instead
            // of an upstream RPC response being sent yet.
            return Ok((Status::Open, Some(ResolvedAction::NextQuestion(item.clone()))));
        }
        item.status = Status::Sent;
        let action = match option.effect {
            OptionEffect::Keys { keys } => ResolvedAction::TypeKeys(keys),
            OptionEffect::Structured { decision } => ResolvedAction::StructuredDecision(decision),
            OptionEffect::Rpc { reply } => ResolvedAction::RpcReply(reply),
            OptionEffect::NestedQuestion { .. } => unreachable!(),
        };
        Ok((Status::Sent, Some(action)))
    }

    /// Mutates an item in place to present the next question in an RPC
    /// multi-question flow, keeping it `open` rather than resolving it.
    pub async fn continue_nested(
        &self,
        id: u64,
        title: String,
        body: String,
        options: Vec<Option_>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::bad_id(format!("no attention item {id}")))?;
        item.title = title;
        item.body = body;
        item.options = options;
        Ok(())
    }

    /// Dismisses an open item. Double-dismiss is a no-op.
    pub async fn dismiss(&self, id: u64) -> Result<Status> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::bad_id(format!("no attention item {id}")))?;
        if item.status == Status::Open {
            item.status = Status::Dismissed;
        }
        Ok(item.status)
    }

    /// Fetches a snapshot of an item regardless of status. Used by callers
    /// that need the session id an attention id belongs to before they can
    /// deliver a resolved action.
    pub async fn get(&self, id: u64) -> Option<AttentionItem> {
        let state = self.state.lock().await;
        state.items.get(&id).cloned()
    }

    /// Open items for a session, newest first.
    pub async fn list(&self, session_id: Option<&str>) -> Vec<AttentionItem> {
        let state = self.state.lock().await;
        let mut items: Vec<AttentionItem> = state
            .items
            .values()
            .filter(|i| i.status == Status::Open)
            .filter(|i| session_id.is_none_or_eq(&i.session_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    /// Count of open items per session.
    pub async fn open_counts(&self) -> HashMap<String, usize> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for item in state.items.values().filter(|i| i.status == Status::Open) {
            *counts.entry(item.session_id.clone()).or_insert(0) += 1;
        }
        counts
    }
}

trait OptionalEqExt {
    fn is_none_or_eq(&self, other: &str) -> bool;
}

impl OptionalEqExt for Option<&str> {
    fn is_none_or_eq(&self, other: &str) -> bool {
        match self {
            None => true,
            Some(s) => *s == other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::approval::OptionSpec;

    fn candidate(sig: &str) -> ApprovalCandidate {
        ApprovalCandidate {
            kind: "codex.approval".to_string(),
            severity: Severity::Danger,
            title: "Approve?".to_string(),
            body: "body".to_string(),
            signature: sig.to_string(),
            options: vec![OptionSpec {
                id: "y".to_string(),
                label: "Yes".to_string(),
                keys: "y".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn duplicate_signature_updates_in_place() {
        let inbox = AttentionInbox::new();
        let (outcome1, id1) = inbox.create_from_approval("s1", candidate("sig-a")).await;
        assert_eq!(outcome1, CreateOutcome::Created);
        let (outcome2, id2) = inbox.create_from_approval("s1", candidate("sig-a")).await;
        assert_eq!(outcome2, CreateOutcome::Existing);
        assert_eq!(id1, id2);
        assert_eq!(inbox.list(Some("s1")).await.len(), 1);
    }

    #[tokio::test]
    async fn respond_transitions_to_terminal_and_is_idempotent() {
        let inbox = AttentionInbox::new();
        let (_, id) = inbox.create_from_approval("s1", candidate("sig-b")).await;
        let (status, action) = inbox.respond(id, "y").await.unwrap();
        assert_eq!(status, Status::Sent);
        assert!(matches!(action, Some(ResolvedAction::TypeKeys(k)) if k == "y"));

        let (status2, action2) = inbox.respond(id, "y").await.unwrap();
        assert_eq!(status2, Status::Sent);
        assert!(action2.is_none());
    }

    #[tokio::test]
    async fn dismiss_is_terminal_and_excluded_from_open_list() {
        let inbox = AttentionInbox::new();
        let (_, id) = inbox.create_from_approval("s1", candidate("sig-c")).await;
        assert_eq!(inbox.dismiss(id).await.unwrap(), Status::Dismissed);
        assert!(inbox.list(Some("s1")).await.is_empty());
    }

    #[tokio::test]
    async fn open_counts_are_partitioned_by_session() {
        let inbox = AttentionInbox::new();
        inbox.create_from_approval("s1", candidate("sig-d")).await;
        inbox.create_from_approval("s2", candidate("sig-e")).await;
        let counts = inbox.open_counts().await;
        assert_eq!(counts.get("s1"), Some(&1));
        assert_eq!(counts.get("s2"), Some(&1));
    }
}
