//! Cross-component scenarios (spec section 8's S1-S6), exercised against
//! the real interpreter, inbox, supervisor activity logic, sync digest, and
//! command router where that doesn't require spawning a live subprocess.
//! S5 (cleanup) and the session-spawning half of S1/S3 are exercised at the
//! unit level inside `orchestration::tests` and `supervisor::tests` instead,
//! since those require a live `session-core` session.

use std::sync::Arc;

use agentd::inbox::{AttentionInbox, CreateOutcome, Status};
use agentd::interpreter::Scanner;
use agentd::orchestration::automation::may_interrupt;
use agentd::orchestration::sync::{select_preview_source, PreviewSource};
use agentd::router::{Command, CommandRouter, PolicyTier};
use agentd::supervisor::{activity_state, ActivityState, SessionSupervisor};
use agentd::transcript::{EventKind, TranscriptStore};

// S1 (directive roundtrip): feeding the same dispatch directive twice within
// the 5-minute dedup window only extracts it once.
#[test]
fn s1_directive_roundtrip_dedupes_within_window() {
    let mut scanner = Scanner::new("orchestrator");
    let line = "FYP_DISPATCH_JSON: {\"target\":\"all\",\"text\":\"go\"}\n";

    let first = scanner.feed_str(line);
    assert_eq!(first.directives.len(), 1);

    let second = scanner.feed_str(line);
    assert!(
        second.directives.is_empty(),
        "re-feeding the same directive line inside the dedup window must not re-fire"
    );
}

// S2 (attention dedup): the same approval prompt fed twice creates exactly
// one open item with the expected kind/severity/signature shape.
#[tokio::test]
async fn s2_attention_dedup_creates_exactly_one_open_item() {
    let mut scanner = Scanner::new("s1");
    let inbox = AttentionInbox::new();
    let prompt = "Do you want to approve access to \"example.com\"?\n";

    let first_report = scanner.feed_str(prompt);
    let candidate = first_report.approval.expect("approval prompt must be detected");
    let (outcome1, id1) = inbox.create_from_approval("s1", candidate).await;
    assert_eq!(outcome1, CreateOutcome::Created);

    let second_report = scanner.feed_str(prompt);
    if let Some(candidate2) = second_report.approval {
        let (outcome2, id2) = inbox.create_from_approval("s1", candidate2).await;
        assert_eq!(outcome2, CreateOutcome::Existing);
        assert_eq!(id1, id2);
    }

    let open = inbox.list(Some("s1")).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, "codex.approval");
    assert!(open[0].signature.ends_with("|net|example.com"));
    assert_eq!(open[0].status, Status::Open);
}

// S3 (dispatch activity gating): a live worker with no attention and a
// recent preview must not be interrupted unless forced.
#[test]
fn s3_dispatch_skips_interrupt_unless_forced_for_active_worker() {
    let now = chrono::Utc::now();
    let state = activity_state(true, 0, Some(now - chrono::Duration::seconds(10)), None);
    assert_eq!(state, ActivityState::Live);

    let state_allows = matches!(state, ActivityState::NeedsInput | ActivityState::WaitingOrDone);
    assert!(!state_allows);

    assert!(!may_interrupt(false, true, false, state_allows));
    assert!(may_interrupt(false, true, true, state_allows));
}

// S4 (idempotent command): the same idempotency key replays the cached
// response instead of re-executing. Targets an orchestration id that was
// never created, so `system.review` deterministically fails in
// `runSteeringReview` without needing a live session — the replay cache and
// the executed-event bookkeeping are exercised the same way regardless of
// whether the underlying command succeeds.
#[tokio::test]
async fn s4_idempotent_command_replays_without_reexecuting() {
    let transcript = Arc::new(TranscriptStore::new());
    let inbox = Arc::new(AttentionInbox::new());
    let supervisor = Arc::new(SessionSupervisor::new(transcript.clone(), inbox.clone()));
    let engine = Arc::new(agentd::orchestration::OrchestrationEngine::new(
        supervisor,
        transcript.clone(),
        inbox,
        Arc::new(NoopWorktrees),
        Arc::new(NoopScaffold),
    ));
    let router = CommandRouter::new(engine);

    let command = serde_json::json!({ "commandId": "system.review", "force": true });
    let key = Some("K".to_string());

    let first = router
        .execute_command("o1", command.clone(), key.clone(), false)
        .await
        .unwrap();
    assert!(!first.replayed);
    assert!(!first.ok, "no orchestration named o1 exists, so the review must fail");
    assert_eq!(first.error.as_deref(), Some("not_active"));

    let second = router.execute_command("o1", command, key, false).await.unwrap();
    assert!(second.replayed);
    assert_eq!(second.ok, first.ok);
    assert_eq!(second.body, first.body);

    let events = transcript.get_events("o1", 50, None).await.unwrap();
    let executed = events
        .items
        .iter()
        .filter(|e| e.kind == EventKind::OrchestrationCommandExecuted)
        .count();
    assert_eq!(
        executed, 1,
        "the replayed second call must not append a second executed event"
    );
}

// S6 (preview selection): a fresh, non-placeholder progress preview wins
// over the live preview; a stale placeholder defers to a meaningfully
// newer live preview.
#[test]
fn s6_preview_source_selection() {
    let now = chrono::Utc::now();
    let fresh = select_preview_source(
        Some(now - chrono::Duration::milliseconds(500)),
        Some("impl step 3"),
        Some(now),
    );
    assert_eq!(fresh, PreviewSource::Progress);

    let mtime = now - chrono::Duration::seconds(5);
    let placeholder = select_preview_source(
        Some(mtime),
        Some("# Worker 1 Task Card"),
        Some(mtime + chrono::Duration::milliseconds(500)),
    );
    assert_eq!(placeholder, PreviewSource::Live);
}

#[test]
fn restricted_commands_require_explicit_authorization() {
    let cmd = Command::WorkerDispatch {
        target: "all".to_string(),
        text: "go".to_string(),
        interrupt: Some(true),
        force_interrupt: Some(true),
    };
    assert_eq!(agentd::router::policy_tier(&cmd), PolicyTier::Restricted);
}

struct NoopWorktrees;

#[async_trait::async_trait]
impl agentd::orchestration::WorktreeProvider for NoopWorktrees {
    async fn create_worktree(
        &self,
        _spec: &agentd::orchestration::WorkerSpec,
    ) -> agentd::Result<std::path::PathBuf> {
        Ok(std::path::PathBuf::from("/tmp"))
    }

    async fn remove_worktree(&self, _path: &std::path::Path) -> agentd::Result<()> {
        Ok(())
    }
}

struct NoopScaffold;

#[async_trait::async_trait]
impl agentd::orchestration::ScaffoldWriter for NoopScaffold {
    async fn write_scaffold(&self, _orchestration_id: &str, _project_path: &std::path::Path) -> agentd::Result<()> {
        Ok(())
    }
}
