//! Automation: auto-question batching to the orchestrator, periodic
//! steering review, and worker-signal coalescing with done-latch semantics.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const QUESTION_BATCH_DELAY: Duration = Duration::from_millis(1200);
pub const COALESCE_MIN_MS: u64 = 180;
pub const COALESCE_MAX_MS: u64 = 420;
pub const SIGNAL_MIN_GAP: chrono::Duration = chrono::Duration::seconds(15);
pub const STALE_SIGNAL: chrono::Duration = chrono::Duration::seconds(90);
const MAX_BATCHED_OPTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionMode {
    Off,
    Orchestrator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringMode {
    Off,
    PassiveReview,
    ActiveSteering,
}

/// Auto-question attention kinds: items of these kinds are batched to the
/// orchestrator rather than left for a human.
pub const AUTO_QUESTION_KINDS: &[&str] = &[
    "claude.permission",
    "codex.approval",
    "codex.native.approval.",
    "codex.native.user_input",
];

pub fn is_auto_question_kind(kind: &str) -> bool {
    AUTO_QUESTION_KINDS
        .iter()
        .any(|prefix| kind == *prefix || kind.starts_with(prefix))
}

#[derive(Debug, Clone)]
pub struct PendingQuestion {
    pub attention_id: u64,
    pub session_id: String,
    pub title: String,
    pub options: Vec<String>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignalTrigger {
    Completion,
    Question,
}

#[derive(Debug, Clone)]
struct SignalState {
    last_fired_at: Option<DateTime<Utc>>,
}

/// Per-orchestration automation runtime: queued auto-questions, a
/// completion-cue done latch per worker, and coalescing state per
/// `(sessionId, trigger)`.
#[derive(Default)]
pub struct AutomationState {
    pub question_mode: Option<QuestionMode>,
    pub steering_mode: Option<SteeringMode>,
    pending_questions: Vec<PendingQuestion>,
    done_latches: HashMap<String, bool>,
    signals: HashMap<(String, &'static str), SignalState>,
    pub last_error: Option<String>,
}

impl AutomationState {
    pub fn new(question_mode: QuestionMode, steering_mode: SteeringMode) -> Self {
        Self {
            question_mode: Some(question_mode),
            steering_mode: Some(steering_mode),
            ..Default::default()
        }
    }

    pub fn enqueue_question(&mut self, q: PendingQuestion) {
        self.pending_questions.push(q);
    }

    pub fn pending_question_count(&self) -> usize {
        self.pending_questions.len()
    }

    /// Drains the current batch and renders the orchestrator prompt,
    /// trimming each item's option list to `MAX_BATCHED_OPTIONS`.
    pub fn drain_batch_prompt(&mut self) -> Option<String> {
        if self.pending_questions.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut self.pending_questions);
        let mut out = String::from(
            "Open questions from workers. Answer each via FYP_ANSWER_QUESTION_JSON \
             (refuse destructive actions unless explicitly in YOLO mode):\n",
        );
        for q in &batch {
            out.push_str(&format!(
                "- attentionId={} session={} \"{}\" options=[{}]\n",
                q.attention_id,
                q.session_id,
                q.title,
                q.options
                    .iter()
                    .take(MAX_BATCHED_OPTIONS)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        Some(out)
    }

    pub fn set_done_latch(&mut self, session_id: &str) {
        self.done_latches.insert(session_id.to_string(), true);
    }

    pub fn clear_done_latch(&mut self, session_id: &str) {
        self.done_latches.remove(session_id);
    }

    pub fn is_done_latched(&self, session_id: &str) -> bool {
        self.done_latches.get(session_id).copied().unwrap_or(false)
    }

    /// Whether a worker signal at `now` should fire given the per-key
    /// minimum gap and staleness rules.
    pub fn should_fire_signal(
        &mut self,
        session_id: &str,
        trigger: WorkerSignalTrigger,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (
            session_id.to_string(),
            match trigger {
                WorkerSignalTrigger::Completion => "completion",
                WorkerSignalTrigger::Question => "question",
            },
        );
        let state = self.signals.entry(key).or_insert(SignalState {
            last_fired_at: None,
        });
        let should = match state.last_fired_at {
            None => true,
            Some(last) => {
                let since = now.signed_duration_since(last);
                since >= SIGNAL_MIN_GAP || since >= STALE_SIGNAL
            }
        };
        if should {
            state.last_fired_at = Some(now);
        }
        should
    }
}

/// Whether an interrupt may be issued against a worker, given the done
/// latch and the dispatch `interrupt`/`forceInterrupt` flags plus activity
/// state computed by the session supervisor (spec 4.5.3 step 3).
#[allow(clippy::too_many_arguments)]
pub fn may_interrupt(
    latched: bool,
    interrupt_requested: bool,
    force_interrupt: bool,
    state_allows: bool,
) -> bool {
    if latched {
        return false;
    }
    if !interrupt_requested {
        return false;
    }
    force_interrupt || state_allows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_latch_suppresses_interrupts_even_when_forced() {
        assert!(!may_interrupt(true, true, true, true));
    }

    #[test]
    fn interrupt_requires_force_or_state_allows() {
        assert!(!may_interrupt(false, true, false, false));
        assert!(may_interrupt(false, true, true, false));
        assert!(may_interrupt(false, true, false, true));
    }

    #[test]
    fn batched_prompt_trims_options_and_drains_queue() {
        let mut state = AutomationState::new(QuestionMode::Orchestrator, SteeringMode::Off);
        state.enqueue_question(PendingQuestion {
            attention_id: 1,
            session_id: "s1".to_string(),
            title: "approve?".to_string(),
            options: (0..12).map(|i| i.to_string()).collect(),
            queued_at: Utc::now(),
        });
        let prompt = state.drain_batch_prompt().unwrap();
        assert!(prompt.contains("FYP_ANSWER_QUESTION_JSON"));
        assert!(state.drain_batch_prompt().is_none());
    }

    #[test]
    fn signal_respects_minimum_gap() {
        let mut state = AutomationState::new(QuestionMode::Off, SteeringMode::Off);
        let t0 = Utc::now();
        assert!(state.should_fire_signal("s1", WorkerSignalTrigger::Completion, t0));
        assert!(!state.should_fire_signal(
            "s1",
            WorkerSignalTrigger::Completion,
            t0 + chrono::Duration::seconds(5)
        ));
        assert!(state.should_fire_signal(
            "s1",
            WorkerSignalTrigger::Completion,
            t0 + chrono::Duration::seconds(16)
        ));
    }

    #[test]
    fn auto_question_kind_matches_prefix_families() {
        assert!(is_auto_question_kind("codex.native.approval.exec"));
        assert!(is_auto_question_kind("claude.permission"));
        assert!(!is_auto_question_kind("human.only"));
    }
}
