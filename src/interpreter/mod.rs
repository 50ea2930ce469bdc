//! Output Interpreter (C2): a dependency-free stream analyzer.
//!
//! The strip/preview/approval/assist/directive/cue functions in the
//! submodules are pure. [`Scanner`] is the thin per-session state wrapper
//! the Session Supervisor owns one of per session: it carries the directive
//! line-carry buffer, the 5-minute directive dedup window, the 900 ms
//! preview throttle, and the last assist signature, none of which the pure
//! functions themselves need to know about.

pub mod ansi;
pub mod approval;
pub mod assist;
pub mod cues;
pub mod directive;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

pub use approval::ApprovalCandidate;
pub use assist::AssistSnapshot;
pub use directive::Directive;

const PREVIEW_THROTTLE: Duration = Duration::from_millis(900);
const DIRECTIVE_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);
const TAIL_CAP_BYTES: usize = 9 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct PreviewUpdate {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ScanReport {
    pub preview: Option<PreviewUpdate>,
    pub approval: Option<ApprovalCandidate>,
    pub assist: Option<AssistSnapshot>,
    pub directives: Vec<Directive>,
    pub completion_cue: bool,
    pub question_cue: bool,
}

/// Per-session interpreter state. Feed it successive output chunks; it
/// returns what changed in this feed only (debounced/deduped as specified).
pub struct Scanner {
    session_id: String,
    carry: String,
    tail: String,
    directive_seen: HashMap<String, Instant>,
    last_preview: Option<(String, Instant)>,
    last_assist_signature: Option<String>,
}

impl Scanner {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            carry: String::new(),
            tail: String::new(),
            directive_seen: HashMap::new(),
            last_preview: None,
            last_assist_signature: None,
        }
    }

    /// Feeds a raw (not-yet-stripped) output chunk and returns everything
    /// detected in this feed.
    pub fn feed(&mut self, raw_chunk: &[u8]) -> ScanReport {
        self.feed_str(&ansi::strip_controls_to_string(raw_chunk))
    }

    /// Feeds already-stripped text. Exposed separately so callers that
    /// strip once upstream (e.g. the CLI) don't pay for it twice.
    pub fn feed_str(&mut self, stripped: &str) -> ScanReport {
        let mut report = ScanReport::default();

        // Rolling tail, used for approval/assist/cue detection.
        self.tail.push_str(stripped);
        if self.tail.len() > TAIL_CAP_BYTES {
            let excess = self.tail.len() - TAIL_CAP_BYTES;
            let mut idx = excess;
            while idx < self.tail.len() && !self.tail.is_char_boundary(idx) {
                idx += 1;
            }
            self.tail.drain(..idx);
        }

        // Preview, throttled to at most once per 900ms.
        if let Some(preview) = ansi::last_line_preview(&self.tail) {
            let should_emit = match &self.last_preview {
                Some((last_text, last_at)) => {
                    *last_text != preview && last_at.elapsed() >= PREVIEW_THROTTLE
                }
                None => true,
            };
            if should_emit {
                self.last_preview = Some((preview.clone(), Instant::now()));
                report.preview = Some(PreviewUpdate { text: preview });
            }
        }

        report.approval = approval::detect_approval(&self.session_id, &self.tail);

        if let Some(assist) = assist::extract_assist(&self.tail) {
            if self.last_assist_signature.as_deref() != Some(assist.signature.as_str()) {
                self.last_assist_signature = Some(assist.signature.clone());
                report.assist = Some(assist);
            }
        }

        let preview_line = report.preview.as_ref().map(|p| p.text.as_str());
        report.completion_cue = cues::completion_cue(preview_line, &self.tail);
        report.question_cue = cues::question_cue(preview_line, &self.tail);

        // Directive extraction: merge carry, split into complete lines, keep
        // any unterminated remainder as carry for the next feed.
        let combined = format!("{}{}", self.carry, stripped);
        let (lines, carry) = directive::split_lines_with_carry(&combined);
        self.carry = carry;
        let now = Instant::now();
        self.directive_seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < DIRECTIVE_DEDUP_WINDOW);
        for line in lines {
            if let Some(parsed) = directive::parse_line(&line) {
                let first_seen = match self.directive_seen.get(&parsed.raw) {
                    Some(seen_at) => now.duration_since(*seen_at) >= DIRECTIVE_DEDUP_WINDOW,
                    None => true,
                };
                if first_seen {
                    self.directive_seen.insert(parsed.raw, now);
                    report.directives.push(parsed.directive);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_directive_is_deduped_within_window() {
        let mut scanner = Scanner::new("orch-session");
        let line = "FYP_DISPATCH_JSON: {\"target\":\"all\",\"text\":\"go\"}\n";
        let first = scanner.feed_str(line);
        assert_eq!(first.directives.len(), 1);
        let second = scanner.feed_str(line);
        assert!(second.directives.is_empty());
    }

    #[test]
    fn directive_split_across_chunk_boundary_is_tolerated() {
        let mut scanner = Scanner::new("s1");
        let first = scanner.feed_str("FYP_DISPATCH_JSON: {\"target\":\"all\",");
        assert!(first.directives.is_empty());
        let second = scanner.feed_str("\"text\":\"go\"}\n");
        assert_eq!(second.directives.len(), 1);
    }

    #[test]
    fn approval_prompt_is_detected_from_fed_output() {
        let mut scanner = Scanner::new("s1");
        let report =
            scanner.feed_str("Do you want to approve access to \"example.com\"?\n");
        assert!(report.approval.is_some());
        assert!(report.approval.unwrap().signature.ends_with("example.com"));
    }

    #[test]
    fn preview_updates_and_then_throttles() {
        let mut scanner = Scanner::new("s1");
        let first = scanner.feed_str("step one\r");
        assert!(first.preview.is_some());
        let second = scanner.feed_str("step two\r");
        // Same instant: throttle window hasn't elapsed, so no new preview.
        assert!(second.preview.is_none());
    }
}
