//! Structured directive extraction: `FYP_DISPATCH_JSON`, `FYP_SEND_TASK_JSON`,
//! `FYP_ANSWER_QUESTION_JSON` embedded as one-line JSON in the coordinator's
//! free-form output.

use serde::{Deserialize, Serialize};

const DISPATCH_PREFIX: &str = "FYP_DISPATCH_JSON:";
const SEND_TASK_PREFIX: &str = "FYP_SEND_TASK_JSON:";
const ANSWER_PREFIX: &str = "FYP_ANSWER_QUESTION_JSON:";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DispatchPayload {
    pub target: String,
    pub text: String,
    #[serde(default)]
    pub interrupt: bool,
    #[serde(default, rename = "forceInterrupt")]
    pub force_interrupt: bool,
    #[serde(default, rename = "includeBootstrapIfPresent")]
    pub include_bootstrap_if_present: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SendTaskPayload {
    pub target: String,
    pub task: String,
    #[serde(default)]
    pub initialize: bool,
    #[serde(default)]
    pub interrupt: bool,
    #[serde(default, rename = "forceInterrupt")]
    pub force_interrupt: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AnswerQuestionPayload {
    #[serde(rename = "attentionId")]
    pub attention_id: serde_json::Value,
    #[serde(rename = "optionId")]
    pub option_id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Directive {
    Dispatch(DispatchPayload),
    SendTask(SendTaskPayload),
    AnswerQuestion(AnswerQuestionPayload),
}

/// A line plus the raw directive text (prefix + JSON) used as the dedup key.
pub struct ParsedDirective {
    pub directive: Directive,
    pub raw: String,
}

/// Parses a single already-joined logical line (CR/LF normalized, one-line
/// carry already merged in) for a directive prefix. Lines are matched only
/// when the prefix appears (after leading whitespace) at the start of the
/// line; malformed JSON after a matched prefix yields `None` rather than an
/// error, per the interpreter's side-effect-free contract.
pub fn parse_line(line: &str) -> Option<ParsedDirective> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix(DISPATCH_PREFIX) {
        let payload: DispatchPayload = serde_json::from_str(rest.trim()).ok()?;
        return Some(ParsedDirective {
            directive: Directive::Dispatch(payload),
            raw: trimmed.trim_end().to_string(),
        });
    }
    if let Some(rest) = trimmed.strip_prefix(SEND_TASK_PREFIX) {
        let payload: SendTaskPayload = serde_json::from_str(rest.trim()).ok()?;
        return Some(ParsedDirective {
            directive: Directive::SendTask(payload),
            raw: trimmed.trim_end().to_string(),
        });
    }
    if let Some(rest) = trimmed.strip_prefix(ANSWER_PREFIX) {
        let payload: AnswerQuestionPayload = serde_json::from_str(rest.trim()).ok()?;
        return Some(ParsedDirective {
            directive: Directive::AnswerQuestion(payload),
            raw: trimmed.trim_end().to_string(),
        });
    }
    None
}

/// Splits CR/LF-normalized text into complete lines plus a trailing carry
/// (the tail that hasn't seen a line terminator yet). Callers prepend the
/// carry to the next chunk before calling this again, tolerating a directive
/// split across a chunk boundary as long as it doesn't span more than one
/// logical line (multi-line directive JSON is unsupported; see DESIGN.md).
pub fn split_lines_with_carry(text: &str) -> (Vec<String>, String) {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.ends_with('\n') {
        let lines = normalized
            .trim_end_matches('\n')
            .split('\n')
            .map(|s| s.to_string())
            .collect();
        (lines, String::new())
    } else {
        let mut parts: Vec<&str> = normalized.split('\n').collect();
        let carry = parts.pop().unwrap_or_default().to_string();
        (parts.into_iter().map(|s| s.to_string()).collect(), carry)
    }
}

/// Resolves a directive `target` string to a [`Target`] the caller
/// (orchestration dispatch) matches against its worker list.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    All,
    WorkerIndex(usize),
    WorkerName(String),
    SessionId(String),
    Ambiguous(String),
}

pub fn parse_target(raw: &str) -> Target {
    let t = raw.trim();
    if t == "all" || t == "*" {
        return Target::All;
    }
    if let Ok(n) = t.parse::<usize>() {
        if n >= 1 {
            return Target::WorkerIndex(n);
        }
    }
    if let Some(name) = t.strip_prefix("worker:") {
        return Target::WorkerName(name.to_string());
    }
    if let Some(sid) = t.strip_prefix("session:") {
        return Target::SessionId(sid.to_string());
    }
    Target::Ambiguous(t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dispatch_directive() {
        let line = r#"FYP_DISPATCH_JSON: {"target":"all","text":"go"}"#;
        let parsed = parse_line(line).unwrap();
        match parsed.directive {
            Directive::Dispatch(p) => {
                assert_eq!(p.target, "all");
                assert_eq!(p.text, "go");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ignores_lines_without_prefix_at_start() {
        assert!(parse_line("not a directive FYP_DISPATCH_JSON: {}").is_none());
    }

    #[test]
    fn tolerates_leading_whitespace() {
        let line = r#"   FYP_SEND_TASK_JSON: {"target":"worker:alpha","task":"build"}"#;
        assert!(parse_line(line).is_some());
    }

    #[test]
    fn malformed_json_yields_none_not_error() {
        let line = "FYP_DISPATCH_JSON: {not json}";
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn splits_lines_and_preserves_unterminated_carry() {
        let (lines, carry) = split_lines_with_carry("line one\nline two\npartial-tail");
        assert_eq!(lines, vec!["line one", "line two"]);
        assert_eq!(carry, "partial-tail");
    }

    #[test]
    fn target_grammar_resolves_all_variants() {
        assert_eq!(parse_target("all"), Target::All);
        assert_eq!(parse_target("*"), Target::All);
        assert_eq!(parse_target("2"), Target::WorkerIndex(2));
        assert_eq!(
            parse_target("worker:alpha"),
            Target::WorkerName("alpha".to_string())
        );
        assert_eq!(
            parse_target("session:s1"),
            Target::SessionId("s1".to_string())
        );
        assert_eq!(parse_target("s1"), Target::Ambiguous("s1".to_string()));
    }
}
