//! Completion and question cue detection, used by the automation timers.

use regex::Regex;
use std::sync::LazyLock;

static COMPLETION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)completed:|pending:|risks:|next:|final summary|handoff|task complete(d)?|done-when",
    )
    .unwrap()
});

static QUESTION_PACKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)question:").unwrap());
static OPTIONS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)options:").unwrap());
static BLOCKING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)blocking:").unwrap());
static EXPLICIT_ASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)need(s)? (a )?(decision|input|approval)|choose one|which option").unwrap()
});

const TAIL_CAP_BYTES: usize = 9 * 1024;

fn tail(text: &str) -> &str {
    if text.len() <= TAIL_CAP_BYTES {
        return text;
    }
    let start = text.len() - TAIL_CAP_BYTES;
    // avoid splitting a multi-byte UTF-8 char
    let mut idx = start;
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    &text[idx..]
}

/// Presence of any completion keyword on the latest preview line or a
/// ≤9 KB tail.
pub fn completion_cue(preview_line: Option<&str>, full_tail: &str) -> bool {
    if let Some(line) = preview_line {
        if COMPLETION_RE.is_match(line) {
            return true;
        }
    }
    COMPLETION_RE.is_match(tail(full_tail))
}

/// A structured `QUESTION:`/`OPTIONS:`/`BLOCKING:` packet, or an explicit
/// ask like "choose one", on the preview line or a ≤9 KB tail.
pub fn question_cue(preview_line: Option<&str>, full_tail: &str) -> bool {
    let check = |s: &str| -> bool {
        let structured =
            QUESTION_PACKET_RE.is_match(s) && OPTIONS_RE.is_match(s) && BLOCKING_RE.is_match(s);
        structured || EXPLICIT_ASK_RE.is_match(s)
    };
    if let Some(line) = preview_line {
        if check(line) {
            return true;
        }
    }
    check(tail(full_tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_completion_keywords_case_insensitively() {
        assert!(completion_cue(Some("Task Complete"), ""));
        assert!(completion_cue(None, "final summary of work done"));
        assert!(!completion_cue(Some("still working"), "streaming output"));
    }

    #[test]
    fn detects_structured_question_packet() {
        let tail = "QUESTION: pick a path\nOPTIONS: a, b\nBLOCKING: yes";
        assert!(question_cue(None, tail));
    }

    #[test]
    fn detects_explicit_ask_without_full_packet() {
        assert!(question_cue(Some("which option do you prefer?"), ""));
        assert!(!question_cue(Some("all good here"), "nothing to see"));
    }
}
