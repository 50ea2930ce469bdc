//! Generic menu-assist extraction: heuristic option-label mining for
//! prompts that aren't one of the four recognized Codex approval patterns.

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

const WINDOW_LINES: usize = 34;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AssistOption {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistSnapshot {
    pub title: String,
    pub body: String,
    pub options: Vec<AssistOption>,
    pub hints: Vec<String>,
    pub signature: String,
}

static PAREN_OPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\(([A-Za-z0-9])\)\s+(.+)$").unwrap());
static BRACKET_OPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([A-Za-z0-9])\]\s+(.+)$").unwrap());
static BARE_PAREN_OPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9])\)\s+(.+)$").unwrap());
static NUMBERED_OPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)\.\s+(.+)$").unwrap());
static INLINE_OPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([A-Za-z0-9])\)\s*([^\(\)]+)").unwrap());
static YN_PROMPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b[yY]/[nN]\b").unwrap());
static REPLY_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reply with ([A-Za-z0-9_-]+)").unwrap());

const NAV_HINTS: &[(&str, &str)] = &[
    ("shift+tab", "Shift+Tab"),
    ("shift-tab", "Shift+Tab"),
    ("tab", "Tab"),
    ("enter", "Enter"),
    ("esc", "Esc"),
    ("escape", "Esc"),
    ("arrow", "Arrow keys"),
];

fn extract_options(lines: &[&str]) -> Vec<AssistOption> {
    let mut options = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if let Some(c) = PAREN_OPT
            .captures(trimmed)
            .or_else(|| BRACKET_OPT.captures(trimmed))
            .or_else(|| BARE_PAREN_OPT.captures(trimmed))
            .or_else(|| NUMBERED_OPT.captures(trimmed))
        {
            options.push(AssistOption {
                key: c.get(1).unwrap().as_str().to_string(),
                label: c.get(2).unwrap().as_str().trim().to_string(),
            });
            continue;
        }
        for c in INLINE_OPT.captures_iter(trimmed) {
            options.push(AssistOption {
                key: c.get(1).unwrap().as_str().to_string(),
                label: c.get(2).unwrap().as_str().trim().to_string(),
            });
        }
    }
    options
}

fn extract_hints(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut hints: Vec<String> = NAV_HINTS
        .iter()
        .filter(|(needle, _)| lower.contains(needle))
        .map(|(_, label)| label.to_string())
        .collect();
    hints.dedup();
    if let Some(caps) = REPLY_CODE.captures(text) {
        hints.push(format!("reply with {}", caps.get(1).unwrap().as_str()));
    }
    if YN_PROMPT.is_match(text) {
        hints.push("y/n".to_string());
    }
    hints
}

fn signature_of(title: &str, body: &str, options: &[AssistOption]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hasher.update([0u8]);
    for opt in options {
        hasher.update(opt.key.as_bytes());
        hasher.update(opt.label.as_bytes());
    }
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::with_capacity(chars);
    for b in bytes {
        if s.len() >= chars {
            break;
        }
        s.push_str(&format!("{b:02x}"));
    }
    s.truncate(chars);
    s
}

/// Extracts option labels and navigation hints from the last ~34 lines of
/// CR-split output. Returns `None` when nothing resembling a menu is found.
pub fn extract_assist(tail: &str) -> Option<AssistSnapshot> {
    let normalized = tail.replace("\r\n", "\r").replace('\n', "\r");
    let all_lines: Vec<&str> = normalized.split('\r').collect();
    let window: Vec<&str> = all_lines
        .iter()
        .rev()
        .take(WINDOW_LINES)
        .rev()
        .copied()
        .collect();

    let options = extract_options(&window);
    let hints = extract_hints(&normalized);
    if options.is_empty() && hints.is_empty() {
        return None;
    }

    let title = window
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty() && !PAREN_OPT.is_match(l.trim()))
        .map(|l| l.trim().to_string())
        .unwrap_or_default();
    let body = window.join("\n");
    let signature = signature_of(&title, &body, &options);

    Some(AssistSnapshot {
        title,
        body,
        options,
        hints,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_parenthesized_options() {
        let tail = "Pick one:\n(Y) Yes\n(N) No\n(A) Always";
        let assist = extract_assist(tail).unwrap();
        assert_eq!(assist.options.len(), 3);
        assert_eq!(assist.options[0].key, "Y");
        assert_eq!(assist.options[0].label, "Yes");
    }

    #[test]
    fn extracts_inline_options_and_yn_hint() {
        let tail = "Continue? (Y) Yes (N) No [y/n]";
        let assist = extract_assist(tail).unwrap();
        assert!(assist.options.iter().any(|o| o.key == "Y"));
        assert!(assist.hints.iter().any(|h| h == "y/n"));
    }

    #[test]
    fn signature_changes_when_options_change() {
        let a = extract_assist("(Y) Yes\n(N) No").unwrap();
        let b = extract_assist("(Y) Yes\n(N) No\n(A) Always").unwrap();
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn no_menu_returns_none() {
        assert!(extract_assist("just streaming normal progress output").is_none());
    }
}
