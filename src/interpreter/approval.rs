//! Codex TUI approval prompt detection.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Danger,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionSpec {
    pub id: String,
    pub label: String,
    pub keys: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalCandidate {
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub signature: String,
    pub options: Vec<OptionSpec>,
}

static NET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"Do you want to approve access to "([^"]+)"\?"#).unwrap());
static EXEC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Would you like to run the following command\?").unwrap());
static EXEC_CMD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*\$\s*(.+)$").unwrap());
static PATCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Would you like to make the following edits\?").unwrap());
static MCP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(.+?) needs your approval\.\s*$").unwrap());
static DONT_ASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)don't ask again").unwrap());

/// Detects one of the four Codex TUI approval prompts in the given tail of
/// recent output. Returns `None` rather than erring when nothing matches.
pub fn detect_approval(session_id: &str, tail: &str) -> Option<ApprovalCandidate> {
    if let Some(caps) = NET_RE.captures(tail) {
        let host = caps.get(1).unwrap().as_str().to_string();
        return Some(ApprovalCandidate {
            kind: "codex.approval".to_string(),
            severity: Severity::Danger,
            title: "Approve network access?".to_string(),
            body: tail_window(tail),
            signature: format!("{session_id}|codex.approval|net|{host}"),
            options: vec![
                OptionSpec {
                    id: "y".to_string(),
                    label: "Yes once".to_string(),
                    keys: "y".to_string(),
                },
                OptionSpec {
                    id: "a".to_string(),
                    label: "Allow for session".to_string(),
                    keys: "a".to_string(),
                },
                OptionSpec {
                    id: "n".to_string(),
                    label: "No".to_string(),
                    keys: "n".to_string(),
                },
                OptionSpec {
                    id: "esc".to_string(),
                    label: "Cancel".to_string(),
                    keys: "\x1b".to_string(),
                },
            ],
        });
    }

    if EXEC_RE.is_match(tail) {
        let cmd = EXEC_CMD_RE
            .captures(tail)
            .map(|c| c.get(1).unwrap().as_str().trim().to_string());
        let mut options = vec![
            OptionSpec {
                id: "y".to_string(),
                label: "Yes once".to_string(),
                keys: "y".to_string(),
            },
            OptionSpec {
                id: "n".to_string(),
                label: "No".to_string(),
                keys: "n".to_string(),
            },
        ];
        if DONT_ASK_RE.is_match(tail) {
            options.push(OptionSpec {
                id: "a".to_string(),
                label: "Don't ask again for this prefix".to_string(),
                keys: "a".to_string(),
            });
        }
        let cmd_key = cmd.clone().unwrap_or_else(|| "unknown".to_string());
        return Some(ApprovalCandidate {
            kind: "codex.approval".to_string(),
            severity: Severity::Warn,
            title: "Approve command execution?".to_string(),
            body: tail_window(tail),
            signature: format!("{session_id}|codex.approval|exec|{cmd_key}"),
            options,
        });
    }

    if PATCH_RE.is_match(tail) {
        return Some(ApprovalCandidate {
            kind: "codex.approval".to_string(),
            severity: Severity::Warn,
            title: "Approve edits?".to_string(),
            body: tail_window(tail),
            signature: format!("{session_id}|codex.approval|patch"),
            options: vec![
                OptionSpec {
                    id: "y".to_string(),
                    label: "Yes".to_string(),
                    keys: "y".to_string(),
                },
                OptionSpec {
                    id: "n".to_string(),
                    label: "No".to_string(),
                    keys: "n".to_string(),
                },
            ],
        });
    }

    if let Some(caps) = MCP_RE.captures(tail) {
        let server = caps.get(1).unwrap().as_str().trim().to_string();
        return Some(ApprovalCandidate {
            kind: "codex.approval".to_string(),
            severity: Severity::Info,
            title: format!("{server} needs your approval"),
            body: tail_window(tail),
            signature: format!("{session_id}|codex.approval|mcp|{server}"),
            options: vec![
                OptionSpec {
                    id: "y".to_string(),
                    label: "Approve".to_string(),
                    keys: "y".to_string(),
                },
                OptionSpec {
                    id: "n".to_string(),
                    label: "Deny".to_string(),
                    keys: "n".to_string(),
                },
            ],
        });
    }

    None
}

fn tail_window(tail: &str) -> String {
    let lines: Vec<&str> = tail.lines().rev().take(8).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_network_approval_with_host_signature() {
        let out =
            detect_approval("s1", "Do you want to approve access to \"example.com\"?").unwrap();
        assert_eq!(out.kind, "codex.approval");
        assert_eq!(out.severity, Severity::Danger);
        assert!(out.signature.ends_with("|net|example.com"));
        assert_eq!(out.options.len(), 4);
    }

    #[test]
    fn detects_exec_approval_with_command_capture() {
        let tail = "$ rm -rf build\nWould you like to run the following command?";
        let out = detect_approval("s1", tail).unwrap();
        assert_eq!(out.severity, Severity::Warn);
        assert!(out.signature.contains("rm -rf build"));
    }

    #[test]
    fn exec_approval_falls_back_to_unknown_without_command() {
        let out = detect_approval("s1", "Would you like to run the following command?").unwrap();
        assert!(out.signature.ends_with("|exec|unknown"));
    }

    #[test]
    fn detects_patch_approval() {
        let out = detect_approval("s1", "Would you like to make the following edits?").unwrap();
        assert!(out.signature.ends_with("|patch"));
    }

    #[test]
    fn detects_mcp_server_approval() {
        let out = detect_approval("s1", "filesystem-server needs your approval.").unwrap();
        assert_eq!(out.severity, Severity::Info);
        assert!(out.signature.ends_with("|mcp|filesystem-server"));
    }

    #[test]
    fn no_match_returns_none() {
        assert!(detect_approval("s1", "just some regular output").is_none());
    }
}
