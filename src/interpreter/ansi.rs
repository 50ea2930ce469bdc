//! Terminal control sequence stripping and preview line extraction.
//!
//! Pure byte-level functions; no allocation beyond the output buffer, no
//! session state.

/// Strips CSI (7- and 8-bit), OSC (7- and 8-bit), and DCS sequences, and
/// collapses `\b`/DEL as erase-previous-char. Idempotent:
/// `strip(strip(x)) == strip(x)`.
pub fn strip_controls(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        match b {
            0x1B if i + 1 < input.len() => {
                let next = input[i + 1];
                match next {
                    b'[' => {
                        let mut j = i + 2;
                        while j < input.len() && !(0x40..=0x7E).contains(&input[j]) {
                            j += 1;
                        }
                        i = if j < input.len() { j + 1 } else { input.len() };
                    }
                    b']' => {
                        i = skip_until_st_or_bel(input, i + 2);
                    }
                    b'P' => {
                        i = skip_until_st(input, i + 2);
                    }
                    _ => i += 2,
                }
            }
            0x1B => i += 1,
            0x9B => {
                let mut j = i + 1;
                while j < input.len() && !(0x40..=0x7E).contains(&input[j]) {
                    j += 1;
                }
                i = if j < input.len() { j + 1 } else { input.len() };
            }
            0x9D => {
                let mut j = i + 1;
                while j < input.len() && input[j] != 0x9C && input[j] != 0x07 {
                    j += 1;
                }
                i = (j + 1).min(input.len());
            }
            0x08 | 0x7F => {
                out.pop();
                i += 1;
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn skip_until_st_or_bel(input: &[u8], mut j: usize) -> usize {
    loop {
        if j >= input.len() {
            return input.len();
        }
        if input[j] == 0x07 {
            return j + 1;
        }
        if input[j] == 0x1B && j + 1 < input.len() && input[j + 1] == b'\\' {
            return j + 2;
        }
        j += 1;
    }
}

fn skip_until_st(input: &[u8], mut j: usize) -> usize {
    loop {
        if j >= input.len() {
            return input.len();
        }
        if input[j] == 0x1B && j + 1 < input.len() && input[j + 1] == b'\\' {
            return j + 2;
        }
        j += 1;
    }
}

/// Strips controls and returns a best-effort UTF-8 string.
pub fn strip_controls_to_string(input: &[u8]) -> String {
    String::from_utf8_lossy(&strip_controls(input)).into_owned()
}

const PREVIEW_MAX_CHARS: usize = 220;

/// Extracts the last non-empty, de-noised line, treating `\r` as a line
/// boundary (TUIs redraw lines with CR) in addition to `\n`.
pub fn last_line_preview(text: &str) -> Option<String> {
    let normalized = text.replace("\r\n", "\r").replace('\n', "\r");
    let line = normalized.split('\r').rev().find(|s| !s.trim().is_empty())?;
    let trimmed = line.trim();
    Some(trimmed.chars().take(PREVIEW_MAX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_is_idempotent() {
        let raw = b"\x1b[31mhello\x1b[0m \x1b]0;title\x07 world\x1bP1$r0\x1b\\end";
        let once = strip_controls(raw);
        let twice = strip_controls(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn strip_is_noop_on_plain_ascii() {
        let raw = b"plain ascii text, no surprises";
        assert_eq!(strip_controls(raw), raw.to_vec());
    }

    #[test]
    fn strip_removes_csi_osc_dcs() {
        let raw = b"\x1b[1;31mRED\x1b[0m\x1b]0;T\x07\x1bP+q\x1b\\";
        assert_eq!(strip_controls_to_string(raw), "RED");
    }

    #[test]
    fn backspace_and_del_erase_previous_char() {
        assert_eq!(strip_controls_to_string(b"abc\x08\x08d"), "ad");
        assert_eq!(strip_controls_to_string(b"abc\x7Fd"), "abd");
    }

    #[test]
    fn preview_takes_last_segment_after_cr() {
        let text = "progress: 10%\rprogress: 55%\rprogress: 99%";
        assert_eq!(
            last_line_preview(text).as_deref(),
            Some("progress: 99%")
        );
    }

    #[test]
    fn preview_clamps_to_220_chars() {
        let long = "x".repeat(500);
        let preview = last_line_preview(&long).unwrap();
        assert_eq!(preview.len(), 220);
    }
}
