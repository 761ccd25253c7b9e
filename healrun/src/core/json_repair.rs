//! Best-effort recovery of near-valid JSON replies.
//!
//! Models routinely emit JSON with raw newlines inside strings or with shell
//! snippets such as `\list` that are not valid escapes. [`repair_json`] fixes
//! those one character at a time, driven by the decoder's error position.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// Maximum number of single-character fixes applied by [`repair_json`].
pub const MAX_REPAIR_ITERATIONS: usize = 50;

static FENCED_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[\w-]*\s*(\{.*?\})\s*```").unwrap());

/// How a repair attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The text decodes.
    Valid,
    /// The decoder stopped at a character repair does not know how to fix.
    Unresolved { offset: usize, found: char },
    /// The iteration budget ran out before the text decoded.
    Exhausted,
}

/// Result of [`repair_json_report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonRepair {
    pub text: String,
    /// Number of fixes applied.
    pub iterations: usize,
    pub outcome: RepairOutcome,
}

enum Fix {
    EscapeBackslash(usize),
    EscapeNewline(usize),
}

/// Repair `text` and return it in its final form, which may still be invalid.
pub fn repair_json(text: &str) -> String {
    repair_json_report(text).text
}

/// Repair `text`, reporting how many fixes were applied and why repair stopped.
pub fn repair_json_report(text: &str) -> JsonRepair {
    let mut current = text.to_string();
    let mut iterations = 0;
    loop {
        let err = match serde_json::from_str::<Value>(&current) {
            Ok(_) => {
                return JsonRepair {
                    text: current,
                    iterations,
                    outcome: RepairOutcome::Valid,
                };
            }
            Err(err) => err,
        };
        if iterations == MAX_REPAIR_ITERATIONS {
            warn!(iterations, "json repair budget exhausted");
            return JsonRepair {
                text: current,
                iterations,
                outcome: RepairOutcome::Exhausted,
            };
        }

        let offset = error_offset(&current, err.line(), err.column());
        match locate_fix(current.as_bytes(), offset, DecodeError::classify(&err)) {
            Some(Fix::EscapeBackslash(at)) => current.insert(at, '\\'),
            Some(Fix::EscapeNewline(at)) => current.replace_range(at..at + 1, "\\n"),
            None => {
                let found = char_near(&current, offset);
                warn!(
                    offset,
                    found = ?found,
                    near = %context_window(&current, offset),
                    "found bad character in json"
                );
                return JsonRepair {
                    text: current,
                    iterations,
                    outcome: RepairOutcome::Unresolved { offset, found },
                };
            }
        }
        iterations += 1;
        debug!(iterations, offset, "applied json fix");
    }
}

/// Byte offset of the last character the decoder consumed.
///
/// `line` and `column` are serde_json's 1-based coordinates; column 0 means
/// the error was detected right after a newline.
fn error_offset(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column)
        .saturating_sub(1)
        .min(text.len().saturating_sub(1))
}

/// The decoder errors repair knows how to fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeError {
    InvalidEscape,
    ControlCharacter,
    Other,
}

impl DecodeError {
    fn classify(err: &serde_json::Error) -> Self {
        let message = err.to_string();
        if message.starts_with("invalid escape") {
            Self::InvalidEscape
        } else if message.starts_with("control character") {
            Self::ControlCharacter
        } else {
            Self::Other
        }
    }
}

/// Find the fixable character at the reported offset. Invalid escapes are
/// reported at the character after their backslash.
fn locate_fix(bytes: &[u8], offset: usize, error: DecodeError) -> Option<Fix> {
    match error {
        DecodeError::InvalidEscape => {
            let at = offset.checked_sub(1)?;
            (bytes.get(at) == Some(&b'\\')).then_some(Fix::EscapeBackslash(at))
        }
        DecodeError::ControlCharacter => {
            (bytes.get(offset) == Some(&b'\n')).then_some(Fix::EscapeNewline(offset))
        }
        DecodeError::Other => None,
    }
}

fn char_near(text: &str, offset: usize) -> char {
    let mut at = offset.min(text.len());
    while !text.is_char_boundary(at) {
        at -= 1;
    }
    text[at..].chars().next().unwrap_or(' ')
}

fn context_window(text: &str, offset: usize) -> &str {
    let mut start = offset.saturating_sub(20);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (offset + 20).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

/// Strip a triple-backtick fence (with or without a language tag) around a
/// JSON object. Returns the full text when no fenced object is present.
pub fn extract_json_fenced(text: &str) -> &str {
    FENCED_OBJECT_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map_or(text, |m| m.as_str())
}

/// Replace single backticks that are not part of a fence with single quotes.
pub fn normalize_inline_backticks(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    chars
        .iter()
        .enumerate()
        .map(|(i, &ch)| {
            let lone = ch == '`'
                && (i == 0 || chars[i - 1] != '`')
                && chars.get(i + 1).is_none_or(|&next| next != '`');
            if lone { '\'' } else { ch }
        })
        .collect()
}

/// Slice from the first `{` to the last `}`, when both exist in order.
fn outer_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Decode a JSON object out of a raw reply: trim, normalize inline backticks,
/// strip fences, repair, decode. Falls back to the outermost braces when prose
/// surrounds the object.
pub fn parse_json_reply(reply: &str) -> Result<Value, serde_json::Error> {
    let normalized = normalize_inline_backticks(reply.trim());
    let candidate = extract_json_fenced(&normalized);
    match serde_json::from_str(&repair_json(candidate)) {
        Ok(value) => Ok(value),
        Err(err) => match outer_object(candidate) {
            Some(inner) if inner.len() < candidate.len() => {
                debug!("retrying json decode on outermost object");
                serde_json::from_str(&repair_json(inner))
            }
            _ => Err(err),
        },
    }
}
