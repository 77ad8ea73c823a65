//! Logging utilities for sanitizing multi-line message text so logs stay single-line.
//! Escapes control characters that otherwise break log readability.

use std::fmt::Write;

/// Longest content preview written to the log, in chars.
const PREVIEW_CHARS: usize = 48;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///
/// Stops after `max_chars` characters and appends an ellipsis.
pub fn escape_log(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_chars) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_chars {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Short escaped preview of message content for debug lines.
pub fn preview(s: &str) -> String {
    escape_log(s, PREVIEW_CHARS)
}
