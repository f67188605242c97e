//! Helpers for putting radio-supplied text, passwords and public keys into log records.

use std::borrow::Cow;
use std::fmt::Write;

/// Characters kept from a user string before it is cut off with `…`.
const MAX_LOGGED_CHARS: usize = 300;

/// Render user-supplied text (message bodies, contact names, command replies) on one
/// log line. Newlines, tabs, backslashes and other control characters are escaped and
/// anything past [`MAX_LOGGED_CHARS`] is replaced by `…`. Clean short input is borrowed.
pub fn escape_log(s: &str) -> Cow<'_, str> {
    let clean = !s.chars().any(|c| c == '\\' || c.is_control());
    if clean && s.chars().nth(MAX_LOGGED_CHARS).is_none() {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len().min(MAX_LOGGED_CHARS) + 8);
    let mut chars = s.chars();
    for ch in chars.by_ref().take(MAX_LOGGED_CHARS) {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    if chars.next().is_some() {
        out.push('…');
    }
    Cow::Owned(out)
}

/// Stand-in for a password in log output. Empty passwords are guest logins.
pub fn redact_secret(secret: &str) -> &'static str {
    if secret.is_empty() {
        "guest"
    } else {
        "****"
    }
}

/// First 12 hex digits of a public key, enough to tell nodes apart in logs.
pub fn key_preview(key: &str) -> String {
    const PREVIEW: usize = 12;
    let key = key.trim();
    if key.is_empty() {
        return "<no key>".to_string();
    }
    if key.len() <= PREVIEW || !key.is_char_boundary(PREVIEW) {
        return key.to_lowercase();
    }
    format!("{}…", key[..PREVIEW].to_lowercase())
}
