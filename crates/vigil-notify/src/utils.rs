//! Utility functions for notification transports

use std::collections::BTreeMap;

/// Maximum length of a response body kept in error messages and logs
pub const MAX_BODY_LENGTH: usize = 4000;

/// Truncate a string to at most `max_len` bytes, respecting char boundaries
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

/// Replace every `{{name}}` placeholder with its value from `vars`.
/// Unknown placeholders are left untouched.
pub fn fill_placeholders(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

/// Percent-encode a value for `application/x-www-form-urlencoded` bodies.
pub fn form_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
