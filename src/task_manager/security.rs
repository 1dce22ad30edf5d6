use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

const REDACTED: &str = "[REDACTED]";

/// Longest error text kept on a detail or history row.
const MAX_STORED_ERROR_CHARS: usize = 1024;

static INLINE_SECRET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)"?\b(password|passwd|pwd|secret|token|access_token|api[_-]?key|access[_-]?key)\b"?\s*([:=])\s*"?([^\s,;"}]+)"?"#,
    )
    .expect("valid inline secret pattern")
});

static BEARER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bearer|basic)\s+[A-Za-z0-9._~+/=-]+").expect("valid bearer pattern")
});

static URI_CREDENTIAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([a-z][a-z0-9+.-]*://[^:@/\s]+:)([^@/\s]+)(@)")
        .expect("valid uri credential pattern")
});

const SENSITIVE_KEY_TOKENS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_key",
    "authorization",
    "credential",
];

pub fn redact_sensitive_text(input: &str) -> String {
    let redacted_inline = INLINE_SECRET_REGEX.replace_all(input, |caps: &Captures| {
        format!("{}{}{}", &caps[1], &caps[2], REDACTED)
    });
    let redacted_bearer = BEARER_REGEX.replace_all(&redacted_inline, |caps: &Captures| {
        format!("{} {}", &caps[1], REDACTED)
    });
    URI_CREDENTIAL_REGEX
        .replace_all(&redacted_bearer, |caps: &Captures| {
            format!("{}{}{}", &caps[1], REDACTED, &caps[3])
        })
        .to_string()
}

/// Redacts and bounds an error message before it is persisted.
pub fn sanitize_error_message(input: &str) -> String {
    let redacted = redact_sensitive_text(input.trim());
    if redacted.chars().count() <= MAX_STORED_ERROR_CHARS {
        return redacted;
    }
    let mut truncated: String = redacted.chars().take(MAX_STORED_ERROR_CHARS).collect();
    truncated.push_str("...");
    truncated
}

pub fn redact_sensitive_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(redact_object(map)),
        Value::Array(values) => Value::Array(values.iter().map(redact_sensitive_json).collect()),
        Value::String(text) => Value::String(redact_sensitive_text(text)),
        other => other.clone(),
    }
}

fn redact_object(map: &Map<String, Value>) -> Map<String, Value> {
    let mut output = Map::new();
    for (key, value) in map {
        if is_sensitive_key(key) {
            output.insert(key.clone(), Value::String(REDACTED.to_string()));
        } else {
            output.insert(key.clone(), redact_sensitive_json(value));
        }
    }
    output
}

fn is_sensitive_key(key: &str) -> bool {
    let normalized = key
        .trim()
        .to_ascii_lowercase()
        .replace(['-', ' ', '.'], "_");
    SENSITIVE_KEY_TOKENS
        .iter()
        .any(|token| normalized.contains(token))
}

#[cfg(test)]
mod tests;
