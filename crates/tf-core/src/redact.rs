//! Secret redaction for log records.
//!
//! Every value that reaches a log sink passes through [`redact_value`]. Keys
//! that look like credentials have their values replaced outright; values that
//! look like credentials are replaced regardless of their key. Command strings
//! get an extra regex pass through [`sanitize_command`] because secrets in argv
//! rarely sit under a telling key.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Replacement text for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Suffix appended to values cut at [`MAX_VALUE_LEN`].
pub const TRUNCATED_SUFFIX: &str = "...[TRUNCATED]";

/// Longest value (in chars) emitted before truncation.
pub const MAX_VALUE_LEN: usize = 1000;

/// Prefixes used by common API keys and tokens.
const SECRET_PREFIXES: &[&str] = &["sk-", "ghp_", "gho_", "ghu_", "ghs_", "ghr_", "eyJ"];

static SENSITIVE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(api[_-]?key|token|secret|password|auth|credential|bearer|private[_-]?key)")
        .unwrap()
});

/// `--api-key VALUE`, `--token=VALUE`, `--password:VALUE` and friends.
static FLAG_SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(--(?:api-key|token|secret|password))(\s+|[=:])("[^"]*"|'[^']*'|\S+)"#).unwrap()
});

/// `OPENAI_API_KEY=...` style environment assignments inside a command.
static ENV_SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([A-Z0-9_]*(?:API_KEY|TOKEN|SECRET|PASSWORD)[A-Z0-9_]*)=(\S+)").unwrap()
});

/// Bare tokens with well-known shapes.
static INLINE_SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sk-[A-Za-z0-9_\-]{6,}|gh[pousr]_[A-Za-z0-9]{6,}|eyJ[A-Za-z0-9_\-.]{6,})")
        .unwrap()
});

/// Returns true if values stored under `key` must never be logged.
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY_RE.is_match(key)
}

/// Returns true if `value` looks like a credential.
///
/// Either it starts with a known token prefix, or it is a long, nearly
/// space-free run of mostly alphanumeric characters.
pub fn looks_like_secret(value: &str) -> bool {
    if SECRET_PREFIXES.iter().any(|p| value.starts_with(p)) {
        return true;
    }

    let total = value.chars().count();
    if total <= 30 {
        return false;
    }
    let spaces = value.chars().filter(|c| *c == ' ').count();
    if spaces >= 2 {
        return false;
    }
    let alnum = value.chars().filter(|c| c.is_alphanumeric()).count();
    (alnum as f64 / total as f64) > 0.85
}

/// Cuts `value` to [`MAX_VALUE_LEN`] chars, marking the cut.
pub fn truncate_value(value: &str) -> String {
    if value.chars().count() <= MAX_VALUE_LEN {
        return value.to_string();
    }
    let mut out: String = value.chars().take(MAX_VALUE_LEN).collect();
    out.push_str(TRUNCATED_SUFFIX);
    out
}

/// Redacts a single value, walking nested objects and arrays.
///
/// `key` is the field name the value was logged under, if any.
pub fn redact_value(key: Option<&str>, value: &Value) -> Value {
    if key.is_some_and(is_sensitive_key) {
        return Value::String(REDACTED.to_string());
    }

    match value {
        Value::String(s) => {
            if looks_like_secret(s) {
                Value::String(REDACTED.to_string())
            } else {
                Value::String(truncate_value(s))
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_value(None, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(Some(k), v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Redacts every entry of a field map.
pub fn redact_fields(fields: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), redact_value(Some(k), v)))
        .collect()
}

/// Scrubs inline secrets from free text (messages, stderr excerpts).
pub fn sanitize_text(text: &str) -> String {
    INLINE_SECRET_RE.replace_all(text, REDACTED).into_owned()
}

/// Scrubs a shell command line before it is logged.
pub fn sanitize_command(command: &str) -> String {
    let flags = FLAG_SECRET_RE.replace_all(command, format!("${{1}}${{2}}{REDACTED}").as_str());
    let env = ENV_SECRET_RE.replace_all(&flags, format!("${{1}}={REDACTED}").as_str());
    sanitize_text(&env)
}
