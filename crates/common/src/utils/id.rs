use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use uuid::Uuid;

use crate::constants::MAX_SESSION_NAME_LENGTH;

/// Generate a correlation id for a relay operation using UUID v4
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate an STS role session name for a function.
///
/// Format: `{function}-{millis}-{suffix}`, restricted to the characters STS
/// accepts and truncated so the whole name stays within 64 characters.
pub fn generate_session_name(function_name: &str, timestamp_millis: u64) -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let tail = format!("-{}-{}", timestamp_millis, suffix);

    let mut prefix: String = function_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_+=,.@-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect();
    if prefix.is_empty() {
        prefix.push_str("live");
    }
    prefix.truncate(MAX_SESSION_NAME_LENGTH.saturating_sub(tail.len()));

    format!("{}{}", prefix, tail)
}
