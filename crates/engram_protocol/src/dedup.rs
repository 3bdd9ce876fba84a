//! Deterministic deduplication keys for enqueue calls.
//!
//! A dedup key collapses equivalent enqueues while the earlier task is
//! non-terminal. Keys are blake3 over the identifying payload subset with
//! an explicit separator so adjacent fields cannot collide.

use crate::types::TaskType;
use blake3::Hasher;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Key for an observation task: one per (session, prompt, tool invocation).
pub fn observation_key(
    session_id: &str,
    prompt_number: i64,
    tool_name: &str,
    tool_input: &serde_json::Value,
) -> String {
    let input_hash = hash_parts(&[&tool_input.to_string()]);
    hash_parts(&[
        TaskType::Observation.as_str(),
        session_id,
        &prompt_number.to_string(),
        tool_name,
        &input_hash,
    ])
}

/// Key for a summarize task: one non-terminal summary per session.
pub fn summarize_key(session_id: &str) -> String {
    hash_parts(&[TaskType::Summarize.as_str(), session_id])
}

/// General-purpose key over an explicit part list.
pub fn key_for(task_type: TaskType, parts: &[&str]) -> String {
    let mut all = Vec::with_capacity(parts.len() + 1);
    all.push(task_type.as_str());
    all.extend_from_slice(parts);
    hash_parts(&all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_key_deterministic() {
        let input = serde_json::json!({"file_path": "/tmp/a.rs"});
        let a = observation_key("sess-1", 3, "Edit", &input);
        let b = observation_key("sess-1", 3, "Edit", &input);
        assert_eq!(a, b);
    }

    #[test]
    fn test_observation_key_varies_by_prompt() {
        let input = serde_json::json!({"file_path": "/tmp/a.rs"});
        let a = observation_key("sess-1", 3, "Edit", &input);
        let b = observation_key("sess-1", 4, "Edit", &input);
        assert_ne!(a, b);
    }

    #[test]
    fn test_separator_prevents_field_bleed() {
        let a = key_for(TaskType::Embedding, &["ab", "c"]);
        let b = key_for(TaskType::Embedding, &["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_summarize_key_is_per_session() {
        assert_ne!(summarize_key("sess-1"), summarize_key("sess-2"));
    }
}
