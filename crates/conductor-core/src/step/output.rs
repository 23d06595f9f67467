//! Structured output extraction from agent text.

use std::sync::OnceLock;

use regex::Regex;

fn fenced_json() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)```").ok())
        .as_ref()
}

/// The last fenced ```json block in `text` that parses.
pub fn extract_json_block(text: &str) -> Option<serde_json::Value> {
    let re = fenced_json()?;
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| serde_json::from_str(m.as_str().trim()).ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_valid_block_wins() {
        let text = "Plan:\n```json\n{\"files\": [\"a.rs\"]}\n```\nthen\n```json\n{\"files\": [\"b.rs\"]}\n```\n";
        assert_eq!(extract_json_block(text), Some(json!({"files": ["b.rs"]})));
    }

    #[test]
    fn test_invalid_blocks_are_ignored() {
        let text = "```json\n{\"ok\": true}\n```\n```json\n{not json}\n```";
        assert_eq!(extract_json_block(text), Some(json!({"ok": true})));
        assert_eq!(extract_json_block("no fences here"), None);
    }
}
