//! Action parsing from free-form LLM responses
//!
//! Three forms are accepted, tried in order:
//! 1. a fenced ```action block containing YAML
//! 2. a fenced ```yaml block
//! 3. a bare `action: NAME` (or `name: NAME`) line
//!
//! A response containing the word "complete" degrades to the `complete`
//! action; anything else parses to `unknown`, which the dispatcher rejects
//! visibly so the loop detector can see the pattern. Parsing never raises.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::warn;

/// Action parameters as sent by the LLM
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Expected response shape from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub action: String,
    #[serde(default)]
    pub parameters: Params,
    #[serde(default)]
    pub reasoning: Option<String>,
}

fn action_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```action\s*\n(.*?)```").expect("static regex"))
}

fn yaml_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```yaml\s*\n(.*?)```").expect("static regex"))
}

fn inline_action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"action:\s*(\w+)").expect("static regex"))
}

fn inline_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"name:\s*(\w+)").expect("static regex"))
}

/// Parse an action name and parameter map out of a response.
/// Never fails; unparseable responses yield `("unknown", {})`.
pub fn parse_action(response_text: &str) -> (String, Params) {
    if let Some(captures) = action_block_re().captures(response_text)
        && let Some(parsed) = parse_yaml_body(captures[1].trim())
    {
        return parsed;
    }

    if let Some(captures) = yaml_block_re().captures(response_text)
        && let Some(parsed) = parse_yaml_body(captures[1].trim())
    {
        return parsed;
    }

    if let Some(captures) = inline_action_re().captures(response_text) {
        return (captures[1].to_string(), Params::new());
    }
    if let Some(captures) = inline_name_re().captures(response_text) {
        return (captures[1].to_string(), Params::new());
    }

    if response_text.to_lowercase().contains("complete") {
        return ("complete".to_string(), Params::new());
    }

    ("unknown".to_string(), Params::new())
}

/// Parse a YAML body into (action, parameters). Returns None when the body
/// is not a mapping or carries no action name, letting the caller fall
/// through to the next form.
fn parse_yaml_body(body: &str) -> Option<(String, Params)> {
    let value: serde_yaml::Value = match serde_yaml::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "YAML parsing failed for action block");
            return None;
        }
    };

    let mapping = value.as_mapping()?;
    let action = mapping
        .get("action")
        .or_else(|| mapping.get("name"))?
        .as_str()?
        .to_string();

    let parameters = mapping
        .get("parameters")
        .cloned()
        .and_then(|v| serde_json::to_value(v).ok())
        .and_then(|v| match v {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    let (valid, error) = validate(&action, &parameters);
    if !valid {
        // Best effort: log and proceed with the parsed values anyway
        warn!(action = %action, error = ?error, "response validation failed");
    }

    Some((action, parameters))
}

/// Validate the parsed structure. Action must be a non-empty name; path and
/// content parameters, when present, must be scalar strings.
pub fn validate(action: &str, parameters: &Params) -> (bool, Option<String>) {
    if action.is_empty() {
        return (false, Some("Action name must be a non-empty string".to_string()));
    }

    for key in ["path", "file_path"] {
        if let Some(value) = parameters.get(key)
            && !value.is_string()
        {
            return (false, Some(format!("{} parameter must be a string", key)));
        }
    }
    if let Some(content) = parameters.get("content")
        && !content.is_null()
        && !content.is_string()
    {
        return (false, Some("content parameter must be a string".to_string()));
    }

    (true, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_action_block() {
        let response = "I'll read the file first.\n\n```action\naction: read_file\nparameters:\n  path: src/m.py\n```\n";
        let (action, params) = parse_action(response);
        assert_eq!(action, "read_file");
        assert_eq!(params.get("path").unwrap(), "src/m.py");
    }

    #[test]
    fn test_parse_yaml_block() {
        let response = "```yaml\naction: extract_function\nparameters:\n  file_path: src/m.py\n  start_line: 40\n  end_line: 60\n  new_function_name: foo_helper\nreasoning: reduce complexity\n```";
        let (action, params) = parse_action(response);
        assert_eq!(action, "extract_function");
        assert_eq!(params.get("start_line").unwrap(), 40);
        assert_eq!(params.get("new_function_name").unwrap(), "foo_helper");
    }

    #[test]
    fn test_action_block_preferred_over_yaml_block() {
        let response = "```yaml\naction: wrong\n```\n```action\naction: right\n```";
        // action fence wins even though yaml fence appears first
        let (action, _) = parse_action(response);
        assert_eq!(action, "right");
    }

    #[test]
    fn test_parse_inline_action_line() {
        let (action, params) = parse_action("I think we should do this:\naction: run_check");
        assert_eq!(action, "run_check");
        assert!(params.is_empty());
    }

    #[test]
    fn test_parse_name_line() {
        let (action, _) = parse_action("name: escalate");
        assert_eq!(action, "escalate");
    }

    #[test]
    fn test_complete_substring_fallback() {
        let (action, _) = parse_action("The task looks complete to me.");
        assert_eq!(action, "complete");
    }

    #[test]
    fn test_empty_response_is_unknown() {
        let (action, params) = parse_action("");
        assert_eq!(action, "unknown");
        assert!(params.is_empty());
    }

    #[test]
    fn test_garbage_yaml_falls_through() {
        let (action, _) = parse_action("```action\n[unclosed: {\n```\naction: read_file");
        assert_eq!(action, "read_file");
    }

    #[test]
    fn test_block_without_action_key_falls_through() {
        let (action, _) = parse_action("```yaml\nfoo: bar\n```\nnothing here");
        assert_eq!(action, "unknown");
    }

    #[test]
    fn test_validate_rejects_non_string_path() {
        let mut params = Params::new();
        params.insert("path".into(), serde_json::json!(42));
        let (valid, error) = validate("read_file", &params);
        assert!(!valid);
        assert!(error.unwrap().contains("path"));
    }

    #[test]
    fn test_validation_failure_still_parses() {
        // Bad path type: warn and proceed with parsed values
        let response = "```action\naction: read_file\nparameters:\n  path: 42\n```";
        let (action, params) = parse_action(response);
        assert_eq!(action, "read_file");
        assert_eq!(params.get("path").unwrap(), 42);
    }

    proptest! {
        // Parsing is total: any response yields some action name
        #[test]
        fn prop_parse_never_panics(input in ".*") {
            let (action, _) = parse_action(&input);
            prop_assert!(!action.is_empty());
        }
    }
}
