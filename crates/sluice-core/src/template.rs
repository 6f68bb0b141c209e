use crate::errors::TemplateError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// `{{node_id.path.to.key}}`: node id followed by an optional
/// dot-separated key path. No array indexing.
static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_-]*)((?:\.[A-Za-z0-9_-]+)*)\s*\}\}")
        .expect("template token pattern is valid")
});

/// Resolves every template token in a config tree against upstream
/// outputs. Pure: the result depends only on `config` and `outputs`.
///
/// A scalar value whose token spans the entire string leaf replaces the
/// leaf with the raw JSON value, preserving its type; any other match is
/// stringified in place.
pub fn resolve_config(
    config: &Value,
    outputs: &HashMap<String, Value>,
) -> Result<Value, TemplateError> {
    resolve_value(config, outputs)
}

fn resolve_value(value: &Value, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
    match value {
        Value::String(text) => resolve_string(text, outputs),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_value(item, outputs)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, outputs)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(text: &str, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
    let Some(first) = TOKEN.find(text) else {
        return Ok(Value::String(text.to_string()));
    };

    if first.start() == 0 && first.end() == text.len() {
        let looked_up = lookup(text, outputs)?;
        if !looked_up.is_object() && !looked_up.is_array() {
            return Ok(looked_up.clone());
        }
        return Ok(Value::String(stringify(looked_up)));
    }

    Ok(Value::String(resolve_text(text, outputs)?))
}

/// Substitutes every token in `text`, stringifying looked-up values.
pub fn resolve_text(text: &str, outputs: &HashMap<String, Value>) -> Result<String, TemplateError> {
    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for token in TOKEN.find_iter(text) {
        result.push_str(&text[last..token.start()]);
        result.push_str(&stringify(lookup(token.as_str(), outputs)?));
        last = token.end();
    }
    result.push_str(&text[last..]);
    Ok(result)
}

fn lookup<'a>(
    token: &str,
    outputs: &'a HashMap<String, Value>,
) -> Result<&'a Value, TemplateError> {
    let captures = TOKEN
        .captures(token)
        .expect("lookup is only called with a matched token");
    let node_id = &captures[1];
    let path = &captures[2];

    let mut current = outputs
        .get(node_id)
        .ok_or_else(|| TemplateError::Unresolved(token.trim().to_string()))?;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = current
            .get(segment)
            .ok_or_else(|| TemplateError::Unresolved(token.trim().to_string()))?;
    }
    Ok(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite => serde_json::to_string(composite).unwrap_or_default(),
    }
}

/// Evaluates a node condition against upstream outputs. Supports `==`
/// and `!=` comparisons after substitution, boolean literals, and falls
/// back to non-emptiness.
pub fn evaluate_condition(
    condition: &str,
    outputs: &HashMap<String, Value>,
) -> Result<bool, TemplateError> {
    let resolved = resolve_text(condition, outputs)?;
    let resolved = resolved.trim();

    if let Some((left, right)) = resolved.split_once("==") {
        return Ok(strip_quotes(left) == strip_quotes(right));
    }
    if let Some((left, right)) = resolved.split_once("!=") {
        return Ok(strip_quotes(left) != strip_quotes(right));
    }

    match resolved.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "null" => Ok(false),
        other => Ok(!other.is_empty()),
    }
}

fn strip_quotes(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '\'' || c == '"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        HashMap::from([
            ("fetch".to_string(), json!({"v": 10, "url": "https://a.test"})),
            (
                "score".to_string(),
                json!({"result": {"grade": 0.5, "label": "ok"}, "passed": true}),
            ),
        ])
    }

    #[test]
    fn whole_token_scalar_preserves_type() {
        let config = json!({"count": "{{fetch.v}}", "passed": "{{score.passed}}"});
        let resolved = resolve_config(&config, &outputs()).expect("resolve");
        assert_eq!(resolved, json!({"count": 10, "passed": true}));
    }

    #[test]
    fn nested_path_traversal() {
        let config = json!({"grade": "{{score.result.grade}}"});
        let resolved = resolve_config(&config, &outputs()).expect("resolve");
        assert_eq!(resolved, json!({"grade": 0.5}));
    }

    #[test]
    fn embedded_token_stringifies() {
        let config = json!({"line": "value is {{fetch.v}} from {{fetch.url}}"});
        let resolved = resolve_config(&config, &outputs()).expect("resolve");
        assert_eq!(
            resolved,
            json!({"line": "value is 10 from https://a.test"})
        );
    }

    #[test]
    fn whole_token_composite_is_stringified() {
        let config = json!({"blob": "{{score.result}}"});
        let resolved = resolve_config(&config, &outputs()).expect("resolve");
        let blob = resolved["blob"].as_str().expect("stringified composite");
        let parsed: Value = serde_json::from_str(blob).expect("valid json text");
        assert_eq!(parsed, json!({"grade": 0.5, "label": "ok"}));
    }

    #[test]
    fn missing_node_fails_with_token() {
        let config = json!({"x": "{{ghost.v}}"});
        let err = resolve_config(&config, &outputs()).expect_err("unresolved");
        assert_eq!(err, TemplateError::Unresolved("{{ghost.v}}".to_string()));
    }

    #[test]
    fn missing_path_segment_fails() {
        let config = json!({"x": "{{fetch.v.deeper}}"});
        let err = resolve_config(&config, &outputs()).expect_err("unresolved");
        assert_eq!(
            err,
            TemplateError::Unresolved("{{fetch.v.deeper}}".to_string())
        );
    }

    #[test]
    fn arrays_and_nested_objects_are_walked() {
        let config = json!({
            "items": ["{{fetch.v}}", {"deep": "{{score.result.label}}"}],
            "untouched": 42,
        });
        let resolved = resolve_config(&config, &outputs()).expect("resolve");
        assert_eq!(
            resolved,
            json!({"items": [10, {"deep": "ok"}], "untouched": 42})
        );
    }

    #[test]
    fn resolution_is_pure() {
        let config = json!({"count": "{{fetch.v}}"});
        let out = outputs();
        let first = resolve_config(&config, &out).expect("resolve");
        let second = resolve_config(&config, &out).expect("resolve");
        assert_eq!(first, second);
        assert_eq!(config, json!({"count": "{{fetch.v}}"}));
    }

    #[test]
    fn token_with_spaces_resolves() {
        let config = json!({"count": "{{ fetch.v }}"});
        let resolved = resolve_config(&config, &outputs()).expect("resolve");
        assert_eq!(resolved, json!({"count": 10}));
    }

    #[test]
    fn conditions_compare_and_coerce() {
        let out = outputs();
        assert!(evaluate_condition("{{score.passed}}", &out).expect("condition"));
        assert!(evaluate_condition("{{fetch.v}} == 10", &out).expect("condition"));
        assert!(evaluate_condition("{{fetch.v}} != 11", &out).expect("condition"));
        assert!(
            !evaluate_condition("'{{score.result.label}}' == 'bad'", &out).expect("condition")
        );
        assert!(!evaluate_condition("false", &out).expect("condition"));
        assert!(!evaluate_condition("", &out).expect("condition"));
    }

    #[test]
    fn condition_on_missing_output_is_unresolved() {
        let err = evaluate_condition("{{ghost.flag}}", &outputs()).expect_err("unresolved");
        assert!(matches!(err, TemplateError::Unresolved(_)));
    }
}
