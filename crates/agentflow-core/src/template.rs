//! Prompt template resolution.
//!
//! Placeholders look like `{{name}}`, `{{name.field}}`, `{{name[0]}}` and may
//! chain further (`{{a.b[0].c}}`). Substitution is single-pass: text produced
//! by a substitution is never scanned again. A placeholder whose path does not
//! resolve becomes the empty string and is reported in [`Resolved::missing`].

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::warn;

/// Template bindings: top-level name to value.
pub type Bindings = Map<String, Value>;

const PATH_PATTERN: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_-]*(?:\.[A-Za-z_][A-Za-z0-9_-]*|\[\d+\])*)\s*\}\}";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PATH_PATTERN).expect("placeholder pattern is a valid regex"))
}

/// Result of resolving one template.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub text: String,
    /// Placeholder paths that did not resolve, in order of appearance.
    pub missing: Vec<String>,
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Field(&'a str),
    Index(usize),
}

/// Split a validated path into segments. The first segment is always a field.
fn segments(path: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').unwrap_or(after.len());
            // Overflowing indices can never be in range; treat them as a miss.
            let index = after[..close].parse().unwrap_or(usize::MAX);
            out.push(Segment::Index(index));
            rest = after.get(close + 1..).unwrap_or("");
        } else {
            let rest_trimmed = rest.strip_prefix('.').unwrap_or(rest);
            let end = rest_trimmed
                .find(['.', '['])
                .unwrap_or(rest_trimmed.len());
            out.push(Segment::Field(&rest_trimmed[..end]));
            rest = &rest_trimmed[end..];
        }
    }
    out
}

/// Follow `path` through `bindings`.
pub fn lookup<'a>(bindings: &'a Bindings, path: &str) -> Option<&'a Value> {
    let mut segs = segments(path).into_iter();
    let mut current = match segs.next()? {
        Segment::Field(name) => bindings.get(name)?,
        Segment::Index(_) => return None,
    };
    for seg in segs {
        current = match (seg, current) {
            (Segment::Field(name), Value::Object(map)) => map.get(name)?,
            (Segment::Index(i), Value::Array(items)) => items.get(i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a bound value as prompt text.
///
/// Strings verbatim, scalars via display, lists joined by blank lines,
/// objects by their `output` field when present and compact JSON otherwise.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Object(map) => match map.get("output") {
            Some(inner) => render_value(inner),
            None => value.to_string(),
        },
    }
}

/// Substitute every placeholder in `template`.
pub fn resolve(template: &str, bindings: &Bindings) -> Resolved {
    let mut missing = Vec::new();
    let text = placeholder_re()
        .replace_all(template, |caps: &Captures<'_>| {
            let path = &caps[1];
            match lookup(bindings, path) {
                Some(value) => render_value(value),
                None => {
                    warn!(placeholder = %path, "template variable not found; substituting empty string");
                    missing.push(path.to_string());
                    String::new()
                }
            }
        })
        .into_owned();
    Resolved { text, missing }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(value: Value) -> Bindings {
        match value {
            Value::Object(map) => map,
            _ => panic!("bindings must be an object"),
        }
    }

    #[test]
    fn test_top_level_and_dotted_access() {
        let b = bindings(json!({"input": "X", "user": {"name": "ada"}}));
        let r = resolve("Task: {{input}} for {{ user.name }}", &b);
        assert_eq!(r.text, "Task: X for ada");
        assert!(r.missing.is_empty());
    }

    #[test]
    fn test_indexed_access_yields_element_text() {
        let b = bindings(json!({"a": {"b": ["first", "second"]}}));
        assert_eq!(resolve("{{a.b[0]}}", &b).text, "first");
        assert_eq!(resolve("{{a.b[1]}}", &b).text, "second");
    }

    #[test]
    fn test_out_of_range_index_is_empty_and_reported() {
        let b = bindings(json!({"a": {"b": ["only"]}}));
        let r = resolve("[{{a.b[5]}}]", &b);
        assert_eq!(r.text, "[]");
        assert_eq!(r.missing, vec!["a.b[5]".to_string()]);
    }

    #[test]
    fn test_missing_variable_is_empty_string() {
        let r = resolve("hello {{nobody}}!", &Bindings::new());
        assert_eq!(r.text, "hello !");
        assert_eq!(r.missing, vec!["nobody".to_string()]);
    }

    #[test]
    fn test_single_pass_does_not_reresolve() {
        let b = bindings(json!({"x": "{{y}}", "y": "nope"}));
        let r = resolve("{{x}}", &b);
        assert_eq!(r.text, "{{y}}");
    }

    #[test]
    fn test_chained_paths() {
        let b = bindings(json!({"a": {"b": [{"c": "deep"}]}}));
        assert_eq!(resolve("{{a.b[0].c}}", &b).text, "deep");
    }

    #[test]
    fn test_rendering_rules() {
        let b = bindings(json!({
            "n": 3,
            "flag": true,
            "list": ["one", "two"],
            "stage": {"output": "final", "outputs": ["a"]},
            "obj": {"k": 1}
        }));
        assert_eq!(resolve("{{n}} {{flag}}", &b).text, "3 true");
        assert_eq!(resolve("{{list}}", &b).text, "one\n\ntwo");
        assert_eq!(resolve("{{stage}}", &b).text, "final");
        assert_eq!(resolve("{{obj}}", &b).text, r#"{"k":1}"#);
    }

    #[test]
    fn test_malformed_placeholders_left_untouched() {
        let b = bindings(json!({"x": "v"}));
        let src = "{{ }} {{1abc}} {x} {{x";
        assert_eq!(resolve(src, &b).text, src);
    }

    #[test]
    fn test_hyphenated_stage_names() {
        let b = bindings(json!({"code-review": {"output": "ok"}}));
        assert_eq!(resolve("{{code-review}}", &b).text, "ok");
    }
}
