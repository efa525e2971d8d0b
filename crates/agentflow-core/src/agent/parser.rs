//! Extracting structured results from agent output.
//!
//! Two sources, consulted in order:
//! 1. the result file the agent (or its wrapper) wrote, plain id or JSON
//! 2. the stdout transcript, scanned for known phrasings
//!
//! Within the transcript the phrasings are tried in priority order; the first
//! one that matches anywhere wins, and its last occurrence is used.

use std::sync::OnceLock;

use agentflow_state::{DocumentId, TokenUsage};
use regex::Regex;
use serde_json::Value;

const ID: &str = r"([A-Za-z0-9][A-Za-z0-9_-]*)";

fn artifact_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            format!(r"(?i)ARTIFACT_ID:\s*#?{ID}"),
            format!(r"(?i)saved\s+(?:as|to)\s+(?:document|artifact)\s+#?{ID}"),
            format!(r"(?i)document\s+id:\s*#?{ID}"),
            format!(r"(?i)artifact\s+#{ID}"),
        ]
        .iter()
        .map(|p| Regex::new(p).expect("artifact pattern is a valid regex"))
        .collect()
    })
}

fn usage_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("usage pattern is a valid regex");
        [
            re(r"(?im)^\s*input[_ ]tokens\s*[:=]\s*(\d+)"),
            re(r"(?im)^\s*output[_ ]tokens\s*[:=]\s*(\d+)"),
            re(r"(?im)^\s*(?:total[_ ])?cost(?:[_ ]usd)?\s*[:=]\s*\$?([0-9]+(?:\.[0-9]+)?)"),
        ]
    })
}

/// What a result file said.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFile {
    pub artifact_id: Option<DocumentId>,
    pub usage: Option<TokenUsage>,
}

fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().trim_start_matches('#').to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_usage(obj: &Value) -> Option<TokenUsage> {
    let usage = obj.get("usage").unwrap_or(obj);
    let input = usage.get("input_tokens").and_then(Value::as_u64);
    let output = usage.get("output_tokens").and_then(Value::as_u64);
    let cost = obj
        .get("total_cost_usd")
        .or_else(|| obj.get("cost_usd"))
        .or_else(|| usage.get("cost_usd"))
        .and_then(Value::as_f64);
    if input.is_none() && output.is_none() && cost.is_none() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
        cost_usd: cost.unwrap_or(0.0),
    })
}

/// Parse the contents of a result file.
pub fn parse_result_file(contents: &str) -> ResultFile {
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return ResultFile::default();
    }
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return ResultFile {
                artifact_id: value
                    .get("artifact_id")
                    .or_else(|| value.get("id"))
                    .and_then(json_id)
                    .map(DocumentId),
                usage: json_usage(&value),
            };
        }
    }
    let first = trimmed.lines().next().unwrap_or("").trim();
    let candidate = first.trim_start_matches('#');
    let valid = !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    ResultFile {
        artifact_id: valid.then(|| DocumentId::new(candidate)),
        usage: None,
    }
}

/// Find the reported artifact identifier in a transcript.
pub fn parse_artifact_id(transcript: &str) -> Option<DocumentId> {
    artifact_patterns().iter().find_map(|re| {
        re.captures_iter(transcript)
            .last()
            .map(|c| DocumentId::new(&c[1]))
    })
}

/// Extract token and cost counters from a transcript.
///
/// Stream-JSON lines are preferred; the last line carrying usage wins, since
/// the final result event reports run totals. Plain `key: value` lines are
/// the fallback.
pub fn parse_usage(transcript: &str) -> TokenUsage {
    let mut from_json: Option<TokenUsage> = None;
    let mut cost: Option<f64> = None;
    for line in transcript.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(c) = value
            .get("total_cost_usd")
            .or_else(|| value.get("cost_usd"))
            .and_then(Value::as_f64)
        {
            cost = Some(c);
        }
        let usage = value
            .get("usage")
            .or_else(|| value.get("message").and_then(|m| m.get("usage")));
        if let Some(usage) = usage {
            let input = usage.get("input_tokens").and_then(Value::as_u64);
            let output = usage.get("output_tokens").and_then(Value::as_u64);
            if input.is_some() || output.is_some() {
                from_json = Some(TokenUsage {
                    input_tokens: input.unwrap_or(0),
                    output_tokens: output.unwrap_or(0),
                    cost_usd: 0.0,
                });
            }
        }
    }

    if from_json.is_some() || cost.is_some() {
        let mut usage = from_json.unwrap_or_default();
        usage.cost_usd = cost.unwrap_or(0.0);
        return usage;
    }

    let [input_re, output_re, cost_re] = usage_patterns();
    let last = |re: &Regex| re.captures_iter(transcript).last().map(|c| c[1].to_string());
    TokenUsage {
        input_tokens: last(input_re).and_then(|v| v.parse().ok()).unwrap_or(0),
        output_tokens: last(output_re).and_then(|v| v.parse().ok()).unwrap_or(0),
        cost_usd: last(cost_re).and_then(|v| v.parse().ok()).unwrap_or(0.0),
    }
}
