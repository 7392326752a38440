//! Per-service response transform chain.
//!
//! A middleware is a named, synchronous transform over a tool result. The
//! front server looks up the pipeline by the tool's origin service and folds
//! the result through it in declared order. A failing transform is logged
//! and the result it was given is returned untouched; content is never
//! dropped on the floor.

use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::config::MiddlewareSpec;
use crate::mcp::{CallToolResult, ContentBlock};

type ResponseFn = fn(&str, CallToolResult) -> anyhow::Result<CallToolResult>;

pub struct Middleware {
    pub name: &'static str,
    pub response: Option<ResponseFn>,
}

pub type Pipeline = Vec<&'static Middleware>;

const BUILT_INS: &[Middleware] = &[
    Middleware {
        name: "strip-json-keys",
        response: Some(strip_json_keys),
    },
    Middleware {
        name: "strip-result-wrapper",
        response: Some(strip_result_wrapper),
    },
    Middleware {
        name: "extract-json-results",
        response: Some(extract_json_results),
    },
    Middleware {
        name: "json5",
        response: Some(json5_reserialize),
    },
    Middleware {
        name: "toon",
        response: Some(toon_reserialize),
    },
];

pub fn lookup(name: &str) -> Option<&'static Middleware> {
    BUILT_INS.iter().find(|mw| mw.name == name)
}

pub fn is_known(name: &str) -> bool {
    lookup(name).is_some()
}

pub fn pipeline_from_specs(specs: &[MiddlewareSpec]) -> anyhow::Result<Pipeline> {
    specs
        .iter()
        .map(|spec| {
            lookup(&spec.name)
                .with_context(|| format!("unknown middleware: {}", spec.name))
        })
        .collect()
}

/// Folds `result` through each middleware's `response`, in order. On a
/// transform error the chain stops and the last good value is returned.
pub fn apply_response_chain(
    pipeline: &[&'static Middleware],
    tool_name: &str,
    mut result: CallToolResult,
) -> CallToolResult {
    for mw in pipeline {
        let Some(response) = mw.response else {
            continue;
        };
        match response(tool_name, result.clone()) {
            Ok(transformed) => result = transformed,
            Err(err) => {
                warn!(
                    middleware = mw.name,
                    tool = tool_name,
                    error = format!("{err:#}"),
                    "response middleware failed; returning untransformed result"
                );
                return result;
            }
        }
    }
    result
}

/// Maps text blocks through `f` (None = leave unchanged); non-text blocks
/// pass through untouched.
fn map_text_blocks(mut result: CallToolResult, f: impl Fn(&str) -> Option<String>) -> CallToolResult {
    for block in &mut result.content {
        if let ContentBlock::Text(text_block) = block {
            if let Some(replacement) = f(&text_block.text) {
                text_block.text = replacement;
            }
        }
    }
    result
}

/// Parses `text` as JSON and applies `f` to the value. Returns None (leave
/// the original text alone) when the text is not JSON or `f` declines.
fn transform_parsed_json(text: &str, f: impl Fn(&Value) -> Option<String>) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    f(&value)
}

/// Renders a wrapper's inner value: strings verbatim, everything else
/// JSON-encoded.
fn unwrap_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn json_keys_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""(\w+)":"#).expect("static regex"))
}

/// `"word":` → `word:`, on raw text. Deliberately regex-based so it also
/// applies to JSON embedded in prose.
fn strip_json_keys(_tool: &str, result: CallToolResult) -> anyhow::Result<CallToolResult> {
    Ok(map_text_blocks(result, |text| {
        Some(json_keys_regex().replace_all(text, "$1:").into_owned())
    }))
}

/// Unwraps `{"result": ...}` when `result` is the object's only key.
fn strip_result_wrapper(_tool: &str, result: CallToolResult) -> anyhow::Result<CallToolResult> {
    Ok(map_text_blocks(result, |text| {
        transform_parsed_json(text, |value| {
            let obj = value.as_object()?;
            if obj.len() != 1 {
                return None;
            }
            obj.get("result").map(unwrap_to_text)
        })
    }))
}

/// Replaces the text with the value under a `results` key, if present.
fn extract_json_results(_tool: &str, result: CallToolResult) -> anyhow::Result<CallToolResult> {
    Ok(map_text_blocks(result, |text| {
        transform_parsed_json(text, |value| {
            value.as_object()?.get("results").map(unwrap_to_text)
        })
    }))
}

/// Re-serializes JSON text in JSON5-ish form: identifier keys lose their
/// quotes.
fn json5_reserialize(_tool: &str, result: CallToolResult) -> anyhow::Result<CallToolResult> {
    Ok(map_text_blocks(result, |text| {
        transform_parsed_json(text, |value| Some(json5_string(value)))
    }))
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_' || first == '$')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '$')
}

fn json5_string(value: &Value) -> String {
    match value {
        Value::Object(obj) => {
            let fields: Vec<String> = obj
                .iter()
                .map(|(key, val)| {
                    let rendered_key = if is_identifier(key) {
                        key.clone()
                    } else {
                        Value::String(key.clone()).to_string()
                    };
                    format!("{rendered_key}:{}", json5_string(val))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(json5_string).collect();
            format!("[{}]", rendered.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// Re-serializes a non-null JSON object/array in a compact indented form;
/// arrays of uniform flat objects become a header row plus CSV-style rows.
fn toon_reserialize(_tool: &str, result: CallToolResult) -> anyhow::Result<CallToolResult> {
    Ok(map_text_blocks(result, |text| {
        transform_parsed_json(text, |value| {
            if value.is_object() || value.is_array() {
                Some(toon_string(value))
            } else {
                None
            }
        })
    }))
}

fn toon_string(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Array(items) => toon_array(&mut out, None, items, 0),
        Value::Object(_) => toon_value(&mut out, value, 0),
        other => out.push_str(&toon_scalar(other)),
    }
    while out.ends_with('\n') {
        out.pop();
    }
    out
}

fn toon_value(out: &mut String, value: &Value, indent: usize) {
    match value {
        Value::Object(obj) => {
            for (key, val) in obj {
                match val {
                    Value::Array(items) => toon_array(out, Some(key), items, indent),
                    Value::Object(_) => {
                        push_indent(out, indent);
                        out.push_str(key);
                        out.push_str(":\n");
                        toon_value(out, val, indent + 1);
                    }
                    scalar => {
                        push_indent(out, indent);
                        out.push_str(key);
                        out.push_str(": ");
                        out.push_str(&toon_scalar(scalar));
                        out.push('\n');
                    }
                }
            }
        }
        other => {
            push_indent(out, indent);
            out.push_str(&toon_scalar(other));
            out.push('\n');
        }
    }
}

fn toon_array(out: &mut String, key: Option<&str>, items: &[Value], indent: usize) {
    let label = key.unwrap_or_default();

    // Uniform flat objects render as a tabular block.
    if let Some(fields) = uniform_fields(items) {
        push_indent(out, indent);
        out.push_str(&format!(
            "{label}[{}]{{{}}}:\n",
            items.len(),
            fields.join(",")
        ));
        for item in items {
            push_indent(out, indent + 1);
            let row: Vec<String> = fields
                .iter()
                .map(|field| toon_scalar(item.get(field.as_str()).unwrap_or(&Value::Null)))
                .collect();
            out.push_str(&row.join(","));
            out.push('\n');
        }
        return;
    }

    // Scalar arrays inline.
    if items.iter().all(|item| !item.is_object() && !item.is_array()) {
        push_indent(out, indent);
        let row: Vec<String> = items.iter().map(toon_scalar).collect();
        out.push_str(&format!("{label}[{}]: {}\n", items.len(), row.join(",")));
        return;
    }

    push_indent(out, indent);
    out.push_str(&format!("{label}[{}]:\n", items.len()));
    for item in items {
        match item {
            Value::Array(nested) => toon_array(out, None, nested, indent + 1),
            other => toon_value(out, other, indent + 1),
        }
    }
}

/// Field list shared by every element, when all elements are objects with
/// identical scalar-only keys.
fn uniform_fields(items: &[Value]) -> Option<Vec<String>> {
    let first = items.first()?.as_object()?;
    if first.is_empty() || first.values().any(|v| v.is_object() || v.is_array()) {
        return None;
    }
    let fields: Vec<String> = first.keys().cloned().collect();
    for item in items.iter().skip(1) {
        let obj = item.as_object()?;
        if obj.len() != fields.len()
            || fields.iter().any(|f| {
                obj.get(f.as_str())
                    .map(|v| v.is_object() || v.is_array())
                    .unwrap_or(true)
            })
        {
            return None;
        }
    }
    Some(fields)
}

fn toon_scalar(value: &Value) -> String {
    match value {
        Value::String(text)
            if !text.is_empty()
                && !text.contains([',', ':', '\n', '"'])
                && text.trim() == text =>
        {
            text.clone()
        }
        other => other.to_string(),
    }
}

fn push_indent(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push_str("  ");
    }
}
