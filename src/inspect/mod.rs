//! Variable inspection pipeline
//!
//! Converts decoded variable trees into plain JSON values, then either
//! evaluates a surgical path filter against them or produces a bounded
//! structural summary. The default shape never pastes large payloads
//! back to the agent; the filter is the only way to retrieve values.

use serde_json::{json, Map, Value};

use crate::dbgp::VariableInfo;

/// Children listed in a structural summary preview
const PREVIEW_CHILDREN: usize = 3;
/// Maximum rendered value length inside a preview
const PREVIEW_VALUE_LEN: usize = 50;
/// Navigable paths enumerated in filter diagnostics
const AVAILABLE_KEYS_CAP: usize = 20;

/// Result of running a filter expression
pub enum FilterOutcome {
    /// The filtered slice
    Value(Value),
    /// Informational diagnostic; the session is unaffected
    Diagnostic(Value),
}

/// Convert a variable tree into a plain structured value
///
/// Array-typed values with purely numeric keys become JSON arrays,
/// everything compound else becomes an object, leaves their scalar.
pub fn to_plain_value(var: &VariableInfo) -> Value {
    match &var.children {
        None => var.value.clone().unwrap_or(Value::Null),
        Some(children) => {
            let numeric_keys = !children.is_empty()
                && children.iter().all(|c| c.name.parse::<usize>().is_ok());
            if var.var_type == "array" && numeric_keys {
                let mut indexed: Vec<(usize, Value)> = children
                    .iter()
                    .map(|c| (c.name.parse().unwrap_or(usize::MAX), to_plain_value(c)))
                    .collect();
                indexed.sort_by_key(|(i, _)| *i);
                Value::Array(indexed.into_iter().map(|(_, v)| v).collect())
            } else {
                let mut map = Map::new();
                for child in children {
                    map.insert(child.name.clone(), to_plain_value(child));
                }
                Value::Object(map)
            }
        }
    }
}

/// Bounded structural summary of a compound variable
///
/// Scalars bypass the summary; callers return their literal value.
pub fn structural_summary(var: &VariableInfo) -> Value {
    let children = var.children.as_deref().unwrap_or(&[]);
    let keys: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
    let children_count = var.numchildren.map(|n| n as usize).unwrap_or(children.len());

    let mut preview = Map::new();
    for child in children.iter().take(PREVIEW_CHILDREN) {
        preview.insert(child.name.clone(), Value::String(preview_entry(child)));
    }

    let mut summary = Map::new();
    summary.insert("type".to_string(), json!(var.var_type));
    if let Some(classname) = &var.classname {
        summary.insert("classname".to_string(), json!(classname));
    }
    summary.insert("keys".to_string(), json!(keys));
    summary.insert("children_count".to_string(), json!(children_count));
    summary.insert("preview".to_string(), Value::Object(preview));
    Value::Object(summary)
}

fn preview_entry(child: &VariableInfo) -> String {
    if child.is_compound() {
        let count = child
            .numchildren
            .map(|n| n as usize)
            .unwrap_or_else(|| child.children.as_deref().map_or(0, |c| c.len()));
        format!("({}) [{count} children]", child.var_type)
    } else {
        let rendered = match &child.value {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        };
        format!("({}) {}", child.var_type, truncate_chars(&rendered, PREVIEW_VALUE_LEN))
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

/// Evaluate a path filter against a variable
///
/// Any evaluator error downgrades to a diagnostic payload enumerating
/// navigable paths from the root.
pub fn apply_filter(var: &VariableInfo, filter: &str) -> FilterOutcome {
    let root = to_plain_value(var);
    match evaluate(&root, filter) {
        Ok(value) => FilterOutcome::Value(value),
        Err(message) => FilterOutcome::Diagnostic(json!({
            "error": message,
            "variable": var.name,
            "type": var.var_type,
            "available_keys": available_keys(&root, AVAILABLE_KEYS_CAP),
            "hint": "Use paths like $.key, $.items[0], $.items[*].name or $..id",
        })),
    }
}

/// Enumerate the first navigable paths from a root value
pub fn available_keys(root: &Value, cap: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut queue: std::collections::VecDeque<(String, &Value)> =
        std::collections::VecDeque::from([(String::new(), root)]);

    while let Some((prefix, value)) = queue.pop_front() {
        if out.len() >= cap {
            break;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    out.push(path.clone());
                    if out.len() >= cap {
                        break;
                    }
                    queue.push_back((path, child));
                }
            }
            Value::Array(items) => {
                for (idx, child) in items.iter().enumerate() {
                    let path = format!("{prefix}[{idx}]");
                    out.push(path.clone());
                    if out.len() >= cap {
                        break;
                    }
                    queue.push_back((path, child));
                }
            }
            _ => {}
        }
    }

    out.truncate(cap);
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
    Recursive(String),
}

fn parse_segments(filter: &str) -> Result<Vec<Segment>, String> {
    let expr = filter.trim();
    let expr = expr.strip_prefix('$').unwrap_or(expr);
    let chars: Vec<char> = expr.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if chars.get(i + 1) == Some(&'.') {
                    let (ident, next) = read_ident(&chars, i + 2);
                    if ident.is_empty() {
                        return Err("recursive descent '..' requires a key".to_string());
                    }
                    segments.push(Segment::Recursive(ident));
                    i = next;
                } else {
                    let (ident, next) = read_ident(&chars, i + 1);
                    if ident.is_empty() {
                        return Err(format!("expected a key after '.' at offset {i}"));
                    }
                    segments.push(Segment::Key(ident));
                    i = next;
                }
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| "unterminated '['".to_string())?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else if (inner.starts_with('\'') && inner.ends_with('\'') && inner.len() >= 2)
                    || (inner.starts_with('"') && inner.ends_with('"') && inner.len() >= 2)
                {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| format!("invalid index '[{inner}]'"))?;
                    segments.push(Segment::Index(index));
                }
                i = close + 1;
            }
            c if c.is_whitespace() => i += 1,
            c => return Err(format!("unexpected character '{c}' in filter")),
        }
    }

    if segments.is_empty() {
        return Err("empty filter expression".to_string());
    }
    Ok(segments)
}

fn read_ident(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    let mut ident = String::new();
    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
        ident.push(chars[i]);
        i += 1;
    }
    (ident.trim().to_string(), i)
}

fn evaluate(root: &Value, filter: &str) -> Result<Value, String> {
    let segments = parse_segments(filter)?;
    let mut current: Vec<Value> = vec![root.clone()];
    let mut spanned = false;

    for segment in &segments {
        current = match segment {
            Segment::Key(key) => {
                let mut next = Vec::new();
                for value in &current {
                    match value.get(key) {
                        Some(v) => next.push(v.clone()),
                        None if spanned => {}
                        None => {
                            return Err(match value {
                                Value::Object(_) => format!("key '{key}' not found"),
                                other => format!(
                                    "cannot access key '{key}' on a {} value",
                                    type_name(other)
                                ),
                            })
                        }
                    }
                }
                if next.is_empty() {
                    return Err(format!("key '{key}' not found in any element"));
                }
                next
            }
            Segment::Index(index) => {
                let mut next = Vec::new();
                for value in &current {
                    match value {
                        Value::Array(items) => match items.get(*index) {
                            Some(v) => next.push(v.clone()),
                            None if spanned => {}
                            None => {
                                return Err(format!(
                                    "index {index} out of bounds (length {})",
                                    items.len()
                                ))
                            }
                        },
                        other if !spanned => {
                            return Err(format!("cannot index a {} value", type_name(other)))
                        }
                        _ => {}
                    }
                }
                if next.is_empty() {
                    return Err(format!("index {index} matched nothing"));
                }
                next
            }
            Segment::Wildcard => {
                spanned = true;
                let mut next = Vec::new();
                for value in &current {
                    match value {
                        Value::Array(items) => next.extend(items.iter().cloned()),
                        Value::Object(map) => next.extend(map.values().cloned()),
                        other => {
                            return Err(format!("cannot expand '*' on a {} value", type_name(other)))
                        }
                    }
                }
                next
            }
            Segment::Recursive(key) => {
                spanned = true;
                let mut next = Vec::new();
                for value in &current {
                    collect_recursive(value, key, &mut next);
                }
                if next.is_empty() {
                    return Err(format!("no value with key '{key}' found at any depth"));
                }
                next
            }
        };
    }

    Ok(if spanned {
        Value::Array(current)
    } else {
        current.into_iter().next().unwrap_or(Value::Null)
    })
}

fn collect_recursive(value: &Value, key: &str, out: &mut Vec<Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == key {
                    out.push(v.clone());
                }
                collect_recursive(v, key, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_recursive(item, key, out);
            }
        }
        _ => {}
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
