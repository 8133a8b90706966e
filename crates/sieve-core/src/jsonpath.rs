//! A small JSONPath subset over `serde_json::Value`.
//!
//! Supported segments: `$`, `.key`, `['key']`, `[n]` (negative counts from
//! the end), `[*]`, `.*` and recursive descent `..key`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Child(String),
    Index(i64),
    Wildcard,
    Descendant(String),
}

/// A parsed JSONPath expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        let mut rest = expr.strip_prefix('$').unwrap_or(expr);
        let mut segments = Vec::new();

        // A bare leading key (`data.items`) is treated as `$.data.items`.
        if !rest.is_empty() && !rest.starts_with('.') && !rest.starts_with('[') {
            let (name, tail) = take_name(rest);
            if name.is_empty() {
                return Err(format!("unexpected '{rest}'"));
            }
            segments.push(Segment::Child(name.to_string()));
            rest = tail;
        }

        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("..") {
                let (name, tail) = take_name(tail);
                if name.is_empty() {
                    return Err("'..' must be followed by a key".into());
                }
                segments.push(Segment::Descendant(name.to_string()));
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix(".*") {
                segments.push(Segment::Wildcard);
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix('.') {
                let (name, tail) = take_name(tail);
                if name.is_empty() {
                    return Err("'.' must be followed by a key".into());
                }
                segments.push(Segment::Child(name.to_string()));
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix('[') {
                let close = tail
                    .find(']')
                    .ok_or_else(|| "unterminated '['".to_string())?;
                segments.push(parse_bracket(tail[..close].trim())?);
                rest = &tail[close + 1..];
            } else {
                return Err(format!("unexpected '{rest}'"));
            }
        }

        Ok(Self { segments })
    }

    /// Evaluate against `root`, returning matches in document order.
    pub fn evaluate(&self, root: &Value) -> Vec<Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in current {
                match segment {
                    Segment::Child(name) => {
                        if let Some(v) = value.get(name.as_str()) {
                            next.push(v);
                        }
                    }
                    Segment::Index(idx) => {
                        if let Some(items) = value.as_array() {
                            let len = items.len() as i64;
                            let resolved = if *idx < 0 { len + idx } else { *idx };
                            if (0..len).contains(&resolved) {
                                next.push(&items[resolved as usize]);
                            }
                        }
                    }
                    Segment::Wildcard => match value {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                    Segment::Descendant(name) => collect_descendants(value, name, &mut next),
                }
            }
            current = next;
        }
        current.into_iter().cloned().collect()
    }
}

fn take_name(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| c == '.' || c == '[')
        .unwrap_or(s.len());
    (&s[..end], &s[end..])
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Ok(idx) = inner.parse::<i64>() {
        return Ok(Segment::Index(idx));
    }
    for quote in ['\'', '"'] {
        if inner.len() >= 2 && inner.starts_with(quote) && inner.ends_with(quote) {
            return Ok(Segment::Child(inner[1..inner.len() - 1].to_string()));
        }
    }
    Err(format!("unsupported bracket expression '[{inner}]'"))
}

fn collect_descendants<'a>(value: &'a Value, name: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(name) {
                out.push(v);
            }
            for child in map.values() {
                collect_descendants(child, name, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_descendants(child, name, out);
            }
        }
        _ => {}
    }
}
