//! Structural path queries over `serde_json::Value` trees.
//!
//! Rule locations are written in a small JSONPath subset:
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `$` | root |
//! | `.name` | object member |
//! | `['name']`, `["name"]` | object member (any characters) |
//! | `[3]` | array element |
//! | `[*]`, `.*` | every element / every member value |
//!
//! A query returns the ordered list of matched nodes. Compiled queries are
//! held in a [`PathCache`] keyed by expression text; entries are never
//! replaced once inserted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid path `{expr}` at byte {pos}: {reason}")]
pub struct PathError {
    pub expr: String,
    pub pos: usize,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A compiled path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    expr: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn compile(expr: &str) -> Result<Self, PathError> {
        let err = |pos: usize, reason: &'static str| PathError {
            expr: expr.to_string(),
            pos,
            reason,
        };

        let chars: Vec<(usize, char)> = expr.char_indices().collect();
        let mut i = 0;
        match chars.first() {
            Some((_, '$')) => i += 1,
            _ => return Err(err(0, "expected `$`")),
        }

        let mut segments = Vec::new();
        while i < chars.len() {
            let (pos, c) = chars[i];
            match c {
                '.' => {
                    i += 1;
                    if matches!(chars.get(i), Some((_, '.'))) {
                        return Err(err(pos, "recursive descent is not supported"));
                    }
                    if matches!(chars.get(i), Some((_, '*'))) {
                        segments.push(Segment::Wildcard);
                        i += 1;
                        continue;
                    }
                    let start = i;
                    while i < chars.len() && !matches!(chars[i].1, '.' | '[') {
                        i += 1;
                    }
                    if start == i {
                        return Err(err(pos, "empty member name"));
                    }
                    let name: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                    segments.push(Segment::Key(name));
                }
                '[' => {
                    i += 1;
                    match chars.get(i) {
                        Some((_, '*')) => {
                            i += 1;
                            segments.push(Segment::Wildcard);
                        }
                        Some((_, q @ ('\'' | '"'))) => {
                            let quote = *q;
                            i += 1;
                            let mut name = String::new();
                            loop {
                                match chars.get(i) {
                                    None => return Err(err(pos, "unterminated quoted name")),
                                    Some((_, '\\')) => {
                                        let Some((_, escaped)) = chars.get(i + 1) else {
                                            return Err(err(pos, "dangling escape"));
                                        };
                                        name.push(*escaped);
                                        i += 2;
                                    }
                                    Some((_, c)) if *c == quote => {
                                        i += 1;
                                        break;
                                    }
                                    Some((_, c)) => {
                                        name.push(*c);
                                        i += 1;
                                    }
                                }
                            }
                            segments.push(Segment::Key(name));
                        }
                        Some((_, d)) if d.is_ascii_digit() => {
                            let start = i;
                            while i < chars.len() && chars[i].1.is_ascii_digit() {
                                i += 1;
                            }
                            let digits: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                            let idx = digits
                                .parse::<usize>()
                                .map_err(|_| err(pos, "index out of range"))?;
                            segments.push(Segment::Index(idx));
                        }
                        _ => return Err(err(pos, "expected `*`, index or quoted name")),
                    }
                    match chars.get(i) {
                        Some((_, ']')) => i += 1,
                        _ => return Err(err(pos, "expected `]`")),
                    }
                }
                _ => return Err(err(pos, "unexpected character")),
            }
        }

        Ok(Self {
            expr: expr.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// All nodes matched by this path, in document order.
    pub fn find<'v>(&self, root: &'v Value) -> Vec<&'v Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for node in current {
                match (segment, node) {
                    (Segment::Key(k), Value::Object(map)) => next.extend(map.get(k)),
                    (Segment::Index(i), Value::Array(items)) => next.extend(items.get(*i)),
                    (Segment::Wildcard, Value::Array(items)) => next.extend(items.iter()),
                    (Segment::Wildcard, Value::Object(map)) => next.extend(map.values()),
                    _ => {}
                }
            }
            if next.is_empty() {
                return next;
            }
            current = next;
        }
        current
    }
}

/// Append-only cache of compiled paths, keyed by expression text.
///
/// Owned by a [`Normalizer`](crate::normalize::Normalizer) or shared
/// between several through an `Arc`.
#[derive(Debug, Default)]
pub struct PathCache {
    entries: RwLock<HashMap<String, Arc<JsonPath>>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, expr: &str) -> Result<Arc<JsonPath>, PathError> {
        if let Some(hit) = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(expr)
        {
            return Ok(Arc::clone(hit));
        }
        let compiled = Arc::new(JsonPath::compile(expr)?);
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(Arc::clone(
            entries.entry(expr.to_string()).or_insert(compiled),
        ))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
