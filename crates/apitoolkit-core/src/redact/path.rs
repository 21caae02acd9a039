//! Field path expressions for body redaction.
//!
//! Supports the JSONPath forms people actually write in redaction lists:
//!
//! - `password`, `$.user.password` - child fields
//! - `['content-type']`, `["a b"]` - quoted fields
//! - `*`, `.*`, `[*]` - every value of an object or array
//! - `items[0]`, `items[-1]` - array indices, negative from the end
//! - `items[0:2]`, `items[-2:]`, `items[::2]` - slices, `[start:end:step]`
//! - `$['a','b']`, `items[0,2]` - unions of quoted fields or indices
//! - `$..token` - recursive descent
//!
//! Expressions are compiled once when the client is built and then matched
//! against every body.

use crate::error::ConfigError;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// What a single step of a path selects.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    Field(String),
    Index(i64),
    Wildcard,
    Slice {
        start: Option<i64>,
        end: Option<i64>,
        step: i64,
    },
    /// Quoted fields and indices; never nested.
    Union(Vec<Selector>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Direct children of the current node.
    Child(Selector),
    /// The current node's descendants at any depth.
    Recursive(Selector),
}

/// A compiled field path expression.
///
/// # Example
///
/// ```
/// use apitoolkit_core::redact::FieldPath;
/// use serde_json::json;
///
/// let path: FieldPath = "$.user.password".parse().unwrap();
/// let mut doc = json!({"user": {"password": "hunter2", "name": "amy"}});
/// assert_eq!(path.replace(&mut doc, "[CLIENT_REDACTED]"), 1);
/// assert_eq!(doc["user"]["password"], "[CLIENT_REDACTED]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    source: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Compile a path expression.
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let segments = Parser::new(expr.trim())
            .parse()
            .map_err(|reason| ConfigError::InvalidPath {
                path: expr.to_string(),
                reason,
            })?;

        Ok(Self {
            source: expr.to_string(),
            segments,
        })
    }

    /// The expression as it was configured.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Overwrite every location matched by this path with `replacement`.
    ///
    /// Returns the number of values replaced. Matching nothing is not an error.
    pub fn replace(&self, document: &mut Value, replacement: &str) -> usize {
        let mut count = 0;
        apply(&self.segments, document, replacement, &mut count);
        count
    }
}

impl FromStr for FieldPath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn apply(segments: &[Segment], node: &mut Value, replacement: &str, count: &mut usize) {
    let Some((first, rest)) = segments.split_first() else {
        *node = Value::String(replacement.to_string());
        *count += 1;
        return;
    };

    match first {
        Segment::Child(selector) => {
            for child in select(selector, node) {
                apply(rest, child, replacement, count);
            }
        }
        Segment::Recursive(selector) => {
            for child in select(selector, node) {
                apply(rest, child, replacement, count);
            }
            match node {
                Value::Object(map) => {
                    for value in map.values_mut() {
                        apply(segments, value, replacement, count);
                    }
                }
                Value::Array(items) => {
                    for value in items.iter_mut() {
                        apply(segments, value, replacement, count);
                    }
                }
                _ => {}
            }
        }
    }
}

fn select<'v>(selector: &Selector, node: &'v mut Value) -> Vec<&'v mut Value> {
    match (selector, node) {
        (Selector::Field(name), Value::Object(map)) => map.get_mut(name).into_iter().collect(),
        (Selector::Wildcard, Value::Object(map)) => map.values_mut().collect(),
        (Selector::Wildcard, Value::Array(items)) => items.iter_mut().collect(),
        (Selector::Index(index), Value::Array(items)) => {
            let wanted = resolve_index(*index, items.len());
            items
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| Some(*i) == wanted)
                .map(|(_, v)| v)
                .collect()
        }
        (Selector::Slice { start, end, step }, Value::Array(items)) => {
            let wanted = slice_indices(*start, *end, *step, items.len());
            items
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| wanted.contains(i))
                .map(|(_, v)| v)
                .collect()
        }
        (Selector::Union(members), Value::Object(map)) => map
            .iter_mut()
            .filter(|(key, _)| {
                members
                    .iter()
                    .any(|m| matches!(m, Selector::Field(name) if name == *key))
            })
            .map(|(_, v)| v)
            .collect(),
        (Selector::Union(members), Value::Array(items)) => {
            let len = items.len();
            let wanted: Vec<usize> = members
                .iter()
                .filter_map(|m| match m {
                    Selector::Index(index) => resolve_index(*index, len),
                    _ => None,
                })
                .collect();
            items
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| wanted.contains(i))
                .map(|(_, v)| v)
                .collect()
        }
        _ => Vec::new(),
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

/// Indices selected by `[start:end:step]` on an array of `len` items,
/// with the usual clamping of out-of-range and negative bounds.
fn slice_indices(start: Option<i64>, end: Option<i64>, step: i64, len: usize) -> Vec<usize> {
    let len = len as i64;
    let bound = |value: i64, low: i64, high: i64| {
        let value = if value < 0 { value + len } else { value };
        value.clamp(low, high)
    };

    let mut indices = Vec::new();
    if step > 0 {
        let mut i = start.map_or(0, |s| bound(s, 0, len));
        let end = end.map_or(len, |e| bound(e, 0, len));
        while i < end {
            indices.push(i as usize);
            let Some(next) = i.checked_add(step) else { break };
            i = next;
        }
    } else {
        let mut i = start.map_or(len - 1, |s| bound(s, -1, len - 1));
        let end = end.map_or(-1, |e| bound(e, -1, len - 1));
        while i > end {
            indices.push(i as usize);
            let Some(next) = i.checked_add(step) else { break };
            i = next;
        }
    }
    indices
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            match self.peek() {
                Some(c) => Err(format!(
                    "expected `{expected}` at position {}, found `{c}`",
                    self.pos
                )),
                None => Err(format!("expected `{expected}`, found end of expression")),
            }
        }
    }

    fn parse(mut self) -> Result<Vec<Segment>, String> {
        if self.chars.is_empty() {
            return Err("empty expression".to_string());
        }

        let mut segments = Vec::new();

        // `$` is optional; a bare leading name is a child of the root.
        if !self.eat('$') && !matches!(self.peek(), Some('.') | Some('[')) {
            segments.push(Segment::Child(self.dotted()?));
        }

        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.pos += 1;
                    if self.eat('.') {
                        let selector = if self.peek() == Some('[') {
                            self.bracketed()?
                        } else {
                            self.dotted()?
                        };
                        segments.push(Segment::Recursive(selector));
                    } else {
                        segments.push(Segment::Child(self.dotted()?));
                    }
                }
                '[' => segments.push(Segment::Child(self.bracketed()?)),
                other => {
                    return Err(format!(
                        "unexpected `{other}` at position {}",
                        self.pos
                    ))
                }
            }
        }

        if segments.is_empty() {
            return Err("expression selects the whole document".to_string());
        }

        Ok(segments)
    }

    fn dotted(&mut self) -> Result<Selector, String> {
        if self.eat('*') {
            return Ok(Selector::Wildcard);
        }

        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '.' || c == '[' {
                break;
            }
            self.pos += 1;
        }

        if start == self.pos {
            return Err(format!("expected field name at position {start}"));
        }

        let name: String = self.chars[start..self.pos].iter().collect();
        Ok(Selector::Field(name.trim().to_string()))
    }

    fn bracketed(&mut self) -> Result<Selector, String> {
        self.expect('[')?;

        if self.eat('*') {
            self.expect(']')?;
            return Ok(Selector::Wildcard);
        }

        let mut members = vec![self.bracket_member()?];
        while self.eat(',') {
            members.push(self.bracket_member()?);
        }
        self.expect(']')?;

        if members.len() == 1 {
            return Ok(members.remove(0));
        }
        if members.iter().any(|m| matches!(m, Selector::Slice { .. })) {
            return Err("a slice cannot be part of a union".to_string());
        }
        Ok(Selector::Union(members))
    }

    /// One entry between brackets: a quoted name, an index or a slice.
    fn bracket_member(&mut self) -> Result<Selector, String> {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }

        let selector = if let Some(quote @ ('\'' | '"')) = self.peek() {
            self.pos += 1;
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == quote {
                    break;
                }
                self.pos += 1;
            }
            let name: String = self.chars[start..self.pos].iter().collect();
            self.expect(quote)?;
            Selector::Field(name)
        } else {
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == ']' || c == ',' {
                    break;
                }
                self.pos += 1;
            }
            let raw: String = self.chars[start..self.pos].iter().collect();
            if raw.contains(':') {
                parse_slice(&raw)?
            } else {
                Selector::Index(parse_int(&raw, "array index")?)
            }
        };

        while self.peek() == Some(' ') {
            self.pos += 1;
        }
        Ok(selector)
    }
}

fn parse_int(raw: &str, what: &str) -> Result<i64, String> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| format!("invalid {what} `{raw}`"))
}

fn parse_slice(raw: &str) -> Result<Selector, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() > 3 {
        return Err(format!("invalid slice `{raw}`"));
    }

    let bound = |part: Option<&&str>| -> Result<Option<i64>, String> {
        match part.map(|p| p.trim()) {
            None | Some("") => Ok(None),
            Some(p) => parse_int(p, "slice bound").map(Some),
        }
    };
    let start = bound(parts.first())?;
    let end = bound(parts.get(1))?;
    let step = bound(parts.get(2))?.unwrap_or(1);
    if step == 0 {
        return Err(format!("slice step cannot be zero in `{raw}`"));
    }

    Ok(Selector::Slice { start, end, step })
}
