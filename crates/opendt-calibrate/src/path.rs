//! Parameter path grammar
//!
//! Dotted paths into the topology JSON with array wildcards:
//!
//! ```text
//! clusters[*].hosts[*].cpuPowerModel.asymUtil
//! clusters[0].hosts[*].cpu.coreSpeedMHz
//! ```
//!
//! A segment is a field name optionally followed by `[*]` (every element) or
//! `[n]` (one element). Resolution walks a `serde_json::Value`; patching is
//! always done on a deep copy so the observed topology stays immutable.

use serde_json::Value;

use crate::{CalibrateError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Index {
    /// Plain object field.
    None,
    /// `[*]`: all elements of the array under the field.
    Wildcard,
    /// `[n]`: one element of the array under the field.
    At(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    field: String,
    index: Index,
}

/// A parsed parameter path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamPath {
    segments: Vec<Segment>,
    raw: String,
}

impl ParamPath {
    /// Parse a dotted path. Empty paths and malformed brackets are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(CalibrateError::Path("empty parameter path".to_string()));
        }
        let mut segments = Vec::new();
        for part in raw.split('.') {
            let (field, index) = match part.find('[') {
                None => (part, Index::None),
                Some(open) => {
                    let (name, bracket) = part.split_at(open);
                    let inner = bracket
                        .strip_prefix('[')
                        .and_then(|s| s.strip_suffix(']'))
                        .ok_or_else(|| {
                            CalibrateError::Path(format!("malformed index in segment '{part}'"))
                        })?;
                    let index = if inner == "*" {
                        Index::Wildcard
                    } else {
                        Index::At(inner.parse::<usize>().map_err(|_| {
                            CalibrateError::Path(format!("bad array index '{inner}' in '{part}'"))
                        })?)
                    };
                    (name, index)
                }
            };
            if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(CalibrateError::Path(format!("bad field name in segment '{part}'")));
            }
            segments.push(Segment {
                field: field.to_string(),
                index,
            });
        }
        Ok(Self {
            segments,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Read every numeric leaf the path resolves to.
    pub fn resolve(&self, value: &Value) -> Vec<f64> {
        let mut out = Vec::new();
        collect(value, &self.segments, &mut out);
        out
    }

    /// Set every resolved leaf to `new_value`. Returns the number of leaves
    /// patched; zero means the path matched nothing.
    pub fn patch(&self, value: &mut Value, new_value: f64) -> Result<usize> {
        let count = apply(value, &self.segments, new_value)?;
        if count == 0 {
            return Err(CalibrateError::Path(format!(
                "path '{}' resolved no leaves",
                self.raw
            )));
        }
        Ok(count)
    }
}

fn collect(value: &Value, segments: &[Segment], out: &mut Vec<f64>) {
    let Some(segment) = segments.first() else {
        if let Some(n) = value.as_f64() {
            out.push(n);
        }
        return;
    };
    let Some(field) = value.get(&segment.field) else { return };
    match &segment.index {
        Index::None => collect(field, &segments[1..], out),
        Index::Wildcard => {
            if let Some(items) = field.as_array() {
                for item in items {
                    collect(item, &segments[1..], out);
                }
            }
        }
        Index::At(i) => {
            if let Some(item) = field.as_array().and_then(|a| a.get(*i)) {
                collect(item, &segments[1..], out);
            }
        }
    }
}

fn apply(value: &mut Value, segments: &[Segment], new_value: f64) -> Result<usize> {
    let Some(segment) = segments.first() else {
        return match value {
            Value::Number(_) => {
                *value = serde_json::Number::from_f64(new_value)
                    .map(Value::Number)
                    .ok_or_else(|| CalibrateError::Path(format!("non-finite value {new_value}")))?;
                Ok(1)
            }
            other => Err(CalibrateError::Path(format!(
                "path ends on non-numeric leaf ({})",
                kind(other)
            ))),
        };
    };
    let Some(field) = value.get_mut(&segment.field) else {
        return Ok(0);
    };
    match &segment.index {
        Index::None => apply(field, &segments[1..], new_value),
        Index::Wildcard => {
            let Some(items) = field.as_array_mut() else { return Ok(0) };
            let mut count = 0;
            for item in items {
                count += apply(item, &segments[1..], new_value)?;
            }
            Ok(count)
        }
        Index::At(i) => match field.as_array_mut().and_then(|a| a.get_mut(*i)) {
            Some(item) => apply(item, &segments[1..], new_value),
            None => Ok(0),
        },
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
