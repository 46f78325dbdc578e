//! Structured attribute values that may be partially unknown.
//!
//! During planning, attributes that depend on not-yet-created objects are
//! [`Value::Unknown`]. Unknowns nest: a map may be known while one of its
//! entries is not. [`Value::contains_unknown`] decides whether a value is
//! complete.
//!
//! In JSON, an unknown is written as `{"$unknown": true}`.

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    str::FromStr,
};

const UNKNOWN_MARKER: &str = "$unknown";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Not known until apply.
    Unknown,
}

impl Value {
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Value::Unknown)
    }

    /// Whether this value or anything nested inside it is unknown.
    pub fn contains_unknown(&self) -> bool {
        match self {
            Value::Unknown => true,
            Value::List(items) => items.iter().any(Value::contains_unknown),
            Value::Map(entries) => entries.values().any(Value::contains_unknown),
            _ => false,
        }
    }

    pub fn is_wholly_known(&self) -> bool {
        !self.contains_unknown()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up one step. Unknown stays unknown, anything missing is null.
    pub fn get(&self, step: &PathStep) -> Value {
        match (self, step) {
            (Value::Unknown, _) => Value::Unknown,
            (Value::Map(m), PathStep::Attr(name)) => m.get(name).cloned().unwrap_or_default(),
            (Value::List(items), PathStep::Index(i)) => items.get(*i).cloned().unwrap_or_default(),
            _ => Value::Null,
        }
    }

    pub fn get_path(&self, path: &AttrPath) -> Value {
        let mut current = self.clone();
        for step in &path.0 {
            current = current.get(step);
        }
        current
    }

    /// Paths at which `self` and `other` differ, as deep as both sides are
    /// structurally comparable. An unknown on either side counts as a
    /// difference.
    pub fn changed_paths(&self, other: &Value) -> Vec<AttrPath> {
        let mut out = Vec::new();
        changed_paths_into(&mut Vec::new(), self, other, &mut out);
        out
    }

    /// Render as plain JSON, encoding unknowns with the marker object.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Unknown => serde_json::json!({ "$unknown": true }),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(m) => {
                if m.len() == 1 && m.get(UNKNOWN_MARKER) == Some(&serde_json::Value::Bool(true)) {
                    Value::Unknown
                } else {
                    Value::Map(m.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
                }
            }
        }
    }
}

fn changed_paths_into(
    prefix: &mut Vec<PathStep>,
    a: &Value,
    b: &Value,
    out: &mut Vec<AttrPath>,
) {
    match (a, b) {
        (Value::Unknown, _) | (_, Value::Unknown) => out.push(AttrPath(prefix.clone())),
        (Value::Map(ma), Value::Map(mb)) => {
            let keys: std::collections::BTreeSet<&String> = ma.keys().chain(mb.keys()).collect();
            for k in keys {
                prefix.push(PathStep::Attr(k.clone()));
                let va = ma.get(k).cloned().unwrap_or_default();
                let vb = mb.get(k).cloned().unwrap_or_default();
                changed_paths_into(prefix, &va, &vb, out);
                prefix.pop();
            }
        }
        (Value::List(la), Value::List(lb)) if la.len() == lb.len() => {
            for (i, (va, vb)) in la.iter().zip(lb.iter()).enumerate() {
                prefix.push(PathStep::Index(i));
                changed_paths_into(prefix, va, vb, out);
                prefix.pop();
            }
        }
        (a, b) if a == b => {}
        _ => out.push(AttrPath(prefix.clone())),
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}
impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        value.to_json()
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unknown => write!(f, "(known after apply)"),
            v => write!(f, "{}", v.to_json()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathStep {
    Attr(String),
    Index(usize),
}

/// A path into a structured value, written `a.b[0].c`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttrPath(pub Vec<PathStep>);
impl AttrPath {
    pub fn attr(name: &str) -> Self {
        AttrPath(vec![PathStep::Attr(name.to_string())])
    }
    /// Whether `self` equals `other` or is an ancestor of it.
    pub fn is_prefix_of(&self, other: &AttrPath) -> bool {
        other.0.starts_with(&self.0)
    }
}
impl Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            match step {
                PathStep::Attr(name) if i == 0 => write!(f, "{}", name)?,
                PathStep::Attr(name) => write!(f, ".{}", name)?,
                PathStep::Index(n) => write!(f, "[{}]", n)?,
            }
        }
        Ok(())
    }
}
impl FromStr for AttrPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for part in s.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(i) => (&part[..i], &part[i..]),
                None => (part, ""),
            };
            if name.is_empty() {
                bail!("empty attribute name in path {:?}", s);
            }
            steps.push(PathStep::Attr(name.to_string()));
            while let Some(stripped) = rest.strip_prefix('[') {
                let end = stripped
                    .find(']')
                    .with_context(|| format!("missing ']' in path {:?}", s))?;
                let index = stripped[..end]
                    .parse()
                    .with_context(|| format!("invalid index in path {:?}", s))?;
                steps.push(PathStep::Index(index));
                rest = &stripped[end + 1..];
            }
            if !rest.is_empty() {
                bail!("unexpected {:?} in path {:?}", rest, s);
            }
        }
        Ok(AttrPath(steps))
    }
}
impl Serialize for AttrPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
impl<'de> Deserialize<'de> for AttrPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|e: anyhow::Error| serde::de::Error::custom(format!("{:#}", e)))
    }
}
