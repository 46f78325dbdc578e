//! Already-parsed configuration expressions and their evaluation.
//!
//! In JSON, a reference is written `{"$ref": "aws_instance.web.id"}` and a
//! string interpolation `{"$concat": ["http://", {"$ref": "..."}]}`. Every
//! other JSON value stands for itself.

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    error::Error,
    fmt::{self, Display},
    str::FromStr,
};
use terrane_core::{
    addr::{InstanceKey, ModulePath, ResourceAddr, ResourceMode},
    value::{AttrPath, Value},
};

const REF_KEY: &str = "$ref";
const CONCAT_KEY: &str = "$concat";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum Expr {
    Literal(Value),
    Ref(Reference),
    List(Vec<Expr>),
    Object(BTreeMap<String, Expr>),
    Concat(Vec<Expr>),
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Object(BTreeMap::new())
    }
}

impl Expr {
    /// Every reference in the expression, in syntactic order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(r) => out.push(r),
            Expr::List(items) | Expr::Concat(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Expr::Object(entries) => {
                for item in entries.values() {
                    item.collect_references(out);
                }
            }
        }
    }
}

impl TryFrom<serde_json::Value> for Expr {
    type Error = anyhow::Error;

    fn try_from(json: serde_json::Value) -> Result<Expr> {
        Ok(match json {
            serde_json::Value::Array(items) => Expr::List(
                items
                    .into_iter()
                    .map(Expr::try_from)
                    .collect::<Result<_>>()?,
            ),
            serde_json::Value::Object(mut m) => {
                if m.len() == 1 && m.contains_key(REF_KEY) {
                    match m.remove(REF_KEY) {
                        Some(serde_json::Value::String(s)) => Expr::Ref(s.parse()?),
                        _ => bail!("{} must be a string", REF_KEY),
                    }
                } else if m.len() == 1 && m.contains_key(CONCAT_KEY) {
                    match m.remove(CONCAT_KEY) {
                        Some(serde_json::Value::Array(parts)) => Expr::Concat(
                            parts
                                .into_iter()
                                .map(Expr::try_from)
                                .collect::<Result<_>>()?,
                        ),
                        _ => bail!("{} must be a list", CONCAT_KEY),
                    }
                } else {
                    Expr::Object(
                        m.into_iter()
                            .map(|(k, v)| Ok((k, Expr::try_from(v)?)))
                            .collect::<Result<_>>()?,
                    )
                }
            }
            scalar => Expr::Literal(Value::from_json(scalar)),
        })
    }
}

impl From<Expr> for serde_json::Value {
    fn from(expr: Expr) -> serde_json::Value {
        match expr {
            Expr::Literal(v) => v.to_json(),
            Expr::Ref(r) => serde_json::json!({ "$ref": r.to_string() }),
            Expr::List(items) => serde_json::Value::Array(items.into_iter().map(Into::into).collect()),
            Expr::Object(entries) => serde_json::Value::Object(
                entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
            Expr::Concat(parts) => {
                let parts: Vec<serde_json::Value> = parts.into_iter().map(Into::into).collect();
                serde_json::json!({ "$concat": parts })
            }
        }
    }
}

/// A symbolic reference to another graph node's value, or to repetition data.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reference {
    /// A resource in the same module. Without a key, the reference is to the
    /// whole resource: a list (`count`), a map (`for_each`) or the single
    /// instance.
    Resource {
        resource: ResourceAddr,
        key: Option<InstanceKey>,
        path: AttrPath,
    },
    Variable(String),
    /// An output of a module called from the same module.
    ModuleOutput {
        call: String,
        key: Option<InstanceKey>,
        name: String,
    },
    CountIndex,
    EachKey,
    EachValue,
}

impl Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Resource {
                resource,
                key,
                path,
            } => {
                write!(f, "{}", resource)?;
                if let Some(key) = key {
                    write!(f, "{}", key)?;
                }
                if !path.0.is_empty() {
                    write!(f, ".{}", path)?;
                }
                Ok(())
            }
            Reference::Variable(name) => write!(f, "var.{}", name),
            Reference::ModuleOutput { call, key, name } => {
                write!(f, "module.{}", call)?;
                if let Some(key) = key {
                    write!(f, "{}", key)?;
                }
                write!(f, ".{}", name)
            }
            Reference::CountIndex => write!(f, "count.index"),
            Reference::EachKey => write!(f, "each.key"),
            Reference::EachValue => write!(f, "each.value"),
        }
    }
}

/// A cursor over a reference string.
struct RefParser<'a> {
    input: &'a str,
    rest: &'a str,
}
impl<'a> RefParser<'a> {
    fn ident(&mut self) -> Result<&'a str> {
        let end = self
            .rest
            .find(|c: char| c == '.' || c == '[')
            .unwrap_or(self.rest.len());
        if end == 0 {
            bail!("expected a name in reference {:?}", self.input);
        }
        let (ident, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(ident)
    }

    fn dot(&mut self) -> Result<()> {
        match self.rest.strip_prefix('.') {
            Some(rest) => {
                self.rest = rest;
                Ok(())
            }
            None => bail!("expected '.' in reference {:?}", self.input),
        }
    }

    fn dotted_ident(&mut self) -> Result<&'a str> {
        self.dot()?;
        self.ident()
    }

    /// An optional `[0]` or `["key"]`.
    fn key(&mut self) -> Result<Option<InstanceKey>> {
        let Some(inner) = self.rest.strip_prefix('[') else {
            return Ok(None);
        };
        let mut values = serde_json::Deserializer::from_str(inner).into_iter::<serde_json::Value>();
        let key = match values.next() {
            Some(Ok(serde_json::Value::String(s))) => InstanceKey::Str(s),
            Some(Ok(serde_json::Value::Number(n))) => InstanceKey::Int(
                n.as_i64()
                    .with_context(|| format!("invalid index in reference {:?}", self.input))?,
            ),
            _ => bail!("invalid instance key in reference {:?}", self.input),
        };
        let after = inner[values.byte_offset()..].trim_start();
        match after.strip_prefix(']') {
            Some(rest) => self.rest = rest,
            None => bail!("missing ']' in reference {:?}", self.input),
        }
        Ok(Some(key))
    }

    fn path(&mut self) -> Result<AttrPath> {
        if self.rest.is_empty() {
            return Ok(AttrPath::default());
        }
        self.dot()?;
        let path = self
            .rest
            .parse()
            .with_context(|| format!("invalid attribute path in reference {:?}", self.input))?;
        self.rest = "";
        Ok(path)
    }

    fn finish(&self) -> Result<()> {
        if !self.rest.is_empty() {
            bail!("unexpected {:?} in reference {:?}", self.rest, self.input);
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Reference> {
        let mut p = RefParser { input: s, rest: s };
        let head = p.ident()?;
        let reference = match head {
            "var" => Reference::Variable(p.dotted_ident()?.to_string()),
            "count" => match p.dotted_ident()? {
                "index" => Reference::CountIndex,
                other => bail!("unknown attribute count.{}", other),
            },
            "each" => match p.dotted_ident()? {
                "key" => Reference::EachKey,
                "value" => Reference::EachValue,
                other => bail!("unknown attribute each.{}", other),
            },
            "module" => {
                let call = p.dotted_ident()?.to_string();
                let key = p.key()?;
                let name = p.dotted_ident()?.to_string();
                Reference::ModuleOutput { call, key, name }
            }
            "data" => {
                let type_ = p.dotted_ident()?.to_string();
                let name = p.dotted_ident()?.to_string();
                Reference::Resource {
                    resource: ResourceAddr {
                        mode: ResourceMode::Data,
                        type_,
                        name,
                    },
                    key: p.key()?,
                    path: p.path()?,
                }
            }
            type_ => {
                let name = p.dotted_ident()?;
                Reference::Resource {
                    resource: ResourceAddr::managed(type_, name),
                    key: p.key()?,
                    path: p.path()?,
                }
            }
        };
        p.finish()?;
        Ok(reference)
    }
}

/// What evaluation is for. It decides how unknown values are treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalPhase {
    /// Unknown values flow through.
    Plan,
    /// A reference to an unknown value is an [`UnknownValueError`].
    Apply,
    /// References that cannot be resolved are null; the objects they named
    /// may already be gone.
    Destroy,
    /// Read-only; references that cannot be resolved are unknown.
    Inspect,
}

/// Repetition context of the block an expression belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepetitionData {
    pub count_index: Option<i64>,
    pub each_key: Option<String>,
    pub each_value: Option<Value>,
}

/// A referenced value was still unknown during apply.
#[derive(Clone, Debug)]
pub struct UnknownValueError {
    pub reference: String,
}
impl Display for UnknownValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the value of {} is not known yet", self.reference)
    }
}
impl Error for UnknownValueError {}

/// Resolves the values references point at.
pub trait Scope {
    fn resource(
        &self,
        module: &ModulePath,
        resource: &ResourceAddr,
        key: Option<&InstanceKey>,
    ) -> Result<Value>;
    fn variable(&self, module: &ModulePath, name: &str) -> Result<Value>;
    fn module_output(
        &self,
        module: &ModulePath,
        call: &str,
        key: Option<&InstanceKey>,
        name: &str,
    ) -> Result<Value>;
}

pub fn evaluate(
    expr: &Expr,
    module: &ModulePath,
    repetition: &RepetitionData,
    scope: &dyn Scope,
    phase: EvalPhase,
) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ref(r) => evaluate_reference(r, module, repetition, scope, phase),
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|e| evaluate(e, module, repetition, scope, phase))
                .collect::<Result<_>>()?,
        )),
        Expr::Object(entries) => Ok(Value::Map(
            entries
                .iter()
                .map(|(k, e)| Ok((k.clone(), evaluate(e, module, repetition, scope, phase)?)))
                .collect::<Result<_>>()?,
        )),
        Expr::Concat(parts) => {
            let mut s = String::new();
            for part in parts {
                match evaluate(part, module, repetition, scope, phase)? {
                    Value::Unknown => return Ok(Value::Unknown),
                    Value::Null => {}
                    Value::String(p) => s.push_str(&p),
                    Value::Number(n) => s.push_str(&n.to_string()),
                    Value::Bool(b) => s.push_str(&b.to_string()),
                    v @ (Value::List(_) | Value::Map(_)) => {
                        if v.contains_unknown() {
                            return Ok(Value::Unknown);
                        }
                        bail!("cannot interpolate a structured value into a string: {}", v)
                    }
                }
            }
            Ok(Value::String(s))
        }
    }
}

fn evaluate_reference(
    reference: &Reference,
    module: &ModulePath,
    repetition: &RepetitionData,
    scope: &dyn Scope,
    phase: EvalPhase,
) -> Result<Value> {
    let looked_up = match reference {
        Reference::Resource {
            resource,
            key,
            path,
        } => scope
            .resource(module, resource, key.as_ref())
            .map(|v| v.get_path(path)),
        Reference::Variable(name) => scope.variable(module, name),
        Reference::ModuleOutput { call, key, name } => {
            scope.module_output(module, call, key.as_ref(), name)
        }
        Reference::CountIndex => {
            return repetition
                .count_index
                .map(Value::from)
                .context("count.index used outside of a block with count")
        }
        Reference::EachKey => {
            return repetition
                .each_key
                .clone()
                .map(Value::from)
                .context("each.key used outside of a block with for_each")
        }
        Reference::EachValue => {
            return repetition
                .each_value
                .clone()
                .context("each.value used outside of a block with for_each")
        }
    };
    let value = match (looked_up, phase) {
        (Ok(v), _) => v,
        (Err(_), EvalPhase::Destroy) => Value::Null,
        (Err(_), EvalPhase::Inspect) => Value::Unknown,
        (Err(e), _) => return Err(e.context(format!("evaluating {}", reference))),
    };
    if phase == EvalPhase::Apply && value.contains_unknown() {
        return Err(UnknownValueError {
            reference: reference.to_string(),
        }
        .into());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// `t_x.a` has `id = "a-1"`, `t_x.b` is unknown; `var.n = 3`.
    struct Fixed;
    impl Scope for Fixed {
        fn resource(
            &self,
            _module: &ModulePath,
            resource: &ResourceAddr,
            _key: Option<&InstanceKey>,
        ) -> Result<Value> {
            match resource.name.as_str() {
                "a" => Ok(Value::from_json(json!({"id": "a-1", "tags": {"env": "dev"}}))),
                "b" => Ok(Value::object([("id", Value::Unknown)])),
                _ => bail!("no such resource {}", resource),
            }
        }
        fn variable(&self, _module: &ModulePath, name: &str) -> Result<Value> {
            match name {
                "n" => Ok(Value::from(3i64)),
                _ => bail!("no variable {}", name),
            }
        }
        fn module_output(
            &self,
            _module: &ModulePath,
            call: &str,
            key: Option<&InstanceKey>,
            name: &str,
        ) -> Result<Value> {
            Ok(Value::from(format!("{}{}.{}", call, key.map(|k| k.to_string()).unwrap_or_default(), name)))
        }
    }

    fn expr(json: serde_json::Value) -> Expr {
        serde_json::from_value(json).unwrap()
    }

    fn eval(e: &Expr, phase: EvalPhase) -> Result<Value> {
        evaluate(e, &ModulePath::root(), &RepetitionData::default(), &Fixed, phase)
    }

    #[test]
    fn parse_references() {
        let cases = [
            "t_x.a.id",
            "t_x.a[0].tags.env",
            "t_x.a[\"k.1\"]",
            "data.t_y.b.list[2]",
            "var.region",
            "module.net[1].subnet",
            "count.index",
            "each.key",
            "each.value",
        ];
        for case in cases {
            let r: Reference = case.parse().unwrap();
            assert_eq!(r.to_string(), case);
        }
        let r: Reference = "data.t_y.b[3].x".parse().unwrap();
        assert_eq!(
            r,
            Reference::Resource {
                resource: ResourceAddr::data("t_y", "b"),
                key: Some(InstanceKey::Int(3)),
                path: AttrPath::attr("x"),
            }
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        for case in ["", "t_x", "var", "count.key", "t_x.a[", "t_x.a[x]", "t_x.a..b", "module.m"] {
            assert!(case.parse::<Reference>().is_err(), "{:?}", case);
        }
    }

    #[test]
    fn json_encoding() {
        let e = expr(json!({
            "name": {"$concat": ["web-", {"$ref": "count.index"}]},
            "peer": {"$ref": "t_x.a.id"},
            "ports": [80, 443]
        }));
        let refs: Vec<String> = e.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(refs, vec!["count.index", "t_x.a.id"]);
        let back: serde_json::Value = e.clone().into();
        assert_eq!(expr(back), e);
        assert!(serde_json::from_value::<Expr>(json!({"$ref": 1})).is_err());
    }

    #[test]
    fn evaluates_references() {
        let e = expr(json!({
            "peer": {"$ref": "t_x.a.id"},
            "env": {"$ref": "t_x.a.tags.env"},
            "missing": {"$ref": "t_x.a.nope"},
            "n": {"$ref": "var.n"},
            "out": {"$ref": "module.m[\"x\"].ip"}
        }));
        assert_eq!(
            eval(&e, EvalPhase::Plan).unwrap(),
            Value::from_json(json!({
                "peer": "a-1",
                "env": "dev",
                "missing": null,
                "n": 3,
                "out": "m[\"x\"].ip"
            }))
        );
    }

    #[test]
    fn unknown_makes_concat_unknown() {
        let e = expr(json!({"$concat": ["id-", {"$ref": "t_x.b.id"}]}));
        assert_eq!(eval(&e, EvalPhase::Plan).unwrap(), Value::Unknown);
        let e = expr(json!({"$concat": ["n=", {"$ref": "var.n"}]}));
        assert_eq!(eval(&e, EvalPhase::Plan).unwrap(), Value::from("n=3"));
    }

    #[test]
    fn apply_phase_rejects_unknown() {
        let e = expr(json!({"peer": {"$ref": "t_x.b.id"}}));
        let err = eval(&e, EvalPhase::Apply).unwrap_err();
        let unknown = err.downcast_ref::<UnknownValueError>().unwrap();
        assert_eq!(unknown.reference, "t_x.b.id");
    }

    #[test]
    fn phases_tolerate_missing_differently() {
        let e = expr(json!({"$ref": "t_x.gone.id"}));
        assert!(eval(&e, EvalPhase::Plan).is_err());
        assert_eq!(eval(&e, EvalPhase::Destroy).unwrap(), Value::Null);
        assert_eq!(eval(&e, EvalPhase::Inspect).unwrap(), Value::Unknown);
    }

    #[test]
    fn repetition_data() {
        let e = expr(json!([{"$ref": "count.index"}, {"$ref": "each.key"}, {"$ref": "each.value"}]));
        let rep = RepetitionData {
            count_index: Some(2),
            each_key: Some("k".to_string()),
            each_value: Some(Value::from("v")),
        };
        let v = evaluate(&e, &ModulePath::root(), &rep, &Fixed, EvalPhase::Plan).unwrap();
        assert_eq!(v, Value::from_json(json!([2, "k", "v"])));
        assert!(eval(&expr(json!({"$ref": "count.index"})), EvalPhase::Plan).is_err());
    }
}
