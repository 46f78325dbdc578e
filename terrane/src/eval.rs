//! Values flowing between graph nodes, and how expressions inside a node
//! see them.

use anyhow::{bail, Context as _, Result};
use std::{collections::BTreeMap, sync::Arc};
use terrane_core::{
    addr::{AbsResourceAddr, InstanceKey, ModulePath, ResourceAddr, ResourceInstanceAddr},
    diagnostics::{Diagnostic, Diagnostics},
    value::Value,
};
use terrane_provider::{framework::ResourceProvider, registry::ProviderRegistry};
use terrane_state::snapshot::StateSnapshot;
use tracing::debug;

use crate::{
    expand::{Expansion, Repetition},
    expr::{evaluate, EvalPhase, RepetitionData, Scope, UnknownValueError},
    graph::{
        builder::{Boundary, ModuleNode, NodeKey, ProviderNode},
        walk::Outcome,
    },
    plan::{PlannedChange, ResourceDrift},
};

/// What a resource node produces.
#[derive(Clone, Debug, Default)]
pub struct ResourceOutcome {
    /// The value dependents see. During planning it may contain unknowns;
    /// null once the object is deleted.
    pub value: Value,
    pub change: Option<PlannedChange>,
    pub drift: Option<ResourceDrift>,
    pub warnings: Diagnostics,
}

#[derive(Clone)]
pub enum NodeValue {
    Resource(ResourceOutcome),
    Provider(Arc<dyn ResourceProvider>),
    /// The evaluated inputs or outputs of a module instance.
    Module(Arc<BTreeMap<String, Value>>),
}

pub type Outcomes = BTreeMap<NodeKey, Outcome<NodeValue>>;

/// Resolves references from the outcomes of a node's dependencies.
pub struct NodeScope<'a> {
    pub upstream: &'a Outcomes,
    pub expansion: &'a Expansion,
    pub variables: &'a BTreeMap<String, Value>,
    /// Consulted for resources that are not upstream when destroying or
    /// inspecting.
    pub prior: &'a StateSnapshot,
    pub phase: EvalPhase,
}

impl NodeScope<'_> {
    fn instance_value(&self, addr: &ResourceInstanceAddr) -> Result<Value> {
        match self.upstream.get(&NodeKey::Resource(addr.clone())) {
            Some(Outcome::Complete(NodeValue::Resource(r))) => Ok(r.value.clone()),
            Some(_) => bail!("{} is not available", addr),
            None => match self.phase {
                EvalPhase::Destroy | EvalPhase::Inspect => self
                    .prior
                    .get(addr)
                    .map(|o| o.value.clone())
                    .with_context(|| format!("{} is not in state", addr)),
                EvalPhase::Plan | EvalPhase::Apply => {
                    bail!("{} is not a dependency of this node", addr)
                }
            },
        }
    }

    fn module_outputs(&self, path: &ModulePath, name: &str) -> Result<Value> {
        match self.upstream.get(&NodeKey::Module(path.clone(), Boundary::Outputs)) {
            Some(Outcome::Complete(NodeValue::Module(outputs))) => {
                Ok(outputs.get(name).cloned().unwrap_or_default())
            }
            _ => bail!("outputs of {} are not available", path),
        }
    }
}

/// Collect per-instance values into the shape of an un-keyed reference.
fn collect_instances(
    repetition: Repetition,
    instances: &[(InstanceKey, RepetitionData)],
    mut value_of: impl FnMut(&InstanceKey) -> Result<Value>,
) -> Result<Value> {
    match repetition {
        Repetition::Single => value_of(&InstanceKey::None),
        Repetition::Count => Ok(Value::List(
            instances
                .iter()
                .map(|(k, _)| value_of(k))
                .collect::<Result<_>>()?,
        )),
        Repetition::ForEach => Ok(Value::Map(
            instances
                .iter()
                .map(|(k, _)| {
                    let name = match k {
                        InstanceKey::Str(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Ok((name, value_of(k)?))
                })
                .collect::<Result<_>>()?,
        )),
    }
}

impl Scope for NodeScope<'_> {
    fn resource(
        &self,
        module: &ModulePath,
        resource: &ResourceAddr,
        key: Option<&InstanceKey>,
    ) -> Result<Value> {
        let abs = AbsResourceAddr {
            module: module.clone(),
            resource: resource.clone(),
        };
        if let Some(key) = key {
            return self.instance_value(&abs.instance(key.clone()));
        }
        match self.expansion.resource(&abs) {
            Some(expanded) => collect_instances(expanded.repetition, &expanded.instances, |k| {
                self.instance_value(&abs.instance(k.clone()))
            }),
            None => self.instance_value(&abs.instance(InstanceKey::None)),
        }
    }

    fn variable(&self, module: &ModulePath, name: &str) -> Result<Value> {
        if module.is_root() {
            return self
                .variables
                .get(name)
                .cloned()
                .with_context(|| format!("no value for var.{}", name));
        }
        if let Some(Outcome::Complete(NodeValue::Module(inputs))) = self
            .upstream
            .get(&NodeKey::Module(module.clone(), Boundary::Inputs))
        {
            return inputs
                .get(name)
                .cloned()
                .with_context(|| format!("no value for var.{} in {}", name, module));
        }
        self.expansion
            .modules
            .get(module)
            .and_then(|m| m.static_variables.get(name))
            .cloned()
            .with_context(|| format!("no value for var.{} in {}", name, module))
    }

    fn module_output(
        &self,
        module: &ModulePath,
        call: &str,
        key: Option<&InstanceKey>,
        name: &str,
    ) -> Result<Value> {
        if let Some(key) = key {
            return self.module_outputs(&module.child(call, key.clone()), name);
        }
        let expanded = self
            .expansion
            .call(module, call)
            .with_context(|| format!("module.{} is not declared in {}", call, module))?;
        collect_instances(expanded.repetition, &expanded.instances, |k| {
            self.module_outputs(&module.child(call, k.clone()), name)
        })
    }
}

pub fn is_unknown_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<UnknownValueError>().is_some()
}

/// Evaluate the configuration of a provider and configure it.
///
/// A configuration that is not fully known yet defers the provider, and with
/// it every resource that uses it.
pub async fn configure_provider(
    node: &ProviderNode,
    registry: &ProviderRegistry,
    scope: &NodeScope<'_>,
) -> Result<Outcome<NodeValue>> {
    let config = match &node.config {
        None => Value::Map(BTreeMap::new()),
        Some(expr) => match evaluate(
            expr,
            &node.addr.module,
            &RepetitionData::default(),
            scope,
            scope.phase,
        ) {
            Ok(config) => config,
            Err(e) if is_unknown_error(&e) => return Ok(Outcome::Deferred(e.to_string())),
            Err(e) => return Err(e.context(format!("evaluating configuration of {}", node.addr))),
        },
    };
    if config.contains_unknown() {
        return Ok(Outcome::Deferred(format!(
            "configuration of {} depends on values not known until apply",
            node.addr
        )));
    }
    debug!(provider = %node.addr, "configuring provider");
    let provider = registry.configure(&node.addr.type_, config).await?;
    Ok(Outcome::Complete(NodeValue::Provider(provider)))
}

pub fn evaluate_module(node: &ModuleNode, scope: &NodeScope<'_>) -> Result<Outcome<NodeValue>> {
    let mut values = BTreeMap::new();
    for (name, expr) in &node.exprs {
        match evaluate(expr, &node.scope_module, &node.repetition, scope, scope.phase) {
            Ok(value) => {
                values.insert(name.clone(), value);
            }
            Err(e) if is_unknown_error(&e) => return Ok(Outcome::Deferred(e.to_string())),
            Err(e) => return Err(e.context(format!("evaluating {} of {}", name, node.path))),
        }
    }
    Ok(Outcome::Complete(NodeValue::Module(Arc::new(values))))
}

/// The provider a resource node depends on.
pub fn upstream_provider(
    upstream: &Outcomes,
    key: &NodeKey,
) -> Result<Arc<dyn ResourceProvider>> {
    match upstream.get(key) {
        Some(Outcome::Complete(NodeValue::Provider(p))) => Ok(p.clone()),
        _ => bail!("{} is not configured", key),
    }
}

/// Report a node failure as diagnostics for `address`. Failures that carry
/// diagnostics keep them.
pub fn failure_diagnostics(address: impl std::fmt::Display, error: &anyhow::Error) -> Diagnostics {
    match error.downcast_ref::<Diagnostics>() {
        Some(diagnostics) => diagnostics.clone().with_address(address),
        None => Diagnostic::from_error(format!("{} failed", address), error)
            .with_address(address)
            .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Configuration,
        expr::{Expr, Reference},
    };
    use serde_json::json;

    fn resource_outcome(value: serde_json::Value) -> Outcome<NodeValue> {
        Outcome::Complete(NodeValue::Resource(ResourceOutcome {
            value: Value::from_json(value),
            ..Default::default()
        }))
    }

    #[test]
    fn unkeyed_references_follow_repetition() {
        let config = Configuration::from_json(json!({"root": {"resources": [
            {"type": "t_x", "name": "many", "count": 2},
            {"type": "t_x", "name": "keyed", "for_each": ["p"]}
        ]}}))
        .unwrap();
        let expansion = Expansion::expand(&config, &BTreeMap::new()).unwrap();
        let upstream: Outcomes = [
            ("t_x.many[0]", json!({"id": 0})),
            ("t_x.many[1]", json!({"id": 1})),
            ("t_x.keyed[\"p\"]", json!({"id": "p"})),
        ]
        .into_iter()
        .map(|(a, v)| (NodeKey::Resource(a.parse().unwrap()), resource_outcome(v)))
        .collect();
        let prior = StateSnapshot::new();
        let scope = NodeScope {
            upstream: &upstream,
            expansion: &expansion,
            variables: &BTreeMap::new(),
            prior: &prior,
            phase: EvalPhase::Plan,
        };
        let many = scope
            .resource(&ModulePath::root(), &ResourceAddr::managed("t_x", "many"), None)
            .unwrap();
        assert_eq!(many, Value::from_json(json!([{"id": 0}, {"id": 1}])));
        let keyed = scope
            .resource(&ModulePath::root(), &ResourceAddr::managed("t_x", "keyed"), None)
            .unwrap();
        assert_eq!(keyed, Value::from_json(json!({"p": {"id": "p"}})));
        assert!(scope
            .resource(
                &ModulePath::root(),
                &ResourceAddr::managed("t_x", "many"),
                Some(&InstanceKey::Int(5))
            )
            .is_err());
    }

    #[test]
    fn destroy_reads_prior_state() {
        let mut prior = StateSnapshot::new();
        prior.insert(
            "t_x.gone".parse().unwrap(),
            crate::testing::object(json!({"id": "g"}), &[]),
        );
        let upstream = Outcomes::new();
        let expansion = Expansion::default();
        let scope = NodeScope {
            upstream: &upstream,
            expansion: &expansion,
            variables: &BTreeMap::new(),
            prior: &prior,
            phase: EvalPhase::Destroy,
        };
        let expr = Expr::Ref(Reference::Resource {
            resource: ResourceAddr::managed("t_x", "gone"),
            key: None,
            path: terrane_core::value::AttrPath::attr("id"),
        });
        let v = evaluate(&expr, &ModulePath::root(), &RepetitionData::default(), &scope, EvalPhase::Destroy)
            .unwrap();
        assert_eq!(v, Value::from("g"));
    }

    #[test]
    fn module_variables_come_from_inputs() {
        let path: ModulePath = "module.net".parse().unwrap();
        let mut upstream = Outcomes::new();
        upstream.insert(
            NodeKey::Module(path.clone(), Boundary::Inputs),
            Outcome::Complete(NodeValue::Module(Arc::new(BTreeMap::from([(
                "cidr".to_string(),
                Value::from("10.0.0.0/8"),
            )])))),
        );
        let expansion = Expansion::default();
        let prior = StateSnapshot::new();
        let scope = NodeScope {
            upstream: &upstream,
            expansion: &expansion,
            variables: &BTreeMap::new(),
            prior: &prior,
            phase: EvalPhase::Plan,
        };
        assert_eq!(scope.variable(&path, "cidr").unwrap(), Value::from("10.0.0.0/8"));
        assert!(scope.variable(&path, "nope").is_err());
    }

    #[test]
    fn failures_keep_their_diagnostics() {
        let diags: Diagnostics = Diagnostic::error("quota exceeded").into();
        let err = anyhow::Error::new(diags);
        let out = failure_diagnostics("t_x.a", &err);
        assert_eq!(out.len(), 1);
        assert_eq!(out.iter().next().unwrap().summary, "quota exceeded");
        assert_eq!(out.iter().next().unwrap().address.as_deref(), Some("t_x.a"));

        let out = failure_diagnostics("t_x.a", &anyhow::anyhow!("connection reset"));
        assert!(out.has_errors());
    }
}
