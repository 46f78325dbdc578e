//! Expansion of `count` and `for_each` into concrete instances.
//!
//! This runs before graph construction, so that the graph only ever contains
//! concrete addresses. Repetition must therefore be decidable from literals
//! and variables alone.

use anyhow::{bail, Context as _, Result};
use std::collections::BTreeMap;
use terrane_core::{
    addr::{AbsResourceAddr, InstanceKey, ModulePath, ResourceAddr, ResourceInstanceAddr},
    value::Value,
};
use tracing::debug;

use crate::{
    config::{Configuration, ModuleConfig},
    expr::{evaluate, EvalPhase, Expr, RepetitionData, Scope},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Repetition {
    Single,
    Count,
    ForEach,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expanded {
    pub repetition: Repetition,
    /// In key order.
    pub instances: Vec<(InstanceKey, RepetitionData)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInstance {
    /// The repetition data of the call that created this instance.
    pub repetition: RepetitionData,
    /// Variable values as far as they are known before the walk. Inputs that
    /// refer to resources are unknown here.
    pub static_variables: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expansion {
    pub modules: BTreeMap<ModulePath, ModuleInstance>,
    pub resources: BTreeMap<AbsResourceAddr, Expanded>,
    /// Keyed by the calling module instance and the call name.
    pub calls: BTreeMap<(ModulePath, String), Expanded>,
}

/// Only variables are available before the walk.
struct StaticScope<'a> {
    variables: &'a BTreeMap<String, Value>,
}
impl Scope for StaticScope<'_> {
    fn resource(
        &self,
        _module: &ModulePath,
        resource: &ResourceAddr,
        _key: Option<&InstanceKey>,
    ) -> Result<Value> {
        bail!(
            "{} cannot be determined until apply; repetition may only depend on literals and variables",
            resource
        )
    }
    fn variable(&self, _module: &ModulePath, name: &str) -> Result<Value> {
        self.variables
            .get(name)
            .cloned()
            .with_context(|| format!("undeclared variable {:?}", name))
    }
    fn module_output(
        &self,
        _module: &ModulePath,
        call: &str,
        _key: Option<&InstanceKey>,
        name: &str,
    ) -> Result<Value> {
        bail!(
            "module.{}.{} cannot be determined until apply; repetition may only depend on literals and variables",
            call,
            name
        )
    }
}

/// Merge given values with declared defaults. Every declared variable needs
/// a value, and only declared variables may be given.
pub fn root_variables(
    config: &Configuration,
    given: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    for name in given.keys() {
        if !config.root.variables.contains_key(name) {
            bail!("a value was given for undeclared variable {:?}", name);
        }
    }
    config
        .root
        .variables
        .iter()
        .map(|(name, decl)| {
            let value = given
                .get(name)
                .or(decl.default.as_ref())
                .cloned()
                .with_context(|| format!("no value for required variable {:?}", name))?;
            Ok((name.clone(), value))
        })
        .collect()
}

fn expand_repetition(
    count: Option<&Expr>,
    for_each: Option<&Expr>,
    module: &ModulePath,
    repetition: &RepetitionData,
    scope: &StaticScope,
) -> Result<Expanded> {
    if let Some(count) = count {
        let value = evaluate(count, module, repetition, scope, EvalPhase::Plan)?;
        let n = match value {
            Value::Unknown => bail!("count cannot be determined until apply"),
            v => v
                .as_i64()
                .with_context(|| format!("count must be a whole number, got {}", v))?,
        };
        if n < 0 {
            bail!("count must not be negative, got {}", n);
        }
        return Ok(Expanded {
            repetition: Repetition::Count,
            instances: (0..n)
                .map(|i| {
                    (
                        InstanceKey::Int(i),
                        RepetitionData {
                            count_index: Some(i),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        });
    }
    if let Some(for_each) = for_each {
        let value = evaluate(for_each, module, repetition, scope, EvalPhase::Plan)?;
        if value.contains_unknown() {
            bail!("for_each cannot be determined until apply");
        }
        let entries: BTreeMap<String, Value> = match value {
            Value::Map(m) => m,
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok((s.clone(), Value::String(s))),
                    other => bail!("for_each over a list needs strings, got {}", other),
                })
                .collect::<Result<_>>()?,
            other => bail!("for_each must be a map or a list of strings, got {}", other),
        };
        return Ok(Expanded {
            repetition: Repetition::ForEach,
            instances: entries
                .into_iter()
                .map(|(k, v)| {
                    (
                        InstanceKey::Str(k.clone()),
                        RepetitionData {
                            each_key: Some(k),
                            each_value: Some(v),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        });
    }
    Ok(Expanded {
        repetition: Repetition::Single,
        instances: vec![(InstanceKey::None, RepetitionData::default())],
    })
}

impl Expansion {
    pub fn expand(config: &Configuration, variables: &BTreeMap<String, Value>) -> Result<Expansion> {
        let mut expansion = Expansion::default();
        expansion.expand_module(
            &config.root,
            ModulePath::root(),
            ModuleInstance {
                repetition: RepetitionData::default(),
                static_variables: variables.clone(),
            },
        )?;
        debug!(
            modules = expansion.modules.len(),
            resources = expansion.resources.len(),
            "expanded configuration"
        );
        Ok(expansion)
    }

    fn expand_module(
        &mut self,
        module: &ModuleConfig,
        path: ModulePath,
        instance: ModuleInstance,
    ) -> Result<()> {
        let scope = StaticScope {
            variables: &instance.static_variables,
        };
        for resource in &module.resources {
            let addr = AbsResourceAddr {
                module: path.clone(),
                resource: resource.addr(),
            };
            let expanded = expand_repetition(
                resource.count.as_ref(),
                resource.for_each.as_ref(),
                &path,
                &RepetitionData::default(),
                &scope,
            )
            .with_context(|| format!("expanding {}", addr))?;
            self.resources.insert(addr, expanded);
        }
        for call in &module.module_calls {
            let expanded = expand_repetition(
                call.count.as_ref(),
                call.for_each.as_ref(),
                &path,
                &RepetitionData::default(),
                &scope,
            )
            .with_context(|| format!("expanding module.{} in {}", call.name, path))?;
            for (key, repetition) in &expanded.instances {
                let child_path = path.child(&call.name, key.clone());
                let mut static_variables = BTreeMap::new();
                for (name, decl) in &call.module.variables {
                    let value = match call.inputs.get(name) {
                        Some(input) => {
                            evaluate(input, &path, repetition, &scope, EvalPhase::Inspect)?
                        }
                        None => decl.default.clone().with_context(|| {
                            format!("module.{}: no value for required variable {:?}", call.name, name)
                        })?,
                    };
                    static_variables.insert(name.clone(), value);
                }
                self.expand_module(
                    &call.module,
                    child_path,
                    ModuleInstance {
                        repetition: repetition.clone(),
                        static_variables,
                    },
                )?;
            }
            self.calls.insert((path.clone(), call.name.clone()), expanded);
        }
        self.modules.insert(path, instance);
        Ok(())
    }

    pub fn resource(&self, addr: &AbsResourceAddr) -> Option<&Expanded> {
        self.resources.get(addr)
    }

    pub fn call(&self, module: &ModulePath, name: &str) -> Option<&Expanded> {
        self.calls.get(&(module.clone(), name.to_string()))
    }

    /// All desired resource instances with their repetition data, in address
    /// order of their resource.
    pub fn resource_instances(
        &self,
    ) -> impl Iterator<Item = (ResourceInstanceAddr, &RepetitionData)> + '_ {
        self.resources.iter().flat_map(|(addr, expanded)| {
            expanded
                .instances
                .iter()
                .map(move |(key, repetition)| (addr.instance(key.clone()), repetition))
        })
    }

    /// Non-root module instances.
    pub fn child_modules(&self) -> impl Iterator<Item = (&ModulePath, &ModuleInstance)> {
        self.modules.iter().filter(|(path, _)| !path.is_root())
    }
}
