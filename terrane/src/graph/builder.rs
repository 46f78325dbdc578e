//! Builds the execution graph of a plan or apply run.
//!
//! Nodes are resource instances, provider configurations and the two
//! boundaries of every module instance. Configuration errors found here are
//! fatal: nothing has been walked yet.

use anyhow::{bail, Context as _, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
};
use terrane_core::{
    addr::{
        AbsResourceAddr, InstanceKey, ModulePath, ProviderConfigAddr, ResourceAddr,
        ResourceInstanceAddr,
    },
    value::Value,
};
use terrane_provider::registry::ProviderRegistry;
use terrane_state::snapshot::{ResourceInstanceObject, StateSnapshot};
use tracing::debug;

use super::Graph;
use crate::{
    config::{Configuration, DependsOn, ModuleConfig, ResourceConfig},
    expand::Expansion,
    expr::{Expr, Reference, RepetitionData},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Boundary {
    /// The evaluated variables of a module instance.
    Inputs,
    /// The evaluated outputs of a module instance.
    Outputs,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeKey {
    Provider(ProviderConfigAddr),
    Module(ModulePath, Boundary),
    Resource(ResourceInstanceAddr),
}
impl Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Provider(addr) => write!(f, "{}", addr),
            NodeKey::Module(path, Boundary::Inputs) => write!(f, "{} (inputs)", path),
            NodeKey::Module(path, Boundary::Outputs) => write!(f, "{} (outputs)", path),
            NodeKey::Resource(addr) => write!(f, "{}", addr),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphMode {
    Normal,
    /// Every object in state is deleted, dependents first.
    Destroy,
}

/// A configured resource instance.
#[derive(Clone, Debug)]
pub struct DesiredResource {
    pub config: ResourceConfig,
    pub repetition: RepetitionData,
}

#[derive(Clone, Debug)]
pub struct ResourceNode {
    pub addr: ResourceInstanceAddr,
    pub provider: ProviderConfigAddr,
    /// `None` when the instance is to be deleted: it is only in state, or
    /// the graph is a destroy graph.
    pub desired: Option<DesiredResource>,
    pub prior: Option<ResourceInstanceObject>,
    /// Resources this instance depends on, through module boundaries too.
    /// Recorded in state so that it can be destroyed in order later.
    pub dependencies: BTreeSet<AbsResourceAddr>,
}

#[derive(Clone, Debug)]
pub struct ProviderNode {
    pub addr: ProviderConfigAddr,
    /// `None` for a provider that has no configuration block.
    pub config: Option<Expr>,
}

#[derive(Clone, Debug)]
pub struct ModuleNode {
    pub path: ModulePath,
    pub boundary: Boundary,
    /// Evaluated to a map with these keys.
    pub exprs: BTreeMap<String, Expr>,
    /// The module the expressions are written in. For inputs that is the
    /// calling module.
    pub scope_module: ModulePath,
    pub repetition: RepetitionData,
}

#[derive(Clone, Debug)]
pub enum Node {
    Resource(ResourceNode),
    Provider(ProviderNode),
    Module(ModuleNode),
}

#[derive(Debug)]
pub struct ExecGraph {
    pub mode: GraphMode,
    pub graph: Graph<NodeKey>,
    pub nodes: BTreeMap<NodeKey, Node>,
    /// Dependencies first.
    pub order: Vec<NodeKey>,
}

impl ExecGraph {
    pub fn resource(&self, addr: &ResourceInstanceAddr) -> Option<&ResourceNode> {
        match self.nodes.get(&NodeKey::Resource(addr.clone())) {
            Some(Node::Resource(r)) => Some(r),
            _ => None,
        }
    }

    pub fn resource_nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values().filter_map(|n| match n {
            Node::Resource(r) => Some(r),
            _ => None,
        })
    }

    /// Resource instances in execution order.
    pub fn resource_order(&self) -> impl Iterator<Item = &ResourceInstanceAddr> {
        self.order.iter().filter_map(|k| match k {
            NodeKey::Resource(addr) => Some(addr),
            _ => None,
        })
    }
}

pub struct BuildInput<'a> {
    pub config: &'a Configuration,
    pub expansion: &'a Expansion,
    pub prior: &'a StateSnapshot,
    pub registry: &'a ProviderRegistry,
}

struct Builder<'a> {
    input: &'a BuildInput<'a>,
    graph: Graph<NodeKey>,
    nodes: BTreeMap<NodeKey, Node>,
}

pub fn build(input: &BuildInput, mode: GraphMode) -> Result<ExecGraph> {
    let mut builder = Builder {
        input,
        graph: Graph::new(),
        nodes: BTreeMap::new(),
    };
    builder.add_desired_resources()?;
    builder.add_orphans()?;
    builder.add_modules()?;
    builder.add_reference_edges()?;
    builder.add_providers(mode)?;
    builder.add_orphan_edges();
    builder.collect_dependencies();
    let (graph, nodes) = match mode {
        GraphMode::Normal => (builder.graph, builder.nodes),
        GraphMode::Destroy => builder.into_destroy()?,
    };
    let order = graph.topological_order()?;
    debug!(nodes = nodes.len(), ?mode, "built graph");
    Ok(ExecGraph {
        mode,
        graph,
        nodes,
        order,
    })
}

impl<'a> Builder<'a> {
    fn module_config(&self, path: &ModulePath) -> Result<&'a ModuleConfig> {
        self.input
            .config
            .module(path)
            .with_context(|| format!("no configuration for module {}", path))
    }

    fn add_node(&mut self, key: NodeKey, node: Node) {
        self.graph.add_node(key.clone());
        self.nodes.insert(key, node);
    }

    /// Resource nodes with their provider resolved; the provider nodes
    /// themselves are added later.
    fn add_desired_resources(&mut self) -> Result<()> {
        let input = self.input;
        for (addr, repetition) in input.expansion.resource_instances() {
            let module = self.module_config(&addr.module)?;
            let config = module
                .resource(&addr.resource)
                .with_context(|| format!("no configuration for {}", addr))?;
            let provider =
                self.resolve_provider(&addr.module, &addr.resource, config.provider.as_deref())?;
            let prior = input.prior.get(&addr).cloned();
            self.add_node(
                NodeKey::Resource(addr.clone()),
                Node::Resource(ResourceNode {
                    addr,
                    provider,
                    desired: Some(DesiredResource {
                        config: config.clone(),
                        repetition: repetition.clone(),
                    }),
                    prior,
                    dependencies: BTreeSet::new(),
                }),
            );
        }
        Ok(())
    }

    /// Objects in state that the configuration no longer declares.
    fn add_orphans(&mut self) -> Result<()> {
        let input = self.input;
        for (addr, object) in &input.prior.resources {
            let key = NodeKey::Resource(addr.clone());
            if self.nodes.contains_key(&key) {
                continue;
            }
            if !input.registry.contains(&object.provider.type_) {
                bail!(
                    "unknown provider {:?}, needed to delete {}",
                    object.provider.type_,
                    addr
                );
            }
            self.add_node(
                key,
                Node::Resource(ResourceNode {
                    addr: addr.clone(),
                    provider: object.provider.clone(),
                    desired: None,
                    prior: Some(object.clone()),
                    dependencies: object.dependencies.clone(),
                }),
            );
        }
        Ok(())
    }

    /// The nearest provider block for the type in this module or an
    /// ancestor. Without an alias, a provider with no block is implied at
    /// the root.
    fn resolve_provider(
        &self,
        module: &ModulePath,
        resource: &ResourceAddr,
        alias: Option<&str>,
    ) -> Result<ProviderConfigAddr> {
        let type_ = resource.implied_provider();
        if !self.input.registry.contains(type_) {
            bail!("unknown provider {:?}, needed by {}", type_, resource);
        }
        let mut path = Some(module.clone());
        while let Some(current) = path {
            if self.module_config(&current)?.provider(type_, alias).is_some() {
                return Ok(ProviderConfigAddr::new(current, type_, alias));
            }
            path = current.parent().map(|(parent, _)| parent);
        }
        match alias {
            None => Ok(ProviderConfigAddr::new(ModulePath::root(), type_, None)),
            Some(alias) => bail!(
                "{} in {} uses provider {}.{}, which is not configured",
                resource,
                module,
                type_,
                alias
            ),
        }
    }

    fn add_modules(&mut self) -> Result<()> {
        let input = self.input;
        for (path, instance) in input.expansion.child_modules() {
            let Some((parent, step)) = path.parent() else {
                continue;
            };
            let call = self
                .module_config(&parent)?
                .module_call(&step.name)
                .with_context(|| format!("no configuration for {}", path))?;
            let mut inputs = BTreeMap::new();
            for (name, decl) in &call.module.variables {
                let expr = match (call.inputs.get(name), &decl.default) {
                    (Some(expr), _) => expr.clone(),
                    (None, Some(default)) => Expr::Literal(default.clone()),
                    (None, None) => Expr::Literal(Value::Null),
                };
                inputs.insert(name.clone(), expr);
            }
            self.add_node(
                NodeKey::Module(path.clone(), Boundary::Inputs),
                Node::Module(ModuleNode {
                    path: path.clone(),
                    boundary: Boundary::Inputs,
                    exprs: inputs,
                    scope_module: parent.clone(),
                    repetition: instance.repetition.clone(),
                }),
            );
            self.add_node(
                NodeKey::Module(path.clone(), Boundary::Outputs),
                Node::Module(ModuleNode {
                    path: path.clone(),
                    boundary: Boundary::Outputs,
                    exprs: call.module.outputs.clone(),
                    scope_module: path.clone(),
                    repetition: RepetitionData::default(),
                }),
            );
        }
        Ok(())
    }

    fn resource_targets(
        &self,
        module: &ModulePath,
        resource: &ResourceAddr,
        key: Option<&InstanceKey>,
    ) -> Result<Vec<NodeKey>> {
        let abs = AbsResourceAddr {
            module: module.clone(),
            resource: resource.clone(),
        };
        let expanded = self
            .input
            .expansion
            .resource(&abs)
            .with_context(|| format!("reference to undeclared resource {}", abs))?;
        Ok(expanded
            .instances
            .iter()
            .filter(|(k, _)| key.map(|want| want == k).unwrap_or(true))
            .map(|(k, _)| NodeKey::Resource(abs.instance(k.clone())))
            .collect())
    }

    fn reference_targets(&self, module: &ModulePath, reference: &Reference) -> Result<Vec<NodeKey>> {
        match reference {
            Reference::Resource { resource, key, .. } => {
                self.resource_targets(module, resource, key.as_ref())
            }
            Reference::Variable(name) => {
                if !self.module_config(module)?.variables.contains_key(name) {
                    bail!("reference to undeclared variable var.{} in {}", name, module);
                }
                Ok(if module.is_root() {
                    Vec::new()
                } else {
                    vec![NodeKey::Module(module.clone(), Boundary::Inputs)]
                })
            }
            Reference::ModuleOutput { call, key, name } => {
                let declared = self
                    .module_config(module)?
                    .module_call(call)
                    .with_context(|| format!("reference to undeclared module.{} in {}", call, module))?;
                if !declared.module.outputs.contains_key(name) {
                    bail!("module.{} has no output {:?}", call, name);
                }
                let expanded = self
                    .input
                    .expansion
                    .call(module, call)
                    .with_context(|| format!("module.{} in {} was not expanded", call, module))?;
                Ok(expanded
                    .instances
                    .iter()
                    .filter(|(k, _)| key.as_ref().map(|want| want == k).unwrap_or(true))
                    .map(|(k, _)| NodeKey::Module(module.child(call, k.clone()), Boundary::Outputs))
                    .collect())
            }
            Reference::CountIndex | Reference::EachKey | Reference::EachValue => Ok(Vec::new()),
        }
    }

    fn expr_targets<'e>(
        &self,
        module: &ModulePath,
        exprs: impl IntoIterator<Item = &'e Expr>,
    ) -> Result<Vec<NodeKey>> {
        let mut out = Vec::new();
        for expr in exprs {
            for reference in expr.references() {
                out.extend(self.reference_targets(module, reference)?);
            }
        }
        Ok(out)
    }

    fn depends_on_targets(&self, module: &ModulePath, deps: &[DependsOn]) -> Result<Vec<NodeKey>> {
        let mut out = Vec::new();
        for dep in deps {
            match dep {
                DependsOn::Resource(resource) => {
                    out.extend(self.resource_targets(module, resource, None)?)
                }
                DependsOn::ModuleCall(call) => {
                    let expanded = self
                        .input
                        .expansion
                        .call(module, call)
                        .with_context(|| {
                            format!("depends_on names undeclared module.{} in {}", call, module)
                        })?;
                    for (k, _) in &expanded.instances {
                        let child = module.child(call, k.clone());
                        out.push(NodeKey::Module(child.clone(), Boundary::Outputs));
                        out.extend(
                            self.input
                                .expansion
                                .resource_instances()
                                .filter(|(addr, _)| child.contains(&addr.module))
                                .map(|(addr, _)| NodeKey::Resource(addr)),
                        );
                    }
                }
            }
        }
        Ok(out)
    }

    /// Edges from expressions and `depends_on` of resources and module
    /// boundaries.
    fn add_reference_edges(&mut self) -> Result<()> {
        let mut edges = Vec::new();
        for (key, node) in &self.nodes {
            match node {
                Node::Resource(ResourceNode {
                    addr,
                    desired: Some(desired),
                    ..
                }) => {
                    let context = || format!("in {}", addr);
                    let mut targets = self
                        .expr_targets(&addr.module, [&desired.config.config])
                        .with_context(context)?;
                    let deps = desired.config.depends_on().with_context(context)?;
                    targets.extend(
                        self.depends_on_targets(&addr.module, &deps)
                            .with_context(context)?,
                    );
                    edges.extend(targets.into_iter().map(|t| (key.clone(), t)));
                }
                Node::Module(module) => {
                    let context = || format!("in {}", key);
                    let mut targets = self
                        .expr_targets(&module.scope_module, module.exprs.values())
                        .with_context(context)?;
                    if module.boundary == Boundary::Inputs {
                        if let Some((parent, step)) = module.path.parent() {
                            let call = self
                                .module_config(&parent)?
                                .module_call(&step.name)
                                .with_context(context)?;
                            let deps = call.depends_on().with_context(context)?;
                            if !deps.is_empty() {
                                targets.extend(
                                    self.depends_on_targets(&parent, &deps)
                                        .with_context(context)?,
                                );
                                // Everything inside waits for the module's dependencies.
                                for inner in self.nodes.keys() {
                                    if let NodeKey::Resource(r) = inner {
                                        if module.path.contains(&r.module) {
                                            edges.push((inner.clone(), key.clone()));
                                        }
                                    }
                                }
                            }
                        }
                    }
                    edges.extend(targets.into_iter().map(|t| (key.clone(), t)));
                }
                _ => {}
            }
        }
        for (dependent, dependency) in edges {
            self.graph.add_edge(dependent, dependency);
        }
        Ok(())
    }

    /// Provider nodes for every provider a resource uses, and the edges to
    /// them. In destroy mode the provider configuration is evaluated from
    /// prior state, so it gets no reference edges.
    fn add_providers(&mut self, mode: GraphMode) -> Result<()> {
        let used: BTreeSet<(NodeKey, ProviderConfigAddr)> = self
            .nodes
            .iter()
            .filter_map(|(key, node)| match node {
                Node::Resource(r) => Some((key.clone(), r.provider.clone())),
                _ => None,
            })
            .collect();
        for (resource, provider) in used {
            let key = NodeKey::Provider(provider.clone());
            if !self.nodes.contains_key(&key) {
                let config = self
                    .input
                    .config
                    .module(&provider.module)
                    .and_then(|m| m.provider(&provider.type_, provider.alias.as_deref()))
                    .map(|block| block.config.clone());
                if mode == GraphMode::Normal {
                    if let Some(config) = &config {
                        let targets = self
                            .expr_targets(&provider.module, [config])
                            .with_context(|| format!("in {}", provider))?;
                        for target in targets {
                            self.graph.add_edge(key.clone(), target);
                        }
                    }
                }
                self.add_node(
                    key.clone(),
                    Node::Provider(ProviderNode {
                        addr: provider,
                        config,
                    }),
                );
            }
            self.graph.add_edge(resource, key);
        }
        Ok(())
    }

    fn instances_of(&self, resource: &AbsResourceAddr) -> Vec<NodeKey> {
        self.nodes
            .keys()
            .filter(|k| matches!(k, NodeKey::Resource(addr) if &addr.abs_resource() == resource))
            .cloned()
            .collect()
    }

    fn is_orphan(&self, key: &NodeKey) -> bool {
        matches!(self.nodes.get(key), Some(Node::Resource(r)) if r.desired.is_none())
    }

    /// Objects only known from state are ordered by the dependencies
    /// recorded for them, turned around: a deleted object goes before what
    /// it depended on, and after whatever still depended on it.
    fn add_orphan_edges(&mut self) {
        let mut edges = Vec::new();
        for (key, node) in &self.nodes {
            let Node::Resource(r) = node else { continue };
            let Some(prior) = &r.prior else { continue };
            for dep in &prior.dependencies {
                for target in self.instances_of(dep) {
                    // Siblings of the same resource may be recorded; the
                    // object itself is not a dependency.
                    if &target == key {
                        continue;
                    }
                    if r.desired.is_none() || self.is_orphan(&target) {
                        edges.push((target, key.clone()));
                    }
                }
            }
        }
        for (dependent, dependency) in edges {
            self.graph.add_edge(dependent, dependency);
        }
    }

    /// Resources each configured resource depends on, following edges
    /// through module boundaries.
    fn collect_dependencies(&mut self) {
        let mut found = BTreeMap::new();
        for (key, node) in &self.nodes {
            let Node::Resource(r) = node else { continue };
            if r.desired.is_none() {
                continue;
            }
            let mut deps = BTreeSet::new();
            let mut seen = BTreeSet::new();
            let mut stack: Vec<&NodeKey> = self.graph.dependencies(key).collect();
            while let Some(next) = stack.pop() {
                if !seen.insert(next) {
                    continue;
                }
                match next {
                    NodeKey::Resource(addr) => {
                        if !self.is_orphan(next) {
                            deps.insert(addr.abs_resource());
                        }
                    }
                    NodeKey::Module(..) => stack.extend(self.graph.dependencies(next)),
                    NodeKey::Provider(_) => {}
                }
            }
            found.insert(key.clone(), deps);
        }
        for (key, deps) in found {
            if let Some(Node::Resource(r)) = self.nodes.get_mut(&key) {
                r.dependencies = deps;
            }
        }
    }

    /// Turn the normal graph into one that deletes every object in state.
    /// Resource edges are the normal ones reversed, plus those recorded in
    /// state; providers keep their direction.
    fn into_destroy(self) -> Result<(Graph<NodeKey>, BTreeMap<NodeKey, Node>)> {
        let mut graph = Graph::new();
        let mut nodes = BTreeMap::new();
        for (addr, object) in &self.input.prior.resources {
            let key = NodeKey::Resource(addr.clone());
            let mut dependencies = object.dependencies.clone();
            if let Some(Node::Resource(r)) = self.nodes.get(&key) {
                dependencies.extend(r.dependencies.iter().cloned());
            }
            graph.add_node(key.clone());
            nodes.insert(
                key,
                Node::Resource(ResourceNode {
                    addr: addr.clone(),
                    provider: object.provider.clone(),
                    desired: None,
                    prior: Some(object.clone()),
                    dependencies,
                }),
            );
        }
        let mut edges = Vec::new();
        let mut providers = BTreeMap::new();
        for (key, node) in &nodes {
            let Node::Resource(r) = node else { continue };
            for dep in &r.dependencies {
                for (target, _) in self.input.prior.instances_of(dep) {
                    if target != &r.addr {
                        edges.push((NodeKey::Resource(target.clone()), key.clone()));
                    }
                }
            }
            let provider = NodeKey::Provider(r.provider.clone());
            if !providers.contains_key(&provider) {
                let node = match self.nodes.get(&provider) {
                    Some(node) => node.clone(),
                    None => Node::Provider(ProviderNode {
                        addr: r.provider.clone(),
                        config: self
                            .input
                            .config
                            .module(&r.provider.module)
                            .and_then(|m| {
                                m.provider(&r.provider.type_, r.provider.alias.as_deref())
                            })
                            .map(|block| block.config.clone()),
                    }),
                };
                providers.insert(provider.clone(), node);
            }
            edges.push((key.clone(), provider));
        }
        nodes.extend(providers);
        for (dependent, dependency) in edges {
            graph.add_edge(dependent, dependency);
        }
        Ok((graph, nodes))
    }
}
