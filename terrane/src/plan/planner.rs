//! Computing a [`Plan`] by walking the graph once, read-only.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use terrane_core::{
    addr::{ModulePath, ResourceInstanceAddr},
    diagnostics::{Diagnostic, Diagnostics},
    value::{AttrPath, Value},
};
use terrane_provider::{framework::ResourceProvider, registry::ProviderRegistry, schema::v0};
use terrane_state::snapshot::{ObjectStatus, StateSnapshot};
use tracing::{info, info_span, Instrument as _};

use super::{
    diff::{decide_action, ActionInput},
    Action, Plan, PlanMode, PlannedChange, ResourceDrift, PLAN_FORMAT_VERSION,
};
use crate::{
    config::{Configuration, Lifecycle},
    eval::{
        configure_provider, evaluate_module, failure_diagnostics, upstream_provider, NodeScope,
        NodeValue, Outcomes, ResourceOutcome,
    },
    expand::{root_variables, Expansion},
    expr::{evaluate, EvalPhase},
    graph::{
        builder::{build, BuildInput, ExecGraph, GraphMode, Node, NodeKey, ResourceNode},
        walk::{walk, NodeWork, Outcome, WalkOptions},
    },
};

#[derive(Clone, Debug)]
pub struct PlanOptions {
    pub mode: PlanMode,
    /// Read every recorded object back before diffing.
    pub refresh: bool,
    pub variables: BTreeMap<String, Value>,
}
impl Default for PlanOptions {
    fn default() -> Self {
        PlanOptions {
            mode: PlanMode::Normal,
            refresh: true,
            variables: BTreeMap::new(),
        }
    }
}

struct PlanWork {
    config: Configuration,
    graph: Arc<ExecGraph>,
    expansion: Expansion,
    variables: BTreeMap<String, Value>,
    prior: Arc<StateSnapshot>,
    registry: ProviderRegistry,
    mode: PlanMode,
    refresh: bool,
}

impl PlanWork {
    fn phase(&self) -> EvalPhase {
        match self.mode {
            PlanMode::Destroy => EvalPhase::Destroy,
            PlanMode::Normal | PlanMode::RefreshOnly => EvalPhase::Plan,
        }
    }

    /// Orphans and destroy-mode nodes carry no desired configuration, but
    /// their block may still be around.
    fn lifecycle(&self, node: &ResourceNode) -> Lifecycle {
        match &node.desired {
            Some(d) => d.config.lifecycle,
            None => self
                .config
                .module(&node.addr.module)
                .and_then(|m| m.resource(&node.addr.resource))
                .map(|r| r.lifecycle)
                .unwrap_or_default(),
        }
    }

    fn scope<'a>(&'a self, upstream: &'a Outcomes) -> NodeScope<'a> {
        NodeScope {
            upstream,
            expansion: &self.expansion,
            variables: &self.variables,
            prior: &self.prior,
            phase: self.phase(),
        }
    }

    async fn plan_resource(
        &self,
        node: &ResourceNode,
        upstream: &Outcomes,
    ) -> Result<Outcome<NodeValue>> {
        let provider = upstream_provider(upstream, &NodeKey::Provider(node.provider.clone()))?;
        let type_ = node.addr.resource.type_.clone();
        let mut warnings = Diagnostics::new();

        let mut prior = node.prior.as_ref().map(|o| o.value.clone());
        let mut drift = None;
        let refresh = self.refresh && self.mode != PlanMode::Destroy && !node.addr.is_data();
        if let (Some(recorded), true) = (&node.prior, refresh) {
            let response = provider
                .read(v0::ReadRequest {
                    type_: type_.clone(),
                    current: recorded.value.clone(),
                })
                .await
                .with_context(|| format!("refreshing {}", node.addr))?;
            if response.diagnostics.has_errors() {
                return Err(response.diagnostics.into());
            }
            warnings.extend(response.diagnostics);
            if response.value.as_ref() != Some(&recorded.value) {
                info!(addr = %node.addr, gone = response.value.is_none(), "drift detected");
                drift = Some(ResourceDrift {
                    addr: node.addr.clone(),
                    before: recorded.value.clone(),
                    after: response.value.clone(),
                });
            }
            prior = response.value;
        }

        let desired = match &node.desired {
            None => None,
            Some(d) => {
                let scope = self.scope(upstream);
                let value = evaluate(
                    &d.config.config,
                    &node.addr.module,
                    &d.repetition,
                    &scope,
                    EvalPhase::Plan,
                )
                .with_context(|| format!("evaluating configuration of {}", node.addr))?;
                Some(value)
            }
        };

        if node.addr.is_data() {
            return self
                .plan_data(node, &*provider, prior, desired, warnings, drift)
                .await;
        }

        let tainted = node
            .prior
            .as_ref()
            .map(|o| o.status == ObjectStatus::Tainted)
            .unwrap_or(false);
        let (planned, requires_replace) = match desired {
            None => (None, Vec::new()),
            Some(value) => {
                let planned = provider_plan(
                    &*provider,
                    &node.addr,
                    if tainted { None } else { prior.clone() },
                    value,
                )
                .await?;
                warnings.extend(planned.warnings);
                (Some(planned.value), planned.requires_replace)
            }
        };

        let lifecycle = self.lifecycle(node);
        let decision = decide_action(&ActionInput {
            mode: self.mode,
            prior: prior.as_ref(),
            planned: planned.as_ref(),
            requires_replace: &requires_replace,
            tainted,
            create_before_destroy: lifecycle.create_before_destroy,
        });
        if lifecycle.prevent_destroy && matches!(decision.action, Action::Delete | Action::Replace)
        {
            return Err(Diagnostics::from(
                Diagnostic::error(format!(
                    "{} has lifecycle.prevent_destroy set, but the plan would destroy it",
                    node.addr
                ))
                .with_address(&node.addr),
            )
            .into());
        }

        let after = match decision.action {
            Action::Delete => None,
            Action::NoOp if self.mode == PlanMode::RefreshOnly => prior.clone(),
            _ => planned,
        };
        let complete = after.as_ref().map(Value::is_wholly_known).unwrap_or(true);
        let change = PlannedChange {
            addr: node.addr.clone(),
            provider: node.provider.clone(),
            action: decision.action,
            replace_order: decision.replace_order,
            before: prior,
            after: after.clone(),
            requires_replace,
            complete,
            dependencies: node.dependencies.clone(),
            deposed: match self.mode {
                PlanMode::RefreshOnly => None,
                PlanMode::Normal | PlanMode::Destroy => {
                    node.prior.as_ref().and_then(|o| o.deposed.clone())
                }
            },
        };
        Ok(Outcome::Complete(NodeValue::Resource(ResourceOutcome {
            value: after.unwrap_or_default(),
            change: Some(change),
            drift,
            warnings,
        })))
    }

    /// Data sources are read while planning if their configuration is known.
    async fn plan_data(
        &self,
        node: &ResourceNode,
        provider: &dyn ResourceProvider,
        prior: Option<Value>,
        desired: Option<Value>,
        mut warnings: Diagnostics,
        drift: Option<ResourceDrift>,
    ) -> Result<Outcome<NodeValue>> {
        let change = |action, after: Option<Value>, complete| PlannedChange {
            addr: node.addr.clone(),
            provider: node.provider.clone(),
            action,
            replace_order: None,
            before: prior.clone(),
            after,
            requires_replace: Vec::new(),
            complete,
            dependencies: node.dependencies.clone(),
            deposed: None,
        };
        let (value, change) = match desired {
            None if prior.is_none() => {
                return Ok(Outcome::Complete(NodeValue::Resource(ResourceOutcome::default())))
            }
            None => (Value::Null, change(Action::Delete, None, true)),
            Some(config) if config.contains_unknown() => {
                (Value::Unknown, change(Action::Read, Some(Value::Unknown), false))
            }
            Some(config) => {
                let response = provider
                    .read(v0::ReadRequest {
                        type_: node.addr.resource.type_.clone(),
                        current: config,
                    })
                    .await
                    .with_context(|| format!("reading {}", node.addr))?;
                if response.diagnostics.has_errors() {
                    return Err(response.diagnostics.into());
                }
                warnings.extend(response.diagnostics);
                let value = match response.value {
                    Some(v) => v,
                    None => bail!("data source {} returned no object", node.addr),
                };
                (value.clone(), change(Action::Read, Some(value), true))
            }
        };
        Ok(Outcome::Complete(NodeValue::Resource(ResourceOutcome {
            value,
            change: Some(change),
            drift,
            warnings,
        })))
    }
}

#[async_trait]
impl NodeWork for PlanWork {
    type Key = NodeKey;
    type Output = NodeValue;

    async fn evaluate(&self, key: &NodeKey, upstream: &Outcomes) -> Result<Outcome<NodeValue>> {
        match self.graph.nodes.get(key) {
            Some(Node::Provider(p)) => {
                configure_provider(p, &self.registry, &self.scope(upstream)).await
            }
            Some(Node::Module(m)) => evaluate_module(m, &self.scope(upstream)),
            Some(Node::Resource(r)) => self.plan_resource(r, upstream).await,
            None => bail!("no node {}", key),
        }
    }
}

pub(crate) struct ProviderPlan {
    pub value: Value,
    pub requires_replace: Vec<AttrPath>,
    pub warnings: Diagnostics,
}

/// Validate `desired` and ask the provider to plan it on top of `prior`.
/// Error diagnostics from either call fail the node.
pub(crate) async fn provider_plan(
    provider: &dyn ResourceProvider,
    addr: &ResourceInstanceAddr,
    prior: Option<Value>,
    desired: Value,
) -> Result<ProviderPlan> {
    let type_ = addr.resource.type_.clone();
    let mut warnings = provider
        .validate(v0::ValidateRequest {
            type_: type_.clone(),
            config: desired.clone(),
        })
        .await
        .with_context(|| format!("validating {}", addr))?;
    if warnings.has_errors() {
        return Err(warnings.into());
    }
    let response = provider
        .plan_diff(v0::PlanDiffRequest {
            type_,
            prior,
            desired,
        })
        .await
        .with_context(|| format!("planning {}", addr))?;
    if response.diagnostics.has_errors() {
        return Err(response.diagnostics.into());
    }
    warnings.extend(response.diagnostics);
    Ok(ProviderPlan {
        value: response.planned,
        requires_replace: response.requires_replace,
        warnings,
    })
}

/// The change to show for a resource that could not be planned yet: the
/// likely action, with nothing known about the result.
fn deferred_change(node: &ResourceNode) -> PlannedChange {
    let action = match (&node.desired, &node.prior) {
        (None, _) => Action::Delete,
        (Some(_), None) => Action::Create,
        (Some(_), Some(_)) => Action::Update,
    };
    PlannedChange {
        addr: node.addr.clone(),
        provider: node.provider.clone(),
        action: if node.addr.is_data() && action != Action::Delete {
            Action::Read
        } else {
            action
        },
        replace_order: None,
        before: node.prior.as_ref().map(|o| o.value.clone()),
        after: (action != Action::Delete).then_some(Value::Unknown),
        requires_replace: Vec::new(),
        complete: false,
        dependencies: node.dependencies.clone(),
        deposed: node.prior.as_ref().and_then(|o| o.deposed.clone()),
    }
}

/// Plan `config` against `prior`.
///
/// Configuration errors are returned as `Err`. Problems with individual
/// nodes end up in [`Plan::diagnostics`].
pub async fn plan(
    config: &Configuration,
    prior: Arc<StateSnapshot>,
    registry: &ProviderRegistry,
    options: &PlanOptions,
    walk_options: &WalkOptions,
) -> Result<Plan> {
    let span = info_span!("plan", mode = ?options.mode);
    async move {
        let variables = root_variables(config, &options.variables)?;
        let expansion = Expansion::expand(config, &variables)?;
        let graph_mode = match options.mode {
            PlanMode::Destroy => GraphMode::Destroy,
            PlanMode::Normal | PlanMode::RefreshOnly => GraphMode::Normal,
        };
        let graph = Arc::new(build(
            &BuildInput {
                config,
                expansion: &expansion,
                prior: &prior,
                registry,
            },
            graph_mode,
        )?);
        let work = Arc::new(PlanWork {
            config: config.clone(),
            graph: graph.clone(),
            expansion,
            variables: variables.clone(),
            prior: prior.clone(),
            registry: registry.clone(),
            mode: options.mode,
            refresh: options.refresh,
        });
        let outcomes = walk(work.clone(), &graph.graph, walk_options).await?;

        let mut changes = Vec::new();
        let mut drift = Vec::new();
        let mut diagnostics = Diagnostics::new();
        let mut complete = true;
        for key in &graph.order {
            let (Some(node), Some(outcome)) = (graph.nodes.get(key), outcomes.get(key)) else {
                continue;
            };
            match (node, outcome) {
                (Node::Resource(_), Outcome::Complete(NodeValue::Resource(r))) => {
                    changes.extend(r.change.clone());
                    drift.extend(r.drift.clone());
                    diagnostics.extend(r.warnings.clone());
                }
                (Node::Resource(r), Outcome::Deferred(reason)) => {
                    info!(addr = %r.addr, reason = %reason, "deferred");
                    complete = false;
                    changes.push(deferred_change(r));
                }
                (_, Outcome::Failed(e)) => {
                    complete = false;
                    diagnostics.extend(failure_diagnostics(key, e));
                }
                (_, Outcome::Canceled) => complete = false,
                (_, Outcome::Deferred(_)) => complete = false,
                _ => {}
            }
        }
        if walk_options.cancel.is_canceled() {
            diagnostics.push(Diagnostic::error("planning was interrupted"));
        }

        let outputs = match options.mode {
            PlanMode::Destroy => BTreeMap::new(),
            PlanMode::Normal | PlanMode::RefreshOnly => {
                root_outputs(config, &work.scope(&outcomes), EvalPhase::Inspect)?
            }
        };

        info!(
            changes = changes.iter().filter(|c| !c.is_noop()).count(),
            complete,
            errors = diagnostics.errors().count(),
            "planned"
        );
        Ok(Plan {
            format_version: PLAN_FORMAT_VERSION,
            mode: options.mode,
            changes,
            drift,
            prior_state: (*prior).clone(),
            variables,
            outputs,
            complete,
            diagnostics,
        })
    }
    .instrument(span)
    .await
}

/// Evaluate the root module outputs against the outcomes of a walk.
pub fn root_outputs(
    config: &Configuration,
    scope: &NodeScope<'_>,
    phase: EvalPhase,
) -> Result<BTreeMap<String, Value>> {
    config
        .root
        .outputs
        .iter()
        .map(|(name, expr)| {
            let value = evaluate(
                expr,
                &ModulePath::root(),
                &Default::default(),
                scope,
                phase,
            )
            .with_context(|| format!("evaluating output {:?}", name))?;
            Ok((name.clone(), value))
        })
        .collect()
}
