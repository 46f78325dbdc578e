//! Executing a [`Plan`] and installing the resulting state.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use terrane_core::{
    addr::ResourceInstanceAddr,
    diagnostics::{Diagnostic, Diagnostics},
    value::Value,
};
use terrane_provider::{framework::ResourceProvider, registry::ProviderRegistry, schema::v0};
use terrane_state::{
    diff::{diff, StateChange},
    snapshot::{ObjectStatus, ResourceInstanceObject, StateSnapshot},
    store::StateStore,
};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument as _};

use crate::{
    config::Configuration,
    eval::{
        configure_provider, evaluate_module, failure_diagnostics, is_unknown_error,
        upstream_provider, NodeScope, NodeValue, Outcomes, ResourceOutcome,
    },
    expand::{root_variables, Expansion},
    expr::{evaluate, EvalPhase},
    graph::{
        builder::{build, BuildInput, ExecGraph, GraphMode, Node, NodeKey, ResourceNode},
        walk::{walk, NodeWork, Outcome, WalkOptions},
    },
    plan::{
        diff::{decide_action, ActionInput},
        planner::{provider_plan, root_outputs},
        Action, Plan, PlanMode, PlannedChange, ReplaceOrder,
    },
};

#[derive(Debug)]
pub struct ApplyResult {
    /// The installed snapshot. Also installed when some nodes failed.
    pub state: Arc<StateSnapshot>,
    /// Every node was applied: none was deferred, canceled or failed.
    pub complete: bool,
    /// What changed in state, in address order.
    pub changes: Vec<StateChange>,
    pub deferred: Vec<(ResourceInstanceAddr, String)>,
    pub diagnostics: Diagnostics,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        !self.diagnostics.has_errors()
    }
}

struct ApplyWork {
    graph: Arc<ExecGraph>,
    changes: BTreeMap<ResourceInstanceAddr, PlannedChange>,
    expansion: Expansion,
    variables: BTreeMap<String, Value>,
    prior: Arc<StateSnapshot>,
    registry: ProviderRegistry,
    mode: PlanMode,
    /// Accumulates the result of every node. Only touched to merge.
    working: Mutex<StateSnapshot>,
}

impl ApplyWork {
    fn phase(&self) -> EvalPhase {
        match self.mode {
            PlanMode::Destroy => EvalPhase::Destroy,
            PlanMode::Normal | PlanMode::RefreshOnly => EvalPhase::Apply,
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

    fn object(
        &self,
        node: &ResourceNode,
        value: Value,
        status: ObjectStatus,
    ) -> ResourceInstanceObject {
        ResourceInstanceObject {
            provider: node.provider.clone(),
            schema_version: 0,
            value,
            dependencies: node.dependencies.clone(),
            status,
            create_before_destroy: node
                .desired
                .as_ref()
                .map(|d| d.config.lifecycle.create_before_destroy)
                .unwrap_or(false),
            deposed: None,
        }
    }

    /// Record `value` as the object of `node`, keeping a deposed object that
    /// has not been destroyed yet.
    async fn store(&self, node: &ResourceNode, value: Value, status: ObjectStatus) {
        let mut working = self.working.lock().await;
        let deposed = working.get(&node.addr).and_then(|o| o.deposed.clone());
        working.insert(
            node.addr.clone(),
            ResourceInstanceObject {
                deposed,
                ..self.object(node, value, status)
            },
        );
    }

    async fn set_deposed(&self, addr: &ResourceInstanceAddr, deposed: Option<Value>) {
        if let Some(object) = self.working.lock().await.resources.get_mut(addr) {
            object.deposed = deposed;
        }
    }

    async fn forget(&self, addr: &ResourceInstanceAddr) {
        self.working.lock().await.remove(addr);
    }

    /// The configuration of `node`, evaluated now that its dependencies are
    /// applied. `None` if it still depends on something unknown.
    fn desired_value(&self, node: &ResourceNode, upstream: &Outcomes) -> Result<Option<Value>> {
        let Some(desired) = &node.desired else {
            bail!("{} has no configuration", node.addr);
        };
        match evaluate(
            &desired.config.config,
            &node.addr.module,
            &desired.repetition,
            &self.scope(upstream),
            EvalPhase::Apply,
        ) {
            Ok(value) => Ok(Some(value)),
            Err(e) if is_unknown_error(&e) => Ok(None),
            Err(e) => Err(e.context(format!("evaluating configuration of {}", node.addr))),
        }
    }

    async fn apply_resource(
        &self,
        node: &ResourceNode,
        upstream: &Outcomes,
    ) -> Result<Outcome<NodeValue>> {
        let Some(change) = self.changes.get(&node.addr) else {
            // Planned as nothing at all, e.g. an unconfigured data source
            // without state.
            let value = node.prior.as_ref().map(|o| o.value.clone()).unwrap_or_default();
            return Ok(complete(value, None));
        };
        let provider = upstream_provider(upstream, &NodeKey::Provider(node.provider.clone()))?;

        if let Some(deposed) = &change.deposed {
            self.destroy_object(node, &*provider, deposed.clone(), "deposed")
                .await?;
            self.set_deposed(&node.addr, None).await;
        }

        match change.action {
            Action::NoOp => {
                match &change.after {
                    // Refreshed values are kept.
                    Some(after) => {
                        let mut working = self.working.lock().await;
                        if let Some(object) = working.resources.get_mut(&node.addr) {
                            object.value = after.clone();
                        }
                    }
                    None => self.forget(&node.addr).await,
                }
                Ok(complete(change.after.clone().unwrap_or_default(), Some(change)))
            }
            Action::Read => self.read_data(node, &*provider, change, upstream).await,
            Action::Delete => {
                if !node.addr.is_data() {
                    self.delete(node, &*provider, change).await?;
                }
                self.forget(&node.addr).await;
                Ok(complete(Value::Null, Some(change)))
            }
            Action::Create | Action::Update | Action::Replace => {
                self.apply_managed(node, &*provider, change, upstream).await
            }
        }
    }

    async fn read_data(
        &self,
        node: &ResourceNode,
        provider: &dyn ResourceProvider,
        change: &PlannedChange,
        upstream: &Outcomes,
    ) -> Result<Outcome<NodeValue>> {
        let value = match (&change.after, change.complete) {
            (Some(after), true) => after.clone(),
            _ => {
                let Some(config) = self.desired_value(node, upstream)? else {
                    return Ok(Outcome::Deferred(format!(
                        "configuration of {} is not known yet",
                        node.addr
                    )));
                };
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
                match response.value {
                    Some(v) => v,
                    None => bail!("data source {} returned no object", node.addr),
                }
            }
        };
        self.store(node, value.clone(), ObjectStatus::Ready).await;
        Ok(complete(value, Some(change)))
    }

    async fn delete(
        &self,
        node: &ResourceNode,
        provider: &dyn ResourceProvider,
        change: &PlannedChange,
    ) -> Result<()> {
        let Some(prior) = change.before.clone() else {
            return Ok(());
        };
        info!(addr = %node.addr, "deleting");
        let diagnostics = provider
            .delete(v0::DeleteRequest {
                type_: node.addr.resource.type_.clone(),
                prior,
            })
            .await
            .with_context(|| format!("deleting {}", node.addr))?;
        if diagnostics.has_errors() {
            return Err(diagnostics.into());
        }
        self.forget(&node.addr).await;
        Ok(())
    }

    async fn create(
        &self,
        node: &ResourceNode,
        provider: &dyn ResourceProvider,
        planned: Value,
    ) -> Result<Value> {
        let response = request_create(node, provider, planned).await?;
        self.merge_response(node, response, ObjectStatus::Tainted).await
    }

    /// Record what a create or update returned. A value that comes with
    /// errors is stored with `on_error` status before the errors are
    /// returned.
    async fn merge_response(
        &self,
        node: &ResourceNode,
        response: v0::ApplyResponse,
        on_error: ObjectStatus,
    ) -> Result<Value> {
        if let Some(value) = &response.new_value {
            if value.contains_unknown() {
                bail!("provider returned unknown values for {}", node.addr);
            }
        }
        match (response.new_value, response.diagnostics.has_errors()) {
            (Some(value), false) => {
                self.store(node, value.clone(), ObjectStatus::Ready).await;
                Ok(value)
            }
            (None, false) => bail!("provider returned no object for {}", node.addr),
            (Some(partial), true) => {
                warn!(addr = %node.addr, "keeping partial object");
                self.store(node, partial, on_error).await;
                Err(response.diagnostics.into())
            }
            (None, true) => Err(response.diagnostics.into()),
        }
    }

    /// The final action for a change whose planned value was not known in
    /// full, planned again with the values now available.
    async fn final_plan(
        &self,
        node: &ResourceNode,
        provider: &dyn ResourceProvider,
        change: &PlannedChange,
        upstream: &Outcomes,
    ) -> Result<Option<(Action, Value)>> {
        if change.complete {
            let after = change.after.clone().unwrap_or_default();
            return Ok(Some((change.action, after)));
        }
        let Some(desired) = self.desired_value(node, upstream)? else {
            return Ok(None);
        };
        let tainted = node
            .prior
            .as_ref()
            .map(|o| o.status == ObjectStatus::Tainted)
            .unwrap_or(false);
        let planned = provider_plan(
            provider,
            &node.addr,
            if tainted { None } else { change.before.clone() },
            desired,
        )
        .await?;
        let decision = decide_action(&ActionInput {
            mode: self.mode,
            prior: change.before.as_ref(),
            planned: Some(&planned.value),
            requires_replace: &planned.requires_replace,
            tainted,
            create_before_destroy: false,
        });
        let action = match (change.action, decision.action) {
            (was, now) if was == now => was,
            (Action::Update, Action::NoOp) => Action::NoOp,
            (Action::Replace, Action::Update | Action::NoOp) => Action::Replace,
            (was, now) => bail!(
                "inconsistent final plan for {}: planned {:?}, but the known values now require {:?}",
                node.addr,
                was,
                now
            ),
        };
        Ok(Some((action, planned.value)))
    }

    async fn apply_managed(
        &self,
        node: &ResourceNode,
        provider: &dyn ResourceProvider,
        change: &PlannedChange,
        upstream: &Outcomes,
    ) -> Result<Outcome<NodeValue>> {
        let Some((action, planned)) = self.final_plan(node, provider, change, upstream).await?
        else {
            return Ok(Outcome::Deferred(format!(
                "configuration of {} is not known yet",
                node.addr
            )));
        };
        let value = match action {
            Action::NoOp => change.before.clone().unwrap_or_default(),
            Action::Create => self.create(node, provider, planned).await?,
            Action::Update => {
                info!(addr = %node.addr, "updating");
                let response = provider
                    .update(v0::UpdateRequest {
                        type_: node.addr.resource.type_.clone(),
                        prior: change.before.clone().unwrap_or_default(),
                        planned,
                    })
                    .await
                    .with_context(|| format!("updating {}", node.addr))?;
                self.merge_response(node, response, ObjectStatus::Ready).await?
            }
            Action::Replace => match change.replace_order.unwrap_or_default() {
                ReplaceOrder::DeleteThenCreate => {
                    self.delete(node, provider, change).await?;
                    self.create(node, provider, planned).await?
                }
                ReplaceOrder::CreateThenDelete => {
                    let previous = self.working.lock().await.get(&node.addr).cloned();
                    let response = request_create(node, provider, planned).await;
                    // A known object that comes with errors is stored as tainted.
                    let partial = matches!(
                        &response,
                        Ok(r) if r.new_value.as_ref().is_some_and(Value::is_wholly_known)
                    );
                    let created = match response {
                        Ok(response) => {
                            self.merge_response(node, response, ObjectStatus::Tainted)
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    let created = match created {
                        Ok(value) => value,
                        Err(e) => {
                            match previous {
                                Some(previous) if partial => {
                                    warn!(addr = %node.addr, "keeping the old object as deposed");
                                    self.set_deposed(&node.addr, Some(previous.value)).await;
                                }
                                // Nothing was created; the old object is still current.
                                Some(previous) => {
                                    self.working.lock().await.insert(node.addr.clone(), previous);
                                }
                                None => {}
                            }
                            return Err(e);
                        }
                    };
                    if let Some(before) = change.before.clone() {
                        let deleted = self
                            .destroy_object(node, provider, before.clone(), "replaced")
                            .await;
                        if let Err(e) = deleted {
                            warn!(addr = %node.addr, "keeping the replaced object as deposed");
                            self.set_deposed(&node.addr, Some(before)).await;
                            return Err(e);
                        }
                    }
                    created
                }
            },
            Action::Delete | Action::Read => {
                bail!("{:?} is not a change to a managed object", action)
            }
        };
        Ok(complete(value, Some(change)))
    }

    /// Delete an object that is no longer the current object of `node`,
    /// leaving state alone.
    async fn destroy_object(
        &self,
        node: &ResourceNode,
        provider: &dyn ResourceProvider,
        prior: Value,
        which: &str,
    ) -> Result<()> {
        info!(addr = %node.addr, which, "deleting superseded object");
        let diagnostics = provider
            .delete(v0::DeleteRequest {
                type_: node.addr.resource.type_.clone(),
                prior,
            })
            .await
            .with_context(|| format!("deleting {} object of {}", which, node.addr))?;
        if diagnostics.has_errors() {
            return Err(diagnostics.into());
        }
        Ok(())
    }
}

async fn request_create(
    node: &ResourceNode,
    provider: &dyn ResourceProvider,
    planned: Value,
) -> Result<v0::ApplyResponse> {
    info!(addr = %node.addr, "creating");
    provider
        .create(v0::CreateRequest {
            type_: node.addr.resource.type_.clone(),
            planned,
        })
        .await
        .with_context(|| format!("creating {}", node.addr))
}

fn complete(value: Value, change: Option<&PlannedChange>) -> Outcome<NodeValue> {
    Outcome::Complete(NodeValue::Resource(ResourceOutcome {
        value,
        change: change.cloned(),
        ..Default::default()
    }))
}

#[async_trait]
impl NodeWork for ApplyWork {
    type Key = NodeKey;
    type Output = NodeValue;

    async fn evaluate(&self, key: &NodeKey, upstream: &Outcomes) -> Result<Outcome<NodeValue>> {
        match self.graph.nodes.get(key) {
            Some(Node::Provider(p)) => {
                configure_provider(p, &self.registry, &self.scope(upstream)).await
            }
            Some(Node::Module(m)) => evaluate_module(m, &self.scope(upstream)),
            Some(Node::Resource(r)) => self.apply_resource(r, upstream).await,
            None => bail!("no node {}", key),
        }
    }
}

/// Carry out `plan` and install the resulting state in `store`.
///
/// The plan must have been computed against the state currently in the
/// store. Node failures do not stop the rest of the apply; the state is
/// installed with everything that did succeed.
pub async fn apply(
    plan: &Plan,
    config: &Configuration,
    store: &StateStore,
    registry: &ProviderRegistry,
    walk_options: &WalkOptions,
) -> Result<ApplyResult> {
    let span = info_span!("apply", mode = ?plan.mode);
    async move {
        if plan.diagnostics.has_errors() {
            bail!("refusing to apply a plan that has errors");
        }
        let mut writer = store.writer().await;
        let current = writer.current();
        if current.resources != plan.prior_state.resources {
            bail!("state has changed since the plan was created; plan again");
        }

        let variables = root_variables(config, &plan.variables)
            .context("the plan's variables do not fit the configuration")?;
        let expansion = Expansion::expand(config, &variables)?;
        let graph_mode = match plan.mode {
            PlanMode::Destroy => GraphMode::Destroy,
            PlanMode::Normal | PlanMode::RefreshOnly => GraphMode::Normal,
        };
        let graph = Arc::new(build(
            &BuildInput {
                config,
                expansion: &expansion,
                prior: &current,
                registry,
            },
            graph_mode,
        )?);
        for change in &plan.changes {
            if graph.resource(&change.addr).is_none() {
                bail!(
                    "the plan changes {}, which the configuration does not know",
                    change.addr
                );
            }
        }

        let work = Arc::new(ApplyWork {
            graph: graph.clone(),
            changes: plan
                .changes
                .iter()
                .map(|c| (c.addr.clone(), c.clone()))
                .collect(),
            expansion,
            variables,
            prior: current.clone(),
            registry: registry.clone(),
            mode: plan.mode,
            working: Mutex::new((*current).clone()),
        });
        let outcomes = walk(work.clone(), &graph.graph, walk_options).await?;

        let mut diagnostics = Diagnostics::new();
        let mut deferred = Vec::new();
        let mut all_complete = true;
        for key in &graph.order {
            match outcomes.get(key) {
                Some(Outcome::Complete(_)) | None => {}
                Some(Outcome::Failed(e)) => {
                    all_complete = false;
                    diagnostics.extend(failure_diagnostics(key, e));
                }
                Some(Outcome::Deferred(reason)) => {
                    all_complete = false;
                    if let NodeKey::Resource(addr) = key {
                        deferred.push((addr.clone(), reason.clone()));
                    }
                }
                Some(Outcome::Canceled) => all_complete = false,
            }
        }
        if walk_options.cancel.is_canceled() {
            diagnostics.push(Diagnostic::error("apply was interrupted"));
        }

        let mut next = work.working.lock().await.clone();
        match plan.mode {
            PlanMode::Destroy => next.outputs.clear(),
            PlanMode::Normal | PlanMode::RefreshOnly => {
                let scope = NodeScope {
                    phase: EvalPhase::Inspect,
                    ..work.scope(&outcomes)
                };
                for (name, value) in root_outputs(config, &scope, EvalPhase::Inspect)? {
                    if value.is_wholly_known() {
                        next.outputs.insert(name, value);
                    }
                }
                next.outputs
                    .retain(|name, _| config.root.outputs.contains_key(name));
            }
        }

        let state = writer.replace(next)?;
        let changes = diff(&current, &state)?;
        info!(
            changed = changes.len(),
            deferred = deferred.len(),
            errors = diagnostics.errors().count(),
            "applied"
        );
        Ok(ApplyResult {
            state,
            complete: all_complete,
            changes,
            deferred,
            diagnostics,
        })
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        plan::planner::{plan, PlanOptions},
        testing::{addr, config_of, object, state_of, thing, MockProvider},
    };
    use serde_json::json;
    use std::{collections::BTreeSet, time::Duration};
    use terrane_core::value::AttrPath;
    use terrane_state::diff::StateChangeKind;
    use tokio::sync::Barrier;

    async fn plan_and_apply(
        config: &Configuration,
        store: &StateStore,
        provider: &Arc<MockProvider>,
        options: PlanOptions,
    ) -> ApplyResult {
        let registry = provider.registry();
        let plan = plan(
            config,
            store.load(),
            &registry,
            &options,
            &WalkOptions::default(),
        )
        .await
        .unwrap();
        apply(&plan, config, store, &registry, &WalkOptions::default())
            .await
            .unwrap()
    }

    fn a_and_b() -> Configuration {
        config_of(vec![
            thing("a", json!({"zone": "z1"})),
            thing("b", json!({"peer": {"$ref": "test_thing.a.id"}})),
        ])
    }

    #[tokio::test]
    async fn apply_then_plan_is_empty() {
        let provider = Arc::new(MockProvider::new());
        let store = StateStore::in_memory(StateSnapshot::new());
        let result = plan_and_apply(&a_and_b(), &store, &provider, PlanOptions::default()).await;
        assert!(result.is_success(), "{}", result.diagnostics);
        assert!(result.complete);
        assert_eq!(provider.calls_of("create"), vec!["a", "b"]);
        let b = result.state.get(&addr("test_thing.b")).unwrap();
        assert_eq!(
            b.value,
            Value::from_json(json!({"id": "id-b", "name": "b", "peer": "id-a"}))
        );
        assert_eq!(
            b.dependencies,
            BTreeSet::from(["test_thing.a".parse().unwrap()])
        );
        assert_eq!(
            result.changes.iter().map(|c| &c.kind).collect::<Vec<_>>(),
            vec![&StateChangeKind::Added, &StateChangeKind::Added]
        );
        assert_eq!(store.load().serial, 1);

        let again = plan(
            &a_and_b(),
            store.load(),
            &provider.registry(),
            &PlanOptions::default(),
            &WalkOptions::default(),
        )
        .await
        .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn failed_create_defers_dependents() {
        let provider = Arc::new(MockProvider::new().failing_create("a", None));
        let prior = state_of(vec![(
            "test_thing.b",
            object(json!({"id": "id-b", "name": "b", "peer": "old"}), &[]),
        )]);
        let store = StateStore::in_memory(prior.clone());
        let result = plan_and_apply(&a_and_b(), &store, &provider, PlanOptions::default()).await;

        assert!(!result.complete);
        assert!(!result.is_success());
        assert!(provider.calls_of("update").is_empty());
        assert_eq!(result.deferred.len(), 1);
        assert_eq!(result.deferred[0].0, addr("test_thing.b"));
        let error = result.diagnostics.errors().next().unwrap();
        assert_eq!(error.summary, "creating a failed");
        assert_eq!(error.address.as_deref(), Some("test_thing.a"));
        assert_eq!(result.state.resources, prior.resources);
        assert!(result.changes.is_empty());
    }

    fn deferred_addrs(result: &ApplyResult) -> Vec<ResourceInstanceAddr> {
        result.deferred.iter().map(|(a, _)| a.clone()).collect()
    }

    fn unknown_region() -> PlanOptions {
        PlanOptions {
            variables: BTreeMap::from([("region".to_string(), Value::Unknown)]),
            ..PlanOptions::default()
        }
    }

    #[tokio::test]
    async fn unknown_provider_configuration_defers_its_resources() {
        let config = Configuration::from_json(json!({"root": {
            "variables": {"region": {}},
            "providers": [{"type": "test", "config": {"region": {"$ref": "var.region"}}}],
            "resources": [
                thing("a", json!({"zone": "z1"})),
                thing("b", json!({"peer": {"$ref": "test_thing.a.id"}})),
            ],
        }}))
        .unwrap();
        let provider = Arc::new(MockProvider::new());
        let store = StateStore::in_memory(StateSnapshot::new());
        let result = plan_and_apply(&config, &store, &provider, unknown_region()).await;

        assert!(result.is_success(), "{}", result.diagnostics);
        assert!(!result.complete);
        assert_eq!(
            deferred_addrs(&result),
            vec![addr("test_thing.a"), addr("test_thing.b")]
        );
        assert!(provider.calls().is_empty());
        assert!(result.state.resources.is_empty());
    }

    #[tokio::test]
    async fn unknown_inputs_defer_the_resource_and_its_dependents() {
        let config = Configuration::from_json(json!({"root": {
            "variables": {"region": {}},
            "resources": [
                thing("a", json!({"zone": "z1"})),
                thing("b", json!({"zone": {"$ref": "var.region"}})),
                thing("c", json!({"peer": {"$ref": "test_thing.b.id"}})),
            ],
        }}))
        .unwrap();
        let provider = Arc::new(MockProvider::new());
        let store = StateStore::in_memory(StateSnapshot::new());
        let result = plan_and_apply(&config, &store, &provider, unknown_region()).await;

        assert!(result.is_success(), "{}", result.diagnostics);
        assert!(!result.complete);
        assert_eq!(
            deferred_addrs(&result),
            vec![addr("test_thing.b"), addr("test_thing.c")]
        );
        assert_eq!(provider.calls_of("create"), vec!["a"]);
        assert_eq!(
            result.state.resources.keys().cloned().collect::<Vec<_>>(),
            vec![addr("test_thing.a")]
        );
    }

    #[tokio::test]
    async fn partial_objects_are_tainted_and_replaced() {
        let partial = Value::from_json(json!({"id": "id-a", "name": "a", "zone": "z1"}));
        let provider = Arc::new(MockProvider::new().failing_create("a", Some(partial)));
        let store = StateStore::in_memory(StateSnapshot::new());
        let config = config_of(vec![thing("a", json!({"zone": "z1"}))]);
        let result = plan_and_apply(&config, &store, &provider, PlanOptions::default()).await;
        assert!(!result.is_success());
        assert_eq!(
            result.state.get(&addr("test_thing.a")).unwrap().status,
            ObjectStatus::Tainted
        );

        let next = plan(
            &config,
            store.load(),
            &Arc::new(MockProvider::new()).registry(),
            &PlanOptions::default(),
            &WalkOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(next.change(&addr("test_thing.a")).unwrap().action, Action::Replace);
    }

    #[tokio::test]
    async fn independent_creates_run_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let provider = Arc::new(MockProvider::new().with_barrier(barrier));
        let store = StateStore::in_memory(StateSnapshot::new());
        let config = config_of(vec![thing("x", json!({})), thing("y", json!({}))]);
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            plan_and_apply(&config, &store, &provider, PlanOptions::default()),
        )
        .await
        .expect("creates of x and y were serialized");
        assert!(result.is_success());
        assert_eq!(result.state.resources.len(), 2);
    }

    async fn replace_calls(create_before_destroy: bool) -> Vec<String> {
        let provider = Arc::new(MockProvider::new());
        let store = StateStore::in_memory(state_of(vec![(
            "test_thing.a",
            object(json!({"id": "id-a", "name": "a", "zone": "z1"}), &[]),
        )]));
        let mut a = thing("a", json!({"zone": "z2"}));
        a["lifecycle"] = json!({"create_before_destroy": create_before_destroy});
        let result = plan_and_apply(&config_of(vec![a]), &store, &provider, PlanOptions::default()).await;
        assert!(result.is_success(), "{}", result.diagnostics);
        let a = result.state.get(&addr("test_thing.a")).unwrap();
        assert_eq!(a.value.get_path(&"zone".parse().unwrap()), Value::from("z2"));
        assert_eq!(a.create_before_destroy, create_before_destroy);
        provider
            .calls()
            .into_iter()
            .filter(|c| !c.starts_with("read"))
            .collect()
    }

    #[tokio::test]
    async fn replace_follows_its_order() {
        assert_eq!(replace_calls(false).await, vec!["delete a", "create a"]);
        assert_eq!(replace_calls(true).await, vec!["create a", "delete a"]);
    }

    #[tokio::test]
    async fn partial_create_before_destroy_keeps_both_objects() {
        let partial = json!({"id": "id-a-new", "name": "a", "zone": "z2"});
        let provider = Arc::new(
            MockProvider::new().failing_create("a", Some(Value::from_json(partial.clone()))),
        );
        let old = json!({"id": "id-a", "name": "a", "zone": "z1"});
        let store = StateStore::in_memory(state_of(vec![("test_thing.a", object(old.clone(), &[]))]));
        let mut a = thing("a", json!({"zone": "z2"}));
        a["lifecycle"] = json!({"create_before_destroy": true});
        let config = config_of(vec![a]);

        let result = plan_and_apply(&config, &store, &provider, PlanOptions::default()).await;
        assert!(!result.is_success());
        assert!(provider.calls_of("delete").is_empty());
        let a = result.state.get(&addr("test_thing.a")).unwrap();
        assert_eq!(a.value, Value::from_json(partial));
        assert_eq!(a.status, ObjectStatus::Tainted);
        assert_eq!(a.deposed, Some(Value::from_json(old)));

        let next = plan(
            &config,
            store.load(),
            &Arc::new(MockProvider::new()).registry(),
            &PlanOptions::default(),
            &WalkOptions::default(),
        )
        .await
        .unwrap();
        let change = next.change(&addr("test_thing.a")).unwrap();
        assert_eq!(change.action, Action::Replace);
        assert!(change.deposed.is_some());
    }

    #[tokio::test]
    async fn failed_create_before_destroy_without_object_keeps_the_old_one() {
        let provider = Arc::new(MockProvider::new().failing_create("a", None));
        let old = json!({"id": "id-a", "name": "a", "zone": "z1"});
        let store = StateStore::in_memory(state_of(vec![("test_thing.a", object(old.clone(), &[]))]));
        let mut a = thing("a", json!({"zone": "z2"}));
        a["lifecycle"] = json!({"create_before_destroy": true});

        let result = plan_and_apply(&config_of(vec![a]), &store, &provider, PlanOptions::default()).await;
        assert!(!result.is_success());
        let a = result.state.get(&addr("test_thing.a")).unwrap();
        assert_eq!(a.value, Value::from_json(old));
        assert_eq!(a.status, ObjectStatus::Ready);
        assert_eq!(a.deposed, None);
    }

    #[tokio::test]
    async fn undeleted_replaced_objects_are_destroyed_next_time() {
        let provider = Arc::new(MockProvider::new());
        provider.set_failing_delete("id-a", true);
        let old = json!({"id": "id-a", "name": "a", "zone": "z1"});
        let store = StateStore::in_memory(state_of(vec![("test_thing.a", object(old.clone(), &[]))]));
        let mut a = thing("a", json!({"zone": "z2"}));
        a["lifecycle"] = json!({"create_before_destroy": true});
        let config = config_of(vec![a]);

        let result = plan_and_apply(&config, &store, &provider, PlanOptions::default()).await;
        assert!(!result.is_success());
        let a = result.state.get(&addr("test_thing.a")).unwrap();
        assert_eq!(a.value.get_path(&AttrPath::attr("zone")), Value::from("z2"));
        assert_eq!(a.deposed, Some(Value::from_json(old)));

        provider.set_failing_delete("id-a", false);
        let result = plan_and_apply(&config, &store, &provider, PlanOptions::default()).await;
        assert!(result.is_success(), "{}", result.diagnostics);
        assert_eq!(result.state.get(&addr("test_thing.a")).unwrap().deposed, None);
        assert_eq!(provider.calls_of("create"), vec!["a"]);
        assert_eq!(provider.calls_of("delete"), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn destroy_removes_everything_in_reverse() {
        let provider = Arc::new(MockProvider::new());
        let store = StateStore::in_memory(StateSnapshot::new());
        plan_and_apply(&a_and_b(), &store, &provider, PlanOptions::default()).await;
        let destroy = PlanOptions {
            mode: PlanMode::Destroy,
            ..Default::default()
        };
        let result = plan_and_apply(&a_and_b(), &store, &provider, destroy).await;
        assert!(result.is_success(), "{}", result.diagnostics);
        assert!(result.state.resources.is_empty());
        assert_eq!(provider.calls_of("delete"), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn stale_plans_are_refused() {
        let provider = Arc::new(MockProvider::new());
        let registry = provider.registry();
        let store = StateStore::in_memory(StateSnapshot::new());
        let config = a_and_b();
        let stale = plan(
            &config,
            store.load(),
            &registry,
            &PlanOptions::default(),
            &WalkOptions::default(),
        )
        .await
        .unwrap();
        plan_and_apply(&config, &store, &provider, PlanOptions::default()).await;

        let err = apply(&stale, &config, &store, &registry, &WalkOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("state has changed"));
        assert_eq!(provider.calls_of("create"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn outputs_are_recorded() {
        let provider = Arc::new(MockProvider::new());
        let store = StateStore::in_memory(StateSnapshot::new());
        let config = Configuration::from_json(json!({"root": {
            "resources": [thing("a", json!({}))],
            "outputs": {"id": {"$ref": "test_thing.a.id"}}
        }}))
        .unwrap();
        let result = plan_and_apply(&config, &store, &provider, PlanOptions::default()).await;
        assert_eq!(result.state.outputs["id"], Value::from("id-a"));
    }

    #[tokio::test]
    async fn canceled_apply_starts_nothing() {
        let provider = Arc::new(MockProvider::new());
        let registry = provider.registry();
        let store = StateStore::in_memory(StateSnapshot::new());
        let config = a_and_b();
        let plan = plan(
            &config,
            store.load(),
            &registry,
            &PlanOptions::default(),
            &WalkOptions::default(),
        )
        .await
        .unwrap();
        let options = WalkOptions::default();
        options.cancel.cancel();
        let result = apply(&plan, &config, &store, &registry, &options)
            .await
            .unwrap();
        assert!(!result.complete);
        assert!(result.diagnostics.has_errors());
        assert!(provider.calls_of("create").is_empty());
        assert!(result.state.resources.is_empty());
    }
}
