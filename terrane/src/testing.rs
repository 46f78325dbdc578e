//! Test doubles and builders shared by the engine tests.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};
use terrane_core::{
    addr::{ModulePath, ProviderConfigAddr, ResourceInstanceAddr},
    diagnostics::{Diagnostic, Diagnostics},
    value::{PathStep, Value},
};
use terrane_provider::{
    framework::{ResourceProvider, SimpleSchema},
    registry::ProviderRegistry,
    schema::v0,
};
use terrane_state::snapshot::{ObjectStatus, ResourceInstanceObject, StateSnapshot};
use tokio::sync::Barrier;

use crate::config::Configuration;

pub const PROVIDER: &str = "test";
pub const THING: &str = "test_thing";

/// A provider for `test_*` resources that records its calls.
///
/// Objects are identified by their `name` attribute. `id` is computed on
/// create as `id-<name>`; changing `zone` requires replacement.
pub struct MockProvider {
    schema: SimpleSchema,
    calls: Mutex<Vec<String>>,
    /// Creates of these names fail, optionally leaving a partial object.
    fail_create: BTreeMap<String, Option<Value>>,
    /// Every create waits here first.
    barrier: Option<Arc<Barrier>>,
    /// What reads return instead of the recorded value; `None` is gone.
    drift: Mutex<BTreeMap<String, Option<Value>>>,
    /// Deletes of objects with these ids fail.
    fail_delete: Mutex<BTreeSet<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        MockProvider {
            schema: SimpleSchema::new(&["id"], &["zone"]),
            calls: Mutex::new(Vec::new()),
            fail_create: BTreeMap::new(),
            barrier: None,
            drift: Mutex::new(BTreeMap::new()),
            fail_delete: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn failing_create(mut self, name: &str, partial: Option<Value>) -> Self {
        self.fail_create.insert(name.to_string(), partial);
        self
    }

    pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn set_drift(&self, name: &str, value: Option<Value>) {
        self.drift.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn set_failing_delete(&self, id: &str, failing: bool) {
        let mut fail_delete = self.fail_delete.lock().unwrap();
        if failing {
            fail_delete.insert(id.to_string());
        } else {
            fail_delete.remove(id);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls of one kind, e.g. `"create"`, in the order they happened.
    pub fn calls_of(&self, kind: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&format!("{} ", kind)).map(str::to_string))
            .collect()
    }

    pub fn registry(self: &Arc<Self>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register_instance(PROVIDER, self.clone());
        registry
    }

    fn record(&self, kind: &str, value: &Value) -> String {
        let name = name_of(value);
        self.calls.lock().unwrap().push(format!("{} {}", kind, name));
        name
    }
}

fn name_of(value: &Value) -> String {
    value
        .get(&PathStep::Attr("name".to_string()))
        .as_str()
        .unwrap_or("?")
        .to_string()
}

/// Fill in computed attributes the way a real provider would.
fn realize(name: &str, planned: &Value) -> Value {
    match planned {
        Value::Map(m) => Value::Map(
            m.iter()
                .map(|(k, v)| {
                    let v = if v.is_known() {
                        v.clone()
                    } else {
                        Value::from(format!("{}-{}", k, name))
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

#[async_trait]
impl ResourceProvider for MockProvider {
    async fn plan_diff(&self, request: v0::PlanDiffRequest) -> Result<v0::PlanDiffResponse> {
        Ok(self.schema.plan(&request))
    }

    async fn create(&self, request: v0::CreateRequest) -> Result<v0::ApplyResponse> {
        let name = self.record("create", &request.planned);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if let Some(partial) = self.fail_create.get(&name) {
            return Ok(v0::ApplyResponse {
                new_value: partial.clone(),
                diagnostics: Diagnostic::error(format!("creating {} failed", name)).into(),
            });
        }
        Ok(v0::ApplyResponse::ok(realize(&name, &request.planned)))
    }

    async fn read(&self, request: v0::ReadRequest) -> Result<v0::ReadResponse> {
        let name = self.record("read", &request.current);
        let value = match self.drift.lock().unwrap().get(&name) {
            Some(drifted) => drifted.clone(),
            None => Some(realize(&name, &request.current)),
        };
        Ok(v0::ReadResponse {
            value,
            diagnostics: Diagnostics::new(),
        })
    }

    async fn update(&self, request: v0::UpdateRequest) -> Result<v0::ApplyResponse> {
        let name = self.record("update", &request.planned);
        Ok(v0::ApplyResponse::ok(realize(&name, &request.planned)))
    }

    async fn delete(&self, request: v0::DeleteRequest) -> Result<Diagnostics> {
        let name = self.record("delete", &request.prior);
        let id = request.prior.get(&PathStep::Attr("id".to_string()));
        match id.as_str() {
            Some(id) if self.fail_delete.lock().unwrap().contains(id) => {
                Ok(Diagnostic::error(format!("deleting {} failed", name)).into())
            }
            _ => Ok(Diagnostics::new()),
        }
    }
}

/// A `test_thing` resource block. `config` is merged into `{"name": name}`.
pub fn thing(name: &str, config: serde_json::Value) -> serde_json::Value {
    let mut body = json!({ "name": name });
    if let (Some(body), serde_json::Value::Object(extra)) = (body.as_object_mut(), config) {
        body.extend(extra);
    }
    json!({ "type": THING, "name": name, "config": body })
}

/// A root module with these resource blocks.
pub fn config_of(resources: Vec<serde_json::Value>) -> Configuration {
    Configuration::from_json(json!({ "root": { "resources": resources } })).unwrap()
}

pub fn addr(s: &str) -> ResourceInstanceAddr {
    s.parse().unwrap()
}

/// A recorded object managed by the root `test` provider.
pub fn object(value: serde_json::Value, dependencies: &[&str]) -> ResourceInstanceObject {
    ResourceInstanceObject {
        provider: ProviderConfigAddr::new(ModulePath::root(), PROVIDER, None),
        schema_version: 0,
        value: Value::from_json(value),
        dependencies: dependencies
            .iter()
            .map(|d| d.parse().unwrap())
            .collect::<BTreeSet<_>>(),
        status: ObjectStatus::Ready,
        create_before_destroy: false,
        deposed: None,
    }
}

pub fn state_of(objects: Vec<(&str, ResourceInstanceObject)>) -> StateSnapshot {
    let mut state = StateSnapshot::new();
    for (a, o) in objects {
        state.insert(addr(a), o);
    }
    state
}
