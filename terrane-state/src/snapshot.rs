use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
};
use terrane_core::{
    addr::{AbsResourceAddr, AddrFilter, ProviderConfigAddr, ResourceInstanceAddr},
    value::Value,
};

pub const FORMAT_VERSION: u32 = 1;
const STATE_TYPE: &str = "terraneState";

/// A point-in-time record of every tracked resource instance.
///
/// Snapshots are immutable by convention: the engine reads an `Arc` of the
/// current one and builds a new one rather than editing it in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(rename = "_type", deserialize_with = "type_is_terrane_state")]
    type_: String,
    #[serde(deserialize_with = "supported_format_version")]
    pub format_version: u32,
    /// Incremented on every successful replace.
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub resources: BTreeMap<ResourceInstanceAddr, ResourceInstanceObject>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

fn type_is_terrane_state<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s != STATE_TYPE {
        return Err(serde::de::Error::custom(format!(
            "expected _type to be {:?}, got {:?}",
            STATE_TYPE, s
        )));
    }
    Ok(s)
}

fn supported_format_version<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let v = u32::deserialize(deserializer)?;
    if v != FORMAT_VERSION {
        return Err(serde::de::Error::custom(format!(
            "unsupported state format version {} (this version of terrane reads version {})",
            v, FORMAT_VERSION
        )));
    }
    Ok(v)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInstanceObject {
    /// The provider configuration that manages the object. Recorded so that
    /// the object can be destroyed after its configuration is gone.
    pub provider: ProviderConfigAddr,
    #[serde(default)]
    pub schema_version: u64,
    pub value: Value,
    /// Resources this object referred to when it was last applied.
    #[serde(default)]
    pub dependencies: BTreeSet<AbsResourceAddr>,
    #[serde(default)]
    pub status: ObjectStatus,
    #[serde(default)]
    pub create_before_destroy: bool,
    /// The previous object of a create-before-destroy replace whose delete
    /// failed. It is destroyed on the next apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectStatus {
    #[default]
    Ready,
    /// Only partially created; the next plan replaces it.
    Tainted,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        StateSnapshot {
            type_: STATE_TYPE.to_string(),
            format_version: FORMAT_VERSION,
            serial: 0,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &ResourceInstanceAddr) -> Option<&ResourceInstanceObject> {
        self.resources.get(addr)
    }

    pub fn insert(&mut self, addr: ResourceInstanceAddr, object: ResourceInstanceObject) {
        self.resources.insert(addr, object);
    }

    pub fn remove(&mut self, addr: &ResourceInstanceAddr) -> Option<ResourceInstanceObject> {
        self.resources.remove(addr)
    }

    /// Instance addresses in order, optionally restricted by `filter`.
    pub fn list(&self, filter: Option<&AddrFilter>) -> Vec<&ResourceInstanceAddr> {
        self.resources
            .keys()
            .filter(|addr| filter.map(|f| f.matches(addr)).unwrap_or(true))
            .collect()
    }

    /// All instances of one resource block.
    pub fn instances_of<'a>(
        &'a self,
        resource: &'a AbsResourceAddr,
    ) -> impl Iterator<Item = (&'a ResourceInstanceAddr, &'a ResourceInstanceObject)> + 'a {
        self.resources
            .iter()
            .filter(move |(addr, _)| addr.module == resource.module && addr.resource == resource.resource)
    }

    /// Check the invariants every installed snapshot has to satisfy.
    pub fn validate(&self) -> Result<()> {
        for (addr, object) in &self.resources {
            let deposed_unknown = object.deposed.as_ref().is_some_and(Value::contains_unknown);
            if object.value.contains_unknown() || deposed_unknown {
                bail!("state for {} contains an unknown value", addr);
            }
        }
        for (name, value) in &self.outputs {
            if value.contains_unknown() {
                bail!("output {:?} in state is unknown", name);
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).context("serializing state snapshot")
    }

    pub fn from_json(json: serde_json::Value) -> Result<StateSnapshot> {
        serde_json::from_value(json).context("decoding state snapshot")
    }
}

/// Write a standalone snapshot document.
pub fn save_snapshot<W: io::Write>(writer: W, snapshot: &StateSnapshot) -> Result<()> {
    serde_json::to_writer_pretty(writer, snapshot).context("writing state snapshot")
}

pub fn load_snapshot<R: io::Read>(reader: R) -> Result<StateSnapshot> {
    serde_json::from_reader(reader).context("reading state snapshot")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn object(value: serde_json::Value) -> ResourceInstanceObject {
        ResourceInstanceObject {
            provider: "provider.t".parse().unwrap(),
            schema_version: 0,
            value: Value::from_json(value),
            dependencies: BTreeSet::new(),
            status: ObjectStatus::Ready,
            create_before_destroy: false,
            deposed: None,
        }
    }

    pub(crate) fn sample() -> StateSnapshot {
        let mut s = StateSnapshot::new();
        s.insert(
            "t_x.a".parse().unwrap(),
            object(json!({"id": "a-1", "size": 1})),
        );
        let mut b = object(json!({"id": "b-1", "peer": "a-1"}));
        b.dependencies.insert("t_x.a".parse().unwrap());
        s.insert("module.m[\"k\"].t_x.b[0]".parse().unwrap(), b);
        s.outputs.insert("ip".to_string(), Value::from("10.0.0.1"));
        s
    }

    #[test]
    fn save_then_load() {
        let snapshot = sample();
        let mut buf = Vec::new();
        save_snapshot(&mut buf, &snapshot).unwrap();
        let loaded = load_snapshot(buf.as_slice()).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn document_shape() {
        let json = StateSnapshot::new().to_json().unwrap();
        assert_eq!(
            json,
            json!({
                "_type": "terraneState",
                "formatVersion": 1,
                "serial": 0,
                "resources": {},
                "outputs": {}
            })
        );
    }

    #[test]
    fn unknown_format_version_is_rejected() {
        let json = json!({"_type": "terraneState", "formatVersion": 2, "resources": {}});
        let err = StateSnapshot::from_json(json).unwrap_err();
        assert!(format!("{:#}", err).contains("unsupported state format version 2"));
    }

    #[test]
    fn foreign_document_is_rejected() {
        let json = json!({"_type": "otherState", "formatVersion": 1});
        assert!(StateSnapshot::from_json(json).is_err());
    }

    #[test]
    fn list_with_filter() {
        let s = sample();
        let all: Vec<String> = s.list(None).iter().map(|a| a.to_string()).collect();
        // Root module instances sort first.
        assert_eq!(all, vec!["t_x.a", "module.m[\"k\"].t_x.b[0]"]);
        let filter: AddrFilter = "module.m".parse().unwrap();
        let some: Vec<String> = s.list(Some(&filter)).iter().map(|a| a.to_string()).collect();
        assert_eq!(some, vec!["module.m[\"k\"].t_x.b[0]"]);
    }

    #[test]
    fn unknown_values_are_invalid_in_state() {
        let mut s = sample();
        assert!(s.validate().is_ok());
        s.insert(
            "t_x.c".parse().unwrap(),
            ResourceInstanceObject {
                value: Value::object([("id", Value::Unknown)]),
                ..object(json!({}))
            },
        );
        assert!(s.validate().is_err());
    }
}
