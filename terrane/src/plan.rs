//! Plans: what an apply is going to do, and the artifact that carries it
//! from `terrane plan` to `terrane apply`.

pub mod diff;
pub mod planner;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{BufReader, BufWriter, Write as _},
    path::Path,
};
use terrane_core::{
    addr::{AbsResourceAddr, ProviderConfigAddr, ResourceInstanceAddr},
    diagnostics::Diagnostics,
    value::{AttrPath, Value},
};
use terrane_state::snapshot::StateSnapshot;

pub const PLAN_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanMode {
    #[default]
    Normal,
    Destroy,
    /// Only bring state up to date with the real objects.
    RefreshOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    NoOp,
    Create,
    Update,
    Delete,
    /// A delete and a create, in the order of [`ReplaceOrder`].
    Replace,
    Read,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplaceOrder {
    #[default]
    DeleteThenCreate,
    CreateThenDelete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedChange {
    pub addr: ResourceInstanceAddr,
    pub provider: ProviderConfigAddr,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_order: Option<ReplaceOrder>,
    pub before: Option<Value>,
    /// May contain unknowns if the change is not complete.
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_replace: Vec<AttrPath>,
    /// Whether `after` is final. Incomplete changes are planned again during
    /// apply, once the values they wait for are known.
    pub complete: bool,
    #[serde(default)]
    pub dependencies: BTreeSet<AbsResourceAddr>,
    /// A deposed object left by an earlier replace, destroyed before the
    /// change itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<Value>,
}

impl PlannedChange {
    /// Does nothing at all when applied.
    pub fn is_noop(&self) -> bool {
        self.action == Action::NoOp && self.deposed.is_none()
    }

    /// The primitive steps of the change, in execution order.
    pub fn steps(&self) -> Vec<Action> {
        match (self.action, self.replace_order.unwrap_or_default()) {
            (Action::Replace, ReplaceOrder::DeleteThenCreate) => vec![Action::Delete, Action::Create],
            (Action::Replace, ReplaceOrder::CreateThenDelete) => vec![Action::Create, Action::Delete],
            (action, _) => vec![action],
        }
    }
}

/// A recorded object that turned out different, or gone, on refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDrift {
    pub addr: ResourceInstanceAddr,
    pub before: Value,
    /// `None` if the object no longer exists.
    pub after: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(deserialize_with = "supported_format_version")]
    pub format_version: u32,
    pub mode: PlanMode,
    /// In execution order.
    pub changes: Vec<PlannedChange>,
    #[serde(default)]
    pub drift: Vec<ResourceDrift>,
    /// The state the plan was computed against.
    pub prior_state: StateSnapshot,
    /// Root variable values, defaults included.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Planned root outputs; may contain unknowns.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Every node was planned: none was deferred, canceled or failed.
    pub complete: bool,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

fn supported_format_version<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let v = u32::deserialize(deserializer)?;
    if v != PLAN_FORMAT_VERSION {
        return Err(serde::de::Error::custom(format!(
            "unsupported plan format version {} (this version of terrane reads version {})",
            v, PLAN_FORMAT_VERSION
        )));
    }
    Ok(v)
}

impl Plan {
    /// Nothing to do: every change is a no-op.
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(PlannedChange::is_noop)
    }

    pub fn change(&self, addr: &ResourceInstanceAddr) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| &c.addr == addr)
    }

    /// Changes that do something.
    pub fn actions(&self) -> impl Iterator<Item = &PlannedChange> {
        self.changes.iter().filter(|c| !c.is_noop())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating plan file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("writing plan file {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("writing plan file {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Plan> {
        let file =
            File::open(path).with_context(|| format!("opening plan file {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("reading plan file {}", path.display()))
    }
}
