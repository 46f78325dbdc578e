use anyhow::Result;
use terrane_core::addr::ResourceInstanceAddr;

use crate::snapshot::{ResourceInstanceObject, StateSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChangeKind {
    Added,
    Removed,
    /// The JSON patch turns the old record into the new one.
    Changed(json_patch::Patch),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub addr: ResourceInstanceAddr,
    pub kind: StateChangeKind,
}

/// The resource instances added, removed or changed between two snapshots,
/// in address order.
pub fn diff(old: &StateSnapshot, new: &StateSnapshot) -> Result<Vec<StateChange>> {
    let mut changes = Vec::new();
    for (addr, before) in &old.resources {
        match new.resources.get(addr) {
            None => changes.push(StateChange {
                addr: addr.clone(),
                kind: StateChangeKind::Removed,
            }),
            Some(after) if after != before => changes.push(StateChange {
                addr: addr.clone(),
                kind: StateChangeKind::Changed(object_patch(before, after)?),
            }),
            Some(_) => {}
        }
    }
    for addr in new.resources.keys() {
        if !old.resources.contains_key(addr) {
            changes.push(StateChange {
                addr: addr.clone(),
                kind: StateChangeKind::Added,
            });
        }
    }
    changes.sort_by(|a, b| a.addr.cmp(&b.addr));
    Ok(changes)
}

fn object_patch(
    before: &ResourceInstanceObject,
    after: &ResourceInstanceObject,
) -> Result<json_patch::Patch> {
    Ok(json_patch::diff(
        &serde_json::to_value(before)?,
        &serde_json::to_value(after)?,
    ))
}

/// The patch that turns the whole `old` document into `new`.
pub fn snapshot_patch(old: &StateSnapshot, new: &StateSnapshot) -> Result<json_patch::Patch> {
    Ok(json_patch::diff(&old.to_json()?, &new.to_json()?))
}
