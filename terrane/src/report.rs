//! Human-readable rendering of plans and apply results.

use std::io::{self, Write};
use terrane_core::{diagnostics::Diagnostics, value::Value};
use terrane_state::diff::{StateChange, StateChangeKind};

use crate::{
    apply::ApplyResult,
    plan::{Action, Plan, PlannedChange, ReplaceOrder},
};

fn symbol(change: &PlannedChange) -> &'static str {
    match (change.action, change.replace_order.unwrap_or_default()) {
        (Action::NoOp, _) => " ",
        (Action::Create, _) => "+",
        (Action::Update, _) => "~",
        (Action::Delete, _) => "-",
        (Action::Replace, ReplaceOrder::DeleteThenCreate) => "-/+",
        (Action::Replace, ReplaceOrder::CreateThenDelete) => "+/-",
        (Action::Read, _) => "<=",
    }
}

fn describe(change: &PlannedChange) -> &'static str {
    match (change.action, change.replace_order.unwrap_or_default()) {
        (Action::NoOp, _) => "no changes",
        (Action::Create, _) => "create",
        (Action::Update, _) => "update in place",
        (Action::Delete, _) => "destroy",
        (Action::Replace, ReplaceOrder::DeleteThenCreate) => "replace, destroying first",
        (Action::Replace, ReplaceOrder::CreateThenDelete) => "replace, creating first",
        (Action::Read, _) => "read",
    }
}

fn write_attribute_changes(out: &mut impl Write, change: &PlannedChange) -> io::Result<()> {
    let (Some(before), Some(after)) = (&change.before, &change.after) else {
        return Ok(());
    };
    for path in before.changed_paths(after) {
        let forces = if change.requires_replace.iter().any(|r| r.is_prefix_of(&path)) {
            " (forces replacement)"
        } else {
            ""
        };
        writeln!(
            out,
            "        {}: {} -> {}{}",
            path,
            show(&before.get_path(&path)),
            show(&after.get_path(&path)),
            forces
        )?;
    }
    Ok(())
}

fn show(value: &Value) -> String {
    match value {
        Value::Null => "(none)".to_string(),
        v => v.to_string(),
    }
}

pub fn write_diagnostics(out: &mut impl Write, diagnostics: &Diagnostics) -> io::Result<()> {
    for d in diagnostics.iter() {
        writeln!(out, "{}", d)?;
    }
    Ok(())
}

pub fn write_plan(out: &mut impl Write, plan: &Plan) -> io::Result<()> {
    if !plan.drift.is_empty() {
        writeln!(out, "Objects changed outside of terrane:")?;
        for drift in &plan.drift {
            match &drift.after {
                Some(_) => writeln!(out, "  ~ {} has changed", drift.addr)?,
                None => writeln!(out, "  - {} no longer exists", drift.addr)?,
            }
        }
        writeln!(out)?;
    }

    let (mut add, mut change, mut destroy, mut replace) = (0, 0, 0, 0);
    let actions: Vec<&PlannedChange> = plan.actions().collect();
    if actions.is_empty() {
        writeln!(out, "No changes.")?;
    } else {
        writeln!(out, "Planned actions:")?;
    }
    for c in actions {
        if c.deposed.is_some() {
            writeln!(out, "  - {} (destroy deposed object)", c.addr)?;
            destroy += 1;
        }
        if c.action == Action::NoOp {
            continue;
        }
        let pending = if c.complete { "" } else { ", some values known after apply" };
        writeln!(out, "  {} {} ({}{})", symbol(c), c.addr, describe(c), pending)?;
        if matches!(c.action, Action::Update | Action::Replace) {
            write_attribute_changes(out, c)?;
        }
        match c.action {
            Action::Create => add += 1,
            Action::Update => change += 1,
            Action::Delete => destroy += 1,
            Action::Replace => replace += 1,
            Action::Read | Action::NoOp => {}
        }
    }
    writeln!(
        out,
        "Plan: {} to add, {} to change, {} to destroy, {} to replace.",
        add, change, destroy, replace
    )?;
    if !plan.complete {
        writeln!(
            out,
            "The plan is incomplete: some resources could not be planned yet. \
             Apply it and plan again to continue."
        )?;
    }
    write_diagnostics(out, &plan.diagnostics)
}

pub fn write_apply_result(out: &mut impl Write, result: &ApplyResult) -> io::Result<()> {
    let count = |wanted: fn(&StateChange) -> bool| {
        result.changes.iter().filter(|c| wanted(c)).count()
    };
    writeln!(
        out,
        "Apply {}: {} added, {} changed, {} removed.",
        if result.is_success() { "complete" } else { "failed" },
        count(|c| c.kind == StateChangeKind::Added),
        count(|c| matches!(c.kind, StateChangeKind::Changed(_))),
        count(|c| c.kind == StateChangeKind::Removed),
    )?;
    for (addr, reason) in &result.deferred {
        writeln!(out, "  deferred {}: {}", addr, reason)?;
    }
    if !result.state.outputs.is_empty() {
        writeln!(out, "Outputs:")?;
        for (name, value) in &result.state.outputs {
            writeln!(out, "  {} = {}", name, value)?;
        }
    }
    write_diagnostics(out, &result.diagnostics)
}
