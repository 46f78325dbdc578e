//! Plumbing shared by the subcommands.

use anyhow::{Context as _, Result};
use std::{collections::BTreeMap, process::exit};
use terrane_core::value::Value;
use terrane_provider::registry::ProviderRegistry;

use crate::{cancel::CancelSignal, graph::walk::WalkOptions, options::Options};

/// Create the single-threaded tokio runtime used by the CLI.
///
/// Panics if the runtime cannot be created.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to initialize tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("terrane error: {:?}", e);
            exit(1);
        }
    }
}

/// The providers built into this binary.
pub fn registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    terrane_resources_local::register(&mut registry);
    registry
}

pub fn walk_options(options: &Options, cancel: CancelSignal) -> WalkOptions {
    WalkOptions {
        parallelism: options.parallelism,
        cancel,
    }
}

/// Parse `--var name=<json>` arguments. A value that is not JSON is taken as
/// a string.
pub fn parse_variables(args: &[String]) -> Result<BTreeMap<String, Value>> {
    args.iter()
        .map(|arg| {
            let (name, raw) = arg
                .split_once('=')
                .with_context(|| format!("expected NAME=VALUE, got {:?}", arg))?;
            let value = match serde_json::from_str(raw) {
                Ok(json) => Value::from_json(json),
                Err(_) => Value::from(raw),
            };
            Ok((name.to_string(), value))
        })
        .collect()
}

/// Combine a primary result with a cleanup result, preserving both errors if both fail.
pub fn and_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(r), Ok(())) => Ok(r),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e1), Err(e2)) => Err(e1.context(format!("Additionally, cleanup failed: {}", e2))),
    }
}
