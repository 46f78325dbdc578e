//! The `local` provider: resources that live on the machine running terrane.
//!
//! - `local_file`: a file with the given `contents` at `path`
//! - `local_memo`: remembers `initialize_with` as `value` on creation and
//!   keeps it afterwards
//! - `data.local_exec`: runs a command and exposes its `stdout`

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    io::{self, Write as _},
    sync::Arc,
};
use terrane_core::{
    diagnostics::{Diagnostic, Diagnostics},
    value::Value,
};
use terrane_provider::{
    framework::{ResourceProvider, SimpleSchema},
    registry::ProviderRegistry,
    schema::v0,
};
use tracing::debug;

pub const PROVIDER_TYPE: &str = "local";

pub struct LocalResourceProvider {}

impl LocalResourceProvider {
    pub fn new() -> Self {
        LocalResourceProvider {}
    }
}

impl Default for LocalResourceProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Make the `local` provider available to a run.
pub fn register(registry: &mut ProviderRegistry) {
    registry.register_instance(PROVIDER_TYPE, Arc::new(LocalResourceProvider::new()));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileProperties {
    path: String,
    contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct FileOutProperties {
    #[serde(flatten)]
    inputs: FileProperties,
    id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MemoProperties {
    initialize_with: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct MemoOutProperties {
    initialize_with: serde_json::Value,
    value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ExecProperties {
    executable: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    stdin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ExecOutProperties {
    #[serde(flatten)]
    inputs: ExecProperties,
    stdout: String,
}

fn schema(type_: &str) -> Result<SimpleSchema> {
    match type_ {
        "local_file" => Ok(SimpleSchema::new(&["id"], &["path"])),
        "local_memo" => Ok(SimpleSchema::new(&["value"], &[])),
        "local_exec" => Ok(SimpleSchema::new(&["stdout"], &[])),
        t => bail!("unknown resource type: {}", t),
    }
}

fn parse_properties<T: DeserializeOwned>(value: &Value, type_: &str) -> Result<T> {
    serde_json::from_value(value.to_json())
        .with_context(|| format!("Could not deserialize properties for {} resource", type_))
}

fn to_value<T: Serialize>(out: T) -> Result<Value> {
    Ok(Value::from_json(serde_json::to_value(out)?))
}

/// Resource-level failures are diagnostics, not transport errors.
fn respond(type_: &str, result: Result<Value>) -> v0::ApplyResponse {
    match result {
        Ok(value) => v0::ApplyResponse::ok(value),
        Err(e) => v0::ApplyResponse {
            new_value: None,
            diagnostics: Diagnostic::from_error(format!("{} failed", type_), &e).into(),
        },
    }
}

fn write_file(p: FileProperties) -> Result<Value> {
    std::fs::write(&p.path, &p.contents).with_context(|| format!("writing {}", p.path))?;
    let id = p.path.clone();
    to_value(FileOutProperties { inputs: p, id })
}

fn run_exec(p: ExecProperties) -> Result<Value> {
    let mut command = std::process::Command::new(&p.executable);
    command.args(&p.args);

    let in_stdio = if p.stdin.is_some() {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    };

    let mut child = command
        .stdin(in_stdio)
        .stdout(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("Could not spawn process: {}", p.executable))?;

    if let Some(stdin) = &p.stdin {
        child
            .stdin
            .take()
            .context("child stdin was not piped")?
            .write_all(stdin.as_bytes())?;
    }

    let output = child.wait_with_output()?;
    let stdout = String::from_utf8(output.stdout)?;
    if !output.status.success() {
        bail!("Local process failed with exit code: {}", output.status)
    }
    to_value(ExecOutProperties { inputs: p, stdout })
}

#[async_trait]
impl ResourceProvider for LocalResourceProvider {
    async fn validate(&self, request: v0::ValidateRequest) -> Result<Diagnostics> {
        let checked = match request.type_.as_str() {
            _ if !request.config.is_wholly_known() => Ok(()),
            "local_file" => parse_properties::<FileProperties>(&request.config, &request.type_).map(|_| ()),
            "local_memo" => parse_properties::<MemoProperties>(&request.config, &request.type_).map(|_| ()),
            "local_exec" => parse_properties::<ExecProperties>(&request.config, &request.type_).map(|_| ()),
            t => Err(anyhow::anyhow!("unknown resource type: {}", t)),
        };
        Ok(match checked {
            Ok(()) => Diagnostics::new(),
            Err(e) => Diagnostic::from_error("invalid configuration", &e).into(),
        })
    }

    async fn plan_diff(&self, request: v0::PlanDiffRequest) -> Result<v0::PlanDiffResponse> {
        match schema(&request.type_) {
            Ok(schema) => Ok(schema.plan(&request)),
            Err(e) => Ok(v0::PlanDiffResponse {
                planned: Value::Unknown,
                requires_replace: Vec::new(),
                diagnostics: Diagnostic::from_error("cannot plan", &e).into(),
            }),
        }
    }

    async fn create(&self, request: v0::CreateRequest) -> Result<v0::ApplyResponse> {
        debug!(type_ = %request.type_, "local create");
        let result = match request.type_.as_str() {
            "local_file" => {
                parse_properties::<FileProperties>(&request.planned, &request.type_).and_then(write_file)
            }
            "local_memo" => {
                parse_properties::<MemoProperties>(&request.planned, &request.type_).and_then(|p| {
                    // Initialized once, never modified afterwards
                    to_value(MemoOutProperties {
                        value: p.initialize_with.clone(),
                        initialize_with: p.initialize_with,
                    })
                })
            }
            t => Err(anyhow::anyhow!("create: unknown resource type: {}", t)),
        };
        Ok(respond(&request.type_, result))
    }

    async fn read(&self, request: v0::ReadRequest) -> Result<v0::ReadResponse> {
        let result: Result<Option<Value>> = match request.type_.as_str() {
            "local_file" => {
                parse_properties::<FileProperties>(&request.current, &request.type_).and_then(|p| {
                    match std::fs::read_to_string(&p.path) {
                        Ok(contents) => {
                            let id = p.path.clone();
                            to_value(FileOutProperties {
                                inputs: FileProperties { contents, ..p },
                                id,
                            })
                            .map(Some)
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                        Err(e) => Err(e).with_context(|| format!("reading {}", p.path)),
                    }
                })
            }
            "local_memo" => Ok(Some(request.current.clone())),
            "local_exec" => match parse_properties::<ExecProperties>(&request.current, &request.type_) {
                Ok(p) => tokio::task::spawn_blocking(move || run_exec(p))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|r| r)
                    .map(Some),
                Err(e) => Err(e),
            },
            t => Err(anyhow::anyhow!("read: unknown resource type: {}", t)),
        };
        Ok(match result {
            Ok(value) => v0::ReadResponse {
                value,
                diagnostics: Diagnostics::new(),
            },
            Err(e) => v0::ReadResponse {
                value: Some(request.current),
                diagnostics: Diagnostic::from_error(format!("{} read failed", request.type_), &e)
                    .into(),
            },
        })
    }

    async fn update(&self, request: v0::UpdateRequest) -> Result<v0::ApplyResponse> {
        debug!(type_ = %request.type_, "local update");
        let result = match request.type_.as_str() {
            "local_file" => {
                parse_properties::<FileProperties>(&request.planned, &request.type_).and_then(write_file)
            }
            // The planned value already carries the memorized value over.
            "local_memo" => Ok(request.planned.clone()),
            t => Err(anyhow::anyhow!("update: unknown resource type: {}", t)),
        };
        Ok(respond(&request.type_, result))
    }

    async fn delete(&self, request: v0::DeleteRequest) -> Result<Diagnostics> {
        debug!(type_ = %request.type_, "local delete");
        let result = match request.type_.as_str() {
            "local_file" => parse_properties::<FileProperties>(&request.prior, &request.type_)
                .and_then(|p| match std::fs::remove_file(&p.path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e).with_context(|| format!("removing {}", p.path)),
                }),
            "local_memo" => Ok(()),
            t => Err(anyhow::anyhow!("delete: unknown resource type: {}", t)),
        };
        Ok(match result {
            Ok(()) => Diagnostics::new(),
            Err(e) => Diagnostic::from_error(format!("{} delete failed", request.type_), &e).into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use terrane_core::value::AttrPath;

    fn file_config(path: &std::path::Path, contents: &str) -> Value {
        Value::from_json(json!({"path": path.to_string_lossy(), "contents": contents}))
    }

    #[tokio::test]
    async fn file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        let provider = LocalResourceProvider::new();

        let plan = provider
            .plan_diff(v0::PlanDiffRequest {
                type_: "local_file".to_string(),
                prior: None,
                desired: file_config(&path, "hi"),
            })
            .await
            .unwrap();
        assert!(plan.planned.contains_unknown());

        let created = provider
            .create(v0::CreateRequest {
                type_: "local_file".to_string(),
                planned: file_config(&path, "hi"),
            })
            .await
            .unwrap();
        assert!(created.diagnostics.is_empty());
        let value = created.new_value.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi");
        assert_eq!(
            value.get_path(&"id".parse().unwrap()).as_str(),
            Some(path.to_string_lossy().as_ref())
        );

        // drift
        std::fs::write(&path, "changed").unwrap();
        let read = provider
            .read(v0::ReadRequest {
                type_: "local_file".to_string(),
                current: value.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            read.value.unwrap().get_path(&"contents".parse().unwrap()),
            Value::from("changed")
        );

        let diags = provider
            .delete(v0::DeleteRequest {
                type_: "local_file".to_string(),
                prior: value.clone(),
            })
            .await
            .unwrap();
        assert!(diags.is_empty());
        assert!(!path.exists());

        let read = provider
            .read(v0::ReadRequest {
                type_: "local_file".to_string(),
                current: value,
            })
            .await
            .unwrap();
        assert_eq!(read.value, None);
    }

    #[tokio::test]
    async fn file_path_change_requires_replace() {
        let provider = LocalResourceProvider::new();
        let plan = provider
            .plan_diff(v0::PlanDiffRequest {
                type_: "local_file".to_string(),
                prior: Some(Value::from_json(
                    json!({"path": "a", "contents": "x", "id": "a"}),
                )),
                desired: Value::from_json(json!({"path": "b", "contents": "x"})),
            })
            .await
            .unwrap();
        assert_eq!(plan.requires_replace, vec![AttrPath::attr("path")]);
    }

    #[tokio::test]
    async fn memo_keeps_first_value() {
        let provider = LocalResourceProvider::new();
        let created = provider
            .create(v0::CreateRequest {
                type_: "local_memo".to_string(),
                planned: Value::from_json(json!({"initialize_with": 1})),
            })
            .await
            .unwrap()
            .new_value
            .unwrap();
        let plan = provider
            .plan_diff(v0::PlanDiffRequest {
                type_: "local_memo".to_string(),
                prior: Some(created),
                desired: Value::from_json(json!({"initialize_with": 2})),
            })
            .await
            .unwrap();
        assert_eq!(
            plan.planned,
            Value::from_json(json!({"initialize_with": 2, "value": 1}))
        );
    }

    #[tokio::test]
    async fn exec_data_source() {
        let provider = LocalResourceProvider::new();
        let read = provider
            .read(v0::ReadRequest {
                type_: "local_exec".to_string(),
                current: Value::from_json(json!({"executable": "cat", "stdin": "hello"})),
            })
            .await
            .unwrap();
        assert!(read.diagnostics.is_empty());
        assert_eq!(
            read.value.unwrap().get_path(&"stdout".parse().unwrap()),
            Value::from("hello")
        );
    }

    #[tokio::test]
    async fn failures_are_diagnostics() {
        let provider = LocalResourceProvider::new();
        let resp = provider
            .create(v0::CreateRequest {
                type_: "local_file".to_string(),
                planned: Value::from_json(json!({"path": "/nonexistent/dir/x", "contents": ""})),
            })
            .await
            .unwrap();
        assert!(resp.new_value.is_none());
        assert!(resp.diagnostics.has_errors());

        let diags = provider
            .validate(v0::ValidateRequest {
                type_: "local_file".to_string(),
                config: Value::from_json(json!({"path": 3})),
            })
            .await
            .unwrap();
        assert!(diags.has_errors());
    }
}
