use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use terrane_core::{
    diagnostics::Diagnostics,
    value::{AttrPath, PathStep, Value},
};

use crate::schema::v0::{
    ApplyResponse, CreateRequest, DeleteRequest, PlanDiffRequest, PlanDiffResponse, ReadRequest,
    ReadResponse, UpdateRequest, ValidateRequest,
};

/// The operations the engine needs from a provider.
///
/// An `Err` return means the call itself could not be carried out (a
/// transport failure, a crashed plugin); problems with the resource are
/// reported through the diagnostics of an `Ok` response instead. The engine
/// never retries a call on its own.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn validate(&self, _request: ValidateRequest) -> Result<Diagnostics> {
        Ok(Diagnostics::new())
    }
    async fn plan_diff(&self, request: PlanDiffRequest) -> Result<PlanDiffResponse>;
    async fn create(&self, request: CreateRequest) -> Result<ApplyResponse>;
    async fn read(&self, request: ReadRequest) -> Result<ReadResponse>;
    async fn update(&self, request: UpdateRequest) -> Result<ApplyResponse>;
    async fn delete(&self, request: DeleteRequest) -> Result<Diagnostics>;
}

/// Minimal per-type schema knowledge for providers that plan by simple rules:
/// some top-level attributes are computed by the provider, and changing some
/// others requires replacing the object.
#[derive(Debug, Clone, Default)]
pub struct SimpleSchema {
    pub computed: Vec<String>,
    pub force_new: Vec<String>,
}
impl SimpleSchema {
    pub fn new(computed: &[&str], force_new: &[&str]) -> Self {
        SimpleSchema {
            computed: computed.iter().map(|s| s.to_string()).collect(),
            force_new: force_new.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Plan `desired` on top of `prior`:
    /// - computed attributes that the configuration does not set are carried
    ///   over from the prior object, or unknown if there is none or the
    ///   object is being replaced;
    /// - a `force_new` attribute whose value differs (or is unknown) requires
    ///   replacement.
    pub fn plan(&self, request: &PlanDiffRequest) -> PlanDiffResponse {
        let desired = match &request.desired {
            Value::Map(m) => m.clone(),
            Value::Unknown => {
                return PlanDiffResponse {
                    planned: Value::Unknown,
                    requires_replace: Vec::new(),
                    diagnostics: Diagnostics::new(),
                }
            }
            _ => BTreeMap::new(),
        };

        let requires_replace: Vec<AttrPath> = match &request.prior {
            None => Vec::new(),
            Some(prior) => self
                .force_new
                .iter()
                .filter(|name| {
                    let wanted = desired.get(*name).cloned().unwrap_or_default();
                    let had = prior.get(&PathStep::Attr(name.to_string()));
                    !wanted.is_known() || wanted != had
                })
                .map(|name| AttrPath::attr(name))
                .collect(),
        };

        let mut planned = desired;
        for name in &self.computed {
            if planned.get(name).map(|v| !v.is_null()).unwrap_or(false) {
                continue;
            }
            let carried = match &request.prior {
                Some(prior) if requires_replace.is_empty() => {
                    prior.get(&PathStep::Attr(name.to_string()))
                }
                _ => Value::Unknown,
            };
            planned.insert(name.clone(), carried);
        }

        PlanDiffResponse {
            planned: Value::Map(planned),
            requires_replace,
            diagnostics: Diagnostics::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> SimpleSchema {
        SimpleSchema::new(&["id"], &["name"])
    }

    fn request(prior: Option<serde_json::Value>, desired: Value) -> PlanDiffRequest {
        PlanDiffRequest {
            type_: "t_x".to_string(),
            prior: prior.map(Value::from_json),
            desired,
        }
    }

    #[test]
    fn create_marks_computed_unknown() {
        let resp = schema().plan(&request(None, Value::from_json(json!({"name": "a"}))));
        assert_eq!(
            resp.planned,
            Value::object([("id", Value::Unknown), ("name", "a".into())])
        );
        assert!(resp.requires_replace.is_empty());
    }

    #[test]
    fn update_carries_computed_over() {
        let resp = schema().plan(&request(
            Some(json!({"id": "i-1", "name": "a", "size": 1})),
            Value::from_json(json!({"name": "a", "size": 2})),
        ));
        assert_eq!(
            resp.planned,
            Value::from_json(json!({"id": "i-1", "name": "a", "size": 2}))
        );
        assert!(resp.requires_replace.is_empty());
    }

    #[test]
    fn force_new_change_requires_replace() {
        let resp = schema().plan(&request(
            Some(json!({"id": "i-1", "name": "a"})),
            Value::from_json(json!({"name": "b"})),
        ));
        assert_eq!(resp.requires_replace, vec![AttrPath::attr("name")]);
        assert_eq!(resp.planned.get_path(&AttrPath::attr("id")), Value::Unknown);
    }

    #[test]
    fn unknown_force_new_requires_replace() {
        let resp = schema().plan(&request(
            Some(json!({"id": "i-1", "name": "a"})),
            Value::object([("name", Value::Unknown)]),
        ));
        assert_eq!(resp.requires_replace, vec![AttrPath::attr("name")]);
    }
}
