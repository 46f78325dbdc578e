//! Version 0 of the provider request and response messages.
//!
//! Field names are camelCase on the wire, like the rest of the persisted
//! `terrane` formats.

use serde::{Deserialize, Serialize};
use terrane_core::{
    diagnostics::Diagnostics,
    value::{AttrPath, Value},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub config: Value,
}

/// Ask the provider what `desired` would look like once applied on top of
/// `prior`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDiffRequest {
    #[serde(rename = "type")]
    pub type_: String,
    /// `None` when the object does not exist yet.
    pub prior: Option<Value>,
    /// May contain unknowns.
    pub desired: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDiffResponse {
    /// The desired value with provider-computed attributes filled in, or
    /// marked unknown if they are only known after apply.
    pub planned: Value,
    /// Attributes whose change cannot be applied in place.
    #[serde(default)]
    pub requires_replace: Vec<AttrPath>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub planned: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub prior: Value,
    pub planned: Value,
}

/// Result of a create or update.
///
/// On failure a provider may still return the object it managed to build, so
/// that it is not lost track of. Such a response has error diagnostics and a
/// `new_value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResponse {
    pub new_value: Option<Value>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}
impl ApplyResponse {
    pub fn ok(new_value: Value) -> Self {
        ApplyResponse {
            new_value: Some(new_value),
            diagnostics: Diagnostics::new(),
        }
    }
}

/// Read back the real-world object. For data resources `current` is the
/// configuration of the data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub current: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    /// `None` if the object no longer exists.
    pub value: Option<Value>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub prior: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_diff_response_wire_format() {
        let json = json!({
            "planned": {"id": {"$unknown": true}, "name": "web"},
            "requiresReplace": ["name"]
        });
        let resp: PlanDiffResponse = serde_json::from_value(json).unwrap();
        assert_eq!(resp.requires_replace, vec![AttrPath::attr("name")]);
        assert!(resp.planned.contains_unknown());
        assert!(resp.diagnostics.is_empty());
    }

    #[test]
    fn create_request_uses_type_key() {
        let req = CreateRequest {
            type_: "local_file".to_string(),
            planned: Value::object([("path", "a.txt".into())]),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            json!({"type": "local_file", "planned": {"path": "a.txt"}})
        );
    }
}
