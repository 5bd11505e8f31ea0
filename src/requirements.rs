//! Typed replacement for the free-form "extracted requirements" documents.
//! The synthesis model is asked for JSON; parsing fails loudly when required
//! fields are missing instead of letting untyped maps flow downstream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RequirementsError {
    #[error("Requirements output is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Requirements output is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("Unsupported requirements schema version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequirementsDocument {
    pub schema_version: u32,
    pub project_name: String,
    pub goals: Vec<String>,
    pub features: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub target_audience: Option<String>,
    #[serde(default)]
    pub cost_estimate: Option<String>,
    #[serde(default)]
    pub timeline_estimate: Option<String>,
}

impl RequirementsDocument {
    /// Parses the model's JSON output. The model sometimes wraps JSON in a
    /// markdown code fence; strip that before parsing. Required fields are
    /// `project_name`, `goals`, and `features`.
    pub fn from_model_json(raw: &str) -> Result<Self, RequirementsError> {
        let trimmed = strip_code_fence(raw);
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| RequirementsError::InvalidJson(e.to_string()))?;

        let obj = value
            .as_object()
            .ok_or(RequirementsError::InvalidJson("expected a JSON object".to_string()))?;

        let project_name = require_string(obj, "project_name")?;
        let goals = require_string_list(obj, "goals")?;
        let features = require_string_list(obj, "features")?;

        let version = obj
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(SCHEMA_VERSION);
        if version != SCHEMA_VERSION {
            return Err(RequirementsError::UnsupportedVersion(version));
        }

        Ok(Self {
            schema_version: version,
            project_name,
            goals,
            features,
            constraints: optional_string_list(obj, "constraints"),
            target_audience: optional_string(obj, "target_audience"),
            cost_estimate: optional_string(obj, "cost_estimate"),
            timeline_estimate: optional_string(obj, "timeline_estimate"),
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn require_string(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, RequirementsError> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
        .ok_or(RequirementsError::MissingField(field))
}

fn require_string_list(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, RequirementsError> {
    let list = optional_string_list(obj, field);
    if list.is_empty() {
        Err(RequirementsError::MissingField(field))
    } else {
        Ok(list)
    }
}

fn optional_string_list(obj: &serde_json::Map<String, Value>, field: &str) -> Vec<String> {
    obj.get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn optional_string(obj: &serde_json::Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
}
