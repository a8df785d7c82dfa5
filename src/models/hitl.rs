// Human-in-the-loop session models

//! # HITL Models
//!
//! Data carried by a human-in-the-loop checkpoint: the session that is open
//! while the remote workflow waits for an operator, the snapshot used to
//! pre-populate the editable parameters, and the field rules those
//! parameters are validated against before a resume request is sent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::execution::Execution;

/// Parameter set exchanged with the operator and sent on resume
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Per-field validation messages, keyed by field name
pub type ValidationErrors = BTreeMap<String, String>;

/// Why the remote workflow stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlMode {
    /// The workflow reached a configured checkpoint
    Pause,
    /// The operator (or server) interrupted a running node
    Interrupt,
}

impl HitlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitlMode::Pause => "pause",
            HitlMode::Interrupt => "interrupt",
        }
    }
}

impl std::fmt::Display for HitlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a session sits in the decision flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HitlPhase {
    AwaitingDecision,
    Submitting,
}

/// Last-known state of the execution at the moment it stopped
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub query: Option<String>,
    pub task_type: Option<String>,

    /// Structured intermediate data the server attached to the checkpoint
    pub data: Option<serde_json::Value>,

    /// The snapshot exactly as received
    pub raw: serde_json::Value,
}

impl StateSnapshot {
    /// Combine the server-sent snapshot with what the registry already knows
    ///
    /// Values in `raw` win; the execution's query fills the gap when the
    /// server omitted it.
    pub fn capture(execution: Option<&Execution>, raw: serde_json::Value) -> Self {
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| raw.get(*key).and_then(|v| v.as_str()))
                .map(str::to_string)
        };

        let query = text(&["query", "user_input"]).or_else(|| execution.map(|e| e.query.clone()));
        let task_type = text(&["task_type", "taskType"]);
        let data = raw
            .get("data")
            .or_else(|| raw.get("structured_data"))
            .filter(|v| !v.is_null())
            .cloned();

        Self {
            query,
            task_type,
            data,
            raw,
        }
    }
}

/// An open human-in-the-loop checkpoint for one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlSession {
    pub execution_id: String,
    pub node_name: String,
    pub mode: HitlMode,
    pub phase: HitlPhase,
    pub snapshot: StateSnapshot,

    /// Editable parameters, pre-populated from the snapshot
    pub parameters: Parameters,

    /// The pre-populated values as first shown; resume sends only changes
    #[serde(default)]
    pub baseline: Parameters,

    pub validation_errors: ValidationErrors,

    /// Message from the last failed resume/cancel request
    pub last_error: Option<String>,

    pub opened_at: DateTime<Utc>,
}

/// Rule applied to one parameter field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    /// Must be present and a non-blank string
    RequiredText,
    /// If present, must be one of the accepted string values
    OneOf(Vec<String>),
}

/// Validation rules for the operator-supplied parameter set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSchema {
    primary_field: String,
    fields: Vec<(String, FieldRule)>,
}

impl ParameterSchema {
    /// Schema with a single required text field acting as the primary input
    pub fn new(primary_field: impl Into<String>) -> Self {
        let primary_field = primary_field.into();
        Self {
            fields: vec![(primary_field.clone(), FieldRule::RequiredText)],
            primary_field,
        }
    }

    /// Add an enumerated field
    pub fn with_choice<I, S>(mut self, name: impl Into<String>, accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let accepted = accepted.into_iter().map(Into::into).collect();
        self.fields.push((name.into(), FieldRule::OneOf(accepted)));
        self
    }

    /// Add another required text field
    pub fn with_required(mut self, name: impl Into<String>) -> Self {
        self.fields.push((name.into(), FieldRule::RequiredText));
        self
    }

    pub fn primary_field(&self) -> &str {
        &self.primary_field
    }

    /// Check every rule, returning one message per failing field
    pub fn validate(&self, parameters: &Parameters) -> ValidationErrors {
        let mut errors = ValidationErrors::new();

        for (name, rule) in &self.fields {
            let value = parameters.get(name);
            match rule {
                FieldRule::RequiredText => {
                    let filled = value
                        .and_then(|v| v.as_str())
                        .map(|s| !s.trim().is_empty())
                        .unwrap_or(false);
                    if !filled {
                        errors.insert(name.clone(), format!("{} is required", name));
                    }
                }
                FieldRule::OneOf(accepted) => {
                    let Some(value) = value.filter(|v| !is_blank(v)) else {
                        continue;
                    };
                    let ok = value
                        .as_str()
                        .map(|s| accepted.iter().any(|a| a == s))
                        .unwrap_or(false);
                    if !ok {
                        errors.insert(
                            name.clone(),
                            format!("{} must be one of: {}", name, accepted.join(", ")),
                        );
                    }
                }
            }
        }

        errors
    }

    /// Build the editable parameter set shown when a session opens
    pub fn prepopulate(&self, snapshot: &StateSnapshot) -> Parameters {
        let mut parameters = Parameters::new();

        if let Some(serde_json::Value::Object(data)) = &snapshot.data {
            for (key, value) in data {
                parameters.insert(key.clone(), value.clone());
            }
        }
        if let Some(task_type) = &snapshot.task_type {
            parameters.insert("task_type".to_string(), task_type.clone().into());
        }
        if let Some(query) = &snapshot.query {
            parameters.insert(self.primary_field.clone(), query.clone().into());
        }

        parameters
    }

    /// The values to send on resume
    ///
    /// Keeps fields that differ from `baseline` and are not empty. The
    /// primary field is always kept, since the server requires it.
    pub fn changed(&self, baseline: &Parameters, parameters: &Parameters) -> Parameters {
        strip_empty(parameters)
            .into_iter()
            .filter(|(key, value)| *key == self.primary_field || baseline.get(key) != Some(value))
            .collect()
    }
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self::new("user_input")
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Drop null and empty values so only explicitly set fields are sent
pub fn strip_empty(parameters: &Parameters) -> Parameters {
    parameters
        .iter()
        .filter(|(_, value)| !is_blank(value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_required_field_missing() {
        let schema = ParameterSchema::default();
        let errors = schema.validate(&Parameters::new());
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key("user_input"));
    }

    #[test]
    fn test_required_field_blank() {
        let schema = ParameterSchema::default();
        let errors = schema.validate(&params(json!({"user_input": "   "})));
        assert!(errors.contains_key("user_input"));
    }

    #[test]
    fn test_choice_field() {
        let schema = ParameterSchema::default().with_choice("task_type", ["query", "analysis"]);

        let ok = params(json!({"user_input": "retry", "task_type": "analysis"}));
        assert!(schema.validate(&ok).is_empty());

        let bad = params(json!({"user_input": "retry", "task_type": "poetry"}));
        let errors = schema.validate(&bad);
        assert_eq!(
            errors.get("task_type").map(String::as_str),
            Some("task_type must be one of: query, analysis")
        );

        // An unset choice is not an error
        let unset = params(json!({"user_input": "retry", "task_type": null}));
        assert!(schema.validate(&unset).is_empty());
    }

    #[test]
    fn test_strip_empty() {
        let stripped = strip_empty(&params(json!({
            "user_input": "retry with X",
            "task_type": "",
            "limit": 0,
            "filters": [],
            "extra": null,
            "flag": false
        })));

        assert_eq!(stripped.len(), 3);
        assert!(stripped.contains_key("user_input"));
        assert!(stripped.contains_key("limit"));
        assert!(stripped.contains_key("flag"));
    }

    #[test]
    fn test_snapshot_capture_falls_back_to_execution_query() {
        let execution = Execution::new("e1", "sales?", Utc::now());
        let snapshot = StateSnapshot::capture(
            Some(&execution),
            json!({"taskType": "analysis", "data": {"rows": 3}}),
        );

        assert_eq!(snapshot.query.as_deref(), Some("sales?"));
        assert_eq!(snapshot.task_type.as_deref(), Some("analysis"));
        assert_eq!(snapshot.data, Some(json!({"rows": 3})));
    }

    #[test]
    fn test_prepopulate() {
        let schema = ParameterSchema::default();
        let snapshot = StateSnapshot::capture(
            None,
            json!({"query": "sales?", "task_type": "analysis", "data": {"region": "EU"}}),
        );
        let parameters = schema.prepopulate(&snapshot);

        assert_eq!(parameters["user_input"], "sales?");
        assert_eq!(parameters["task_type"], "analysis");
        assert_eq!(parameters["region"], "EU");
    }

    #[test]
    fn test_changed_keeps_primary_and_edits() {
        let schema = ParameterSchema::default();
        let baseline = params(json!({"user_input": "sales?", "task_type": "analysis", "region": "EU"}));

        let untouched = schema.changed(&baseline, &baseline);
        assert_eq!(untouched, params(json!({"user_input": "sales?"})));

        let edited = params(json!({
            "user_input": "sales?",
            "task_type": "analysis",
            "region": "US",
            "note": ""
        }));
        assert_eq!(
            schema.changed(&baseline, &edited),
            params(json!({"user_input": "sales?", "region": "US"}))
        );
    }
}
