//! Tagged JSON Codec
//!
//! Stored documents keep enough type information to rebuild typed values:
//!
//! ```text
//! sets        {"__type__": "set", "items": [...]}
//! enums       {"__type__": "enum", "name": "Status", "value": "completed"}
//! timestamps  {"__type__": "datetime", "value": "2024-01-01T00:00:00+00:00"}
//! records     {"__type__": "<kind>", ...fields}
//! ```
//!
//! [`decode`] strips every marker recursively, which yields the plain JSON
//! shape the serde derives on [`Workflow`] and [`Step`] read back.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::workflow::{RetryPolicy, Step, Workflow};

/// Key carrying the marker kind.
pub const TYPE_KEY: &str = "__type__";

pub fn set_marker(items: impl IntoIterator<Item = Value>) -> Value {
    json!({ TYPE_KEY: "set", "items": items.into_iter().collect::<Vec<_>>() })
}

pub fn enum_marker(name: &str, value: &str) -> Value {
    json!({ TYPE_KEY: "enum", "name": name, "value": value })
}

pub fn datetime_marker(at: &DateTime<Utc>) -> Value {
    json!({ TYPE_KEY: "datetime", "value": at.to_rfc3339() })
}

/// Wraps `fields` as a record of `kind`.
pub fn record(kind: &str, mut fields: Map<String, Value>) -> Value {
    fields.insert(TYPE_KEY.to_string(), Value::String(kind.to_string()));
    Value::Object(fields)
}

fn optional_datetime(at: &Option<DateTime<Utc>>) -> Value {
    at.as_ref().map(datetime_marker).unwrap_or(Value::Null)
}

fn into_fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}

fn encode_retry_policy(policy: &RetryPolicy) -> Value {
    let backoff = if policy.backoff_factor.is_finite() {
        policy.backoff_factor
    } else {
        0.0
    };

    let mut fields = Map::new();
    fields.insert("max_retries".to_string(), json!(policy.max_retries));
    fields.insert("backoff_factor".to_string(), json!(backoff));
    fields.insert(
        "retry_on".to_string(),
        set_marker(
            policy
                .retry_on
                .iter()
                .map(|trigger| enum_marker("RetryTrigger", trigger.as_str())),
        ),
    );
    record("retry_policy", fields)
}

fn encode_step(step: &Step) -> Result<Value, serde_json::Error> {
    let mut fields = into_fields(serde_json::to_value(step)?);

    fields.insert(
        "status".to_string(),
        enum_marker("Status", step.status.as_str()),
    );
    fields.insert(
        "execution_mode".to_string(),
        enum_marker("ExecutionMode", step.execution_mode.as_str()),
    );
    fields.insert("start_time".to_string(), optional_datetime(&step.start_time));
    fields.insert("end_time".to_string(), optional_datetime(&step.end_time));
    fields.insert("retry_policy".to_string(), encode_retry_policy(&step.retry_policy));

    let conditions = step
        .conditions
        .iter()
        .map(|condition| Ok(record("condition", into_fields(serde_json::to_value(condition)?))))
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    fields.insert("conditions".to_string(), Value::Array(conditions));

    Ok(record("step", fields))
}

/// Encodes a workflow into its tagged document form.
pub fn encode_workflow(workflow: &Workflow) -> Result<Value, serde_json::Error> {
    let mut fields = into_fields(serde_json::to_value(workflow)?);

    fields.insert(
        "status".to_string(),
        enum_marker("Status", workflow.status.as_str()),
    );
    fields.insert(
        "required_capabilities".to_string(),
        set_marker(
            workflow
                .required_capabilities
                .iter()
                .map(|c| Value::String(c.clone())),
        ),
    );
    fields.insert("created_at".to_string(), datetime_marker(&workflow.created_at));
    fields.insert("updated_at".to_string(), datetime_marker(&workflow.updated_at));

    let steps = workflow
        .steps
        .iter()
        .map(encode_step)
        .collect::<Result<Vec<_>, _>>()?;
    fields.insert("steps".to_string(), Value::Array(steps));

    Ok(record("workflow", fields))
}

/// Removes every marker, recursively.
pub fn decode(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(decode).collect()),
        Value::Object(mut fields) => {
            let tag = fields
                .get(TYPE_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);

            match tag.as_deref() {
                Some("set") => decode(fields.remove("items").unwrap_or(Value::Array(Vec::new()))),
                Some("enum") | Some("datetime") => {
                    decode(fields.remove("value").unwrap_or(Value::Null))
                }
                _ => {
                    fields.remove(TYPE_KEY);
                    Value::Object(
                        fields
                            .into_iter()
                            .map(|(key, value)| (key, decode(value)))
                            .collect(),
                    )
                }
            }
        }
        other => other,
    }
}

/// Marker-free copy of `value`.
pub fn to_plain(value: &Value) -> Value {
    decode(value.clone())
}

/// Marker-free view of a workflow, for consumers that want plain JSON.
pub fn plain_workflow(workflow: &Workflow) -> Result<Value, serde_json::Error> {
    Ok(decode(encode_workflow(workflow)?))
}

/// Rebuilds a workflow from a tagged or plain document.
pub fn decode_workflow(document: Value) -> Result<Workflow, serde_json::Error> {
    serde_json::from_value(decode(document))
}
