//! Step Conditions
//!
//! Predicates over prior step outcomes that gate conditional steps.
//! Conditions are evaluated against the run's result map; a condition whose
//! target has no entry is unmet.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::StepResult;

/// Caller-supplied predicate referenced by [`Condition::Custom`].
pub type Predicate = Arc<dyn Fn(&StepResult) -> bool + Send + Sync>;

/// A predicate over one target step's result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Target step completed successfully.
    Success { target: String },

    /// Target step ran and failed.
    Failure { target: String },

    /// Target step's response content, as JSON text, contains `value`.
    ResultContains { target: String, value: String },

    /// Target step's response field `key` equals `value`.
    ResultEquals {
        target: String,
        key: String,
        value: Value,
    },

    /// A predicate registered on the engine under `predicate`.
    Custom { target: String, predicate: String },
}

impl Condition {
    pub fn success(target: impl Into<String>) -> Self {
        Self::Success {
            target: target.into(),
        }
    }

    pub fn failure(target: impl Into<String>) -> Self {
        Self::Failure {
            target: target.into(),
        }
    }

    pub fn result_contains(target: impl Into<String>, value: impl Into<String>) -> Self {
        Self::ResultContains {
            target: target.into(),
            value: value.into(),
        }
    }

    pub fn result_equals(
        target: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self::ResultEquals {
            target: target.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn custom(target: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self::Custom {
            target: target.into(),
            predicate: predicate.into(),
        }
    }

    /// The step id this condition inspects.
    pub fn target(&self) -> &str {
        match self {
            Self::Success { target }
            | Self::Failure { target }
            | Self::ResultContains { target, .. }
            | Self::ResultEquals { target, .. }
            | Self::Custom { target, .. } => target,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::ResultContains { .. } => "result_contains",
            Self::ResultEquals { .. } => "result_equals",
            Self::Custom { .. } => "custom",
        }
    }

    /// Evaluates the condition. A missing target is unmet.
    pub fn evaluate(
        &self,
        results: &HashMap<String, StepResult>,
        predicates: &HashMap<String, Predicate>,
    ) -> bool {
        let Some(result) = results.get(self.target()) else {
            debug!(
                "Condition '{}' unmet: step '{}' has no result",
                self.kind(),
                self.target()
            );
            return false;
        };

        match self {
            Self::Success { .. } => result.success,
            Self::Failure { .. } => !result.success,
            Self::ResultContains { value, .. } => Value::Object(result.content.clone())
                .to_string()
                .contains(value.as_str()),
            Self::ResultEquals { key, value, .. } => result.content.get(key) == Some(value),
            Self::Custom { predicate, .. } => match predicates.get(predicate) {
                Some(check) => check(result),
                None => {
                    warn!("Predicate '{}' is not registered - condition unmet", predicate);
                    false
                }
            },
        }
    }
}

/// Evaluates an AND-combined list of conditions.
pub fn all_met(
    conditions: &[Condition],
    results: &HashMap<String, StepResult>,
    predicates: &HashMap<String, Predicate>,
) -> bool {
    conditions.iter().all(|c| c.evaluate(results, predicates))
}

/// Couples a condition to a named subset of steps.
///
/// Used by templates: every step listed in `step_ids` becomes conditional
/// on `condition` when the template is instantiated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowBranch {
    pub name: String,
    pub condition: Condition,
    #[serde(default)]
    pub step_ids: Vec<String>,
}

impl WorkflowBranch {
    pub fn new(name: impl Into<String>, condition: Condition, step_ids: Vec<String>) -> Self {
        Self {
            name: name.into(),
            condition,
            step_ids,
        }
    }

    pub fn covers(&self, step_id: &str) -> bool {
        self.step_ids.iter().any(|id| id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn result(success: bool, content: Value) -> StepResult {
        let content: Map<String, Value> = match content {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        StepResult {
            success,
            content,
            attempts: 1,
            ..StepResult::default()
        }
    }

    fn results() -> HashMap<String, StepResult> {
        let mut map = HashMap::new();
        map.insert(
            "ok".to_string(),
            result(true, json!({"success": true, "label": "positive", "score": 3})),
        );
        map.insert("bad".to_string(), result(false, json!({"success": false})));
        map
    }

    #[test]
    fn test_success_and_failure() {
        let results = results();
        let predicates = HashMap::new();

        assert!(Condition::success("ok").evaluate(&results, &predicates));
        assert!(!Condition::success("bad").evaluate(&results, &predicates));
        assert!(Condition::failure("bad").evaluate(&results, &predicates));
        assert!(!Condition::failure("ok").evaluate(&results, &predicates));
    }

    #[test]
    fn test_missing_target_fails_closed() {
        let results = results();
        let predicates = HashMap::new();

        assert!(!Condition::success("missing").evaluate(&results, &predicates));
        assert!(!Condition::failure("missing").evaluate(&results, &predicates));
    }

    #[test]
    fn test_result_contains_and_equals() {
        let results = results();
        let predicates = HashMap::new();

        assert!(Condition::result_contains("ok", "positive").evaluate(&results, &predicates));
        assert!(!Condition::result_contains("ok", "negative").evaluate(&results, &predicates));
        assert!(Condition::result_equals("ok", "score", 3).evaluate(&results, &predicates));
        assert!(!Condition::result_equals("ok", "score", 4).evaluate(&results, &predicates));
        assert!(!Condition::result_equals("ok", "absent", 3).evaluate(&results, &predicates));
    }

    #[test]
    fn test_custom_predicate() {
        let results = results();
        let mut predicates: HashMap<String, Predicate> = HashMap::new();
        predicates.insert(
            "high_score".to_string(),
            Arc::new(|r: &StepResult| r.content.get("score").and_then(Value::as_i64) > Some(2)),
        );

        assert!(Condition::custom("ok", "high_score").evaluate(&results, &predicates));
        assert!(!Condition::custom("ok", "unregistered").evaluate(&results, &predicates));
    }

    #[test]
    fn test_all_met_is_and() {
        let results = results();
        let predicates = HashMap::new();

        let conditions = vec![Condition::success("ok"), Condition::failure("bad")];
        assert!(all_met(&conditions, &results, &predicates));

        let conditions = vec![Condition::success("ok"), Condition::success("bad")];
        assert!(!all_met(&conditions, &results, &predicates));

        assert!(all_met(&[], &results, &predicates));
    }

    #[test]
    fn test_condition_serde_shape() {
        let condition = Condition::result_equals("a", "label", "yes");
        let value = serde_json::to_value(&condition).unwrap();
        assert_eq!(
            value,
            json!({"kind": "result_equals", "target": "a", "key": "label", "value": "yes"})
        );

        let parsed: Condition = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, condition);
    }

    #[test]
    fn test_branch_covers() {
        let branch = WorkflowBranch::new(
            "on_failure",
            Condition::failure("a"),
            vec!["cleanup".to_string()],
        );
        assert!(branch.covers("cleanup"));
        assert!(!branch.covers("a"));
    }
}
