//! # Action API
//!
//! The closed set of messages accepted at the document boundary. Every
//! action names its target by reference text and either succeeds with the
//! affected set or fails without changing anything.

use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An external action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Action {
    /// Assign an essential variable directly (`$P.coords`).
    SetEssentialValue { target: String, value: Value },
    /// Run a kind-specific update (`movePoint`, `updateValue`, ...).
    InvokeNamedUpdate {
        target: String,
        update: String,
        #[serde(default)]
        args: BTreeMap<String, Value>,
    },
    /// Request a value for any variable; inverse definitions carry it down to
    /// essential variables.
    SetValue { target: String, value: Value },
}

impl Action {
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::SetEssentialValue { target, .. }
            | Self::InvokeNamedUpdate { target, .. }
            | Self::SetValue { target, .. } => target,
        }
    }

    /// Short name of the action kind, for logs.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::SetEssentialValue { .. } => "setEssentialValue",
            Self::InvokeNamedUpdate { .. } => "invokeNamedUpdate",
            Self::SetValue { .. } => "setValue",
        }
    }

    /// Convenience constructor for `movePoint`.
    #[must_use]
    pub fn move_point(target: impl Into<String>, x: f64, y: f64) -> Self {
        Self::InvokeNamedUpdate {
            target: target.into(),
            update: "movePoint".to_string(),
            args: BTreeMap::from([
                ("x".to_string(), Value::Number(x)),
                ("y".to_string(), Value::Number(y)),
            ]),
        }
    }

    /// Convenience constructor for `updateValue`.
    #[must_use]
    pub fn update_value(target: impl Into<String>, value: Value) -> Self {
        Self::InvokeNamedUpdate {
            target: target.into(),
            update: "updateValue".to_string(),
            args: BTreeMap::from([("value".to_string(), value)]),
        }
    }
}

/// Result of a successful action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    /// Essential variables whose value changed (`path.variable`).
    pub changed: Vec<String>,
    /// Name paths of every directly or indirectly affected component,
    /// including replacements created while settling.
    pub affected: Vec<String>,
}

impl ActionOutcome {
    /// Whether the action changed nothing (e.g. a repeated assignment).
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_deserialize_from_tagged_json() {
        let json = r#"[
            {"kind": "setEssentialValue", "target": "$n.value", "value": {"number": 4.0}},
            {"kind": "invokeNamedUpdate", "target": "$P", "update": "movePoint",
             "args": {"x": {"number": 1.0}, "y": {"number": 2.0}}},
            {"kind": "setValue", "target": "$P.x", "value": {"number": 3.0}}
        ]"#;
        let actions: Vec<Action> = serde_json::from_str(json).expect("parse");
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[1], Action::move_point("$P", 1.0, 2.0));
        assert_eq!(actions[2].target(), "$P.x");
        assert_eq!(actions[0].kind_name(), "setEssentialValue");
    }

    #[test]
    fn default_outcome_is_noop() {
        assert!(ActionOutcome::default().is_noop());
    }
}
