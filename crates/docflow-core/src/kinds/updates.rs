//! Named updates (`invokeNamedUpdate`): translate a kind-specific gesture
//! into desired values for variables of the target component.

use super::{ComponentKind, spec};
use crate::types::{ActionError, Value};
use std::collections::BTreeMap;

/// Desired values produced by a named update, applied as one action.
pub type UpdatePlan = Vec<(&'static str, Value)>;

/// Translate a named update into desired variable values.
///
/// `current` looks up the current value of a variable of the target; it is
/// only consulted by updates that depend on state (`toggle`).
pub fn plan(
    kind: ComponentKind,
    target: &str,
    update: &str,
    args: &BTreeMap<String, Value>,
    current: &mut dyn FnMut(&str) -> Option<Value>,
) -> Result<UpdatePlan, ActionError> {
    if !spec(kind).updates.contains(&update) {
        return Err(ActionError::UnknownUpdate {
            kind: kind.to_string(),
            update: update.to_string(),
        });
    }
    let missing = |name: &str| ActionError::InvalidPayload {
        target: target.to_string(),
        reason: format!("{update} needs '{name}'"),
    };
    match update {
        "movePoint" => {
            if let Some(coords) = args.get("coords") {
                return Ok(vec![("coords", coords.clone())]);
            }
            match (args.get("x"), args.get("y")) {
                (Some(x), Some(y)) => Ok(vec![("coords", Value::Array(vec![x.clone(), y.clone()]))]),
                (Some(x), None) => Ok(vec![("x", x.clone())]),
                (None, Some(y)) => Ok(vec![("y", y.clone())]),
                (None, None) => Err(missing("x")),
            }
        }
        "moveLine" => {
            let first = args.get("point1").ok_or_else(|| missing("point1"))?;
            let second = args.get("point2").ok_or_else(|| missing("point2"))?;
            Ok(vec![(
                "points",
                Value::Array(vec![first.clone(), second.clone()]),
            )])
        }
        "updateValue" => {
            let value = args.get("value").ok_or_else(|| missing("value"))?;
            Ok(vec![("value", value.clone())])
        }
        "updateImmediateValue" => {
            let value = args.get("value").ok_or_else(|| missing("value"))?;
            Ok(vec![("immediateValue", value.clone())])
        }
        "toggle" => {
            let now = current("value").and_then(|v| v.as_bool()).unwrap_or(false);
            Ok(vec![("value", Value::Bool(!now))])
        }
        other => Err(ActionError::UnknownUpdate {
            kind: kind.to_string(),
            update: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn move_point_with_both_coordinates() {
        let plan = plan(
            ComponentKind::Point,
            "/P",
            "movePoint",
            &args(&[("x", 5.0.into()), ("y", (-5.0).into())]),
            &mut |_| None,
        )
        .expect("plan");
        assert_eq!(plan, vec![("coords", Value::point(5.0, -5.0))]);
    }

    #[test]
    fn move_point_with_one_coordinate() {
        let plan = plan(
            ComponentKind::Point,
            "/P",
            "movePoint",
            &args(&[("y", 2.0.into())]),
            &mut |_| None,
        )
        .expect("plan");
        assert_eq!(plan, vec![("y", Value::Number(2.0))]);
    }

    #[test]
    fn toggle_reads_current_value() {
        let plan = plan(
            ComponentKind::BooleanInput,
            "/b",
            "toggle",
            &BTreeMap::new(),
            &mut |name| (name == "value").then_some(Value::Bool(true)),
        )
        .expect("plan");
        assert_eq!(plan, vec![("value", Value::Bool(false))]);
    }

    #[test]
    fn update_must_belong_to_kind() {
        let result = plan(
            ComponentKind::Number,
            "/n",
            "movePoint",
            &BTreeMap::new(),
            &mut |_| None,
        );
        assert!(matches!(result, Err(ActionError::UnknownUpdate { .. })));
    }

    #[test]
    fn missing_payload_is_reported() {
        let result = plan(
            ComponentKind::Line,
            "/l",
            "moveLine",
            &args(&[("point1", Value::point(0.0, 0.0))]),
            &mut |_| None,
        );
        assert!(matches!(result, Err(ActionError::InvalidPayload { .. })));
    }
}
