//! # Update Propagator
//!
//! Applies external actions. An action is turned into a plan of assignments
//! to essential variables by walking inverse definitions from the target
//! downwards; policy flags (`fixed`, `disabled`) are checked at every hop.
//! Only a complete plan is committed, so a veto anywhere leaves the document
//! untouched. Commit writes the essential slots, invalidates their transitive
//! dependents and settles composites; nothing else is recomputed eagerly.

use crate::action::{Action, ActionOutcome};
use crate::kinds::{self, DepSpec, Domain, VarSource, updates};
use crate::namespace::Target;
use crate::session::Document;
use crate::spec::AttributeValue;
use crate::types::{ActionError, ComponentId, ScopeId, Value, VarRef};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Pending assignments of one action.
struct Plan<'a> {
    /// Reference text the action named.
    target: &'a str,
    /// Component the action was aimed at.
    component: ComponentId,
    assignments: BTreeMap<VarRef, Value>,
}

/// Replace the element at 1-based `indices` of `value`.
fn replace_element(value: Value, indices: &[usize], element: Value) -> Result<Value, String> {
    let Some((&first, rest)) = indices.split_first() else {
        return Ok(element);
    };
    match value {
        Value::Array(mut items) if first >= 1 && first <= items.len() => {
            let inner = std::mem::take(&mut items[first - 1]);
            items[first - 1] = replace_element(inner, rest, element)?;
            Ok(Value::Array(items))
        }
        other => Err(format!("no element {first} in {}", other.type_name())),
    }
}

impl Document {
    /// Apply one action. Fails without any change when the action is vetoed
    /// or cannot be carried down to essential variables.
    pub fn apply_action(&mut self, action: &Action) -> Result<ActionOutcome, ActionError> {
        if self.disposed {
            return Err(ActionError::Disposed);
        }
        self.settle();
        let target = action.target();
        debug!(kind = action.kind_name(), target, "applying action");

        let assignments = match action {
            Action::SetEssentialValue { value, .. } => {
                let (var, indices) = self.action_var(target)?;
                let Some(current) = self.registry.essential(&var).cloned() else {
                    return Err(ActionError::NotUpdatable {
                        target: target.to_string(),
                        reason: format!("{} is not an essential variable", self.describe(&var)),
                    });
                };
                let mut plan = Plan {
                    target,
                    component: var.component,
                    assignments: BTreeMap::new(),
                };
                if let Some(flag) = self.veto(var.component) {
                    return Err(self.veto_error(&plan, var.component, flag));
                }
                let value = replace_element(current, &indices, value.clone()).map_err(|reason| {
                    ActionError::InvalidPayload {
                        target: target.to_string(),
                        reason,
                    }
                })?;
                let value = self.coerce_essential(&var, value, target)?;
                plan.assignments.insert(var, value);
                plan.assignments
            }
            Action::SetValue { value, .. } => {
                let (var, indices) = self.action_var(target)?;
                let mut plan = Plan {
                    target,
                    component: var.component,
                    assignments: BTreeMap::new(),
                };
                let desired = if indices.is_empty() {
                    value.clone()
                } else {
                    let current = self.current_value(&plan, &var)?;
                    replace_element(current, &indices, value.clone()).map_err(|reason| {
                        ActionError::InvalidPayload {
                            target: target.to_string(),
                            reason,
                        }
                    })?
                };
                let owner = var.component;
                self.plan_assignment(&mut plan, &var, desired, owner, 0)?;
                plan.assignments
            }
            Action::InvokeNamedUpdate { update, args, .. } => {
                let id = self.action_component(target)?;
                let kind = self.tree.kind(id).ok_or_else(|| ActionError::TargetNotFound {
                    target: target.to_string(),
                    reason: "component is gone".to_string(),
                })?;
                let steps = updates::plan(kind, target, update, args, &mut |name: &str| {
                    self.resolve_var(&VarRef::new(id, name)).ok()
                })?;
                let mut plan = Plan {
                    target,
                    component: id,
                    assignments: BTreeMap::new(),
                };
                for (name, value) in steps {
                    self.plan_assignment(&mut plan, &VarRef::new(id, name), value, id, 0)?;
                }
                plan.assignments
            }
        };
        Ok(self.commit(assignments, target))
    }

    /// Apply actions in order; each one succeeds or fails on its own.
    pub fn process(&mut self, actions: &[Action]) -> Vec<Result<ActionOutcome, ActionError>> {
        actions.iter().map(|action| self.apply_action(action)).collect()
    }

    /// The variable an action names (components use their primary variable).
    fn action_var(&mut self, target: &str) -> Result<(VarRef, Vec<usize>), ActionError> {
        let not_found = |reason: String| ActionError::TargetNotFound {
            target: target.to_string(),
            reason,
        };
        let resolved = self.lookup(target).map_err(|e| not_found(e.to_string()))?;
        if matches!(resolved, Target::Literal(_)) {
            return Err(ActionError::NotUpdatable {
                target: target.to_string(),
                reason: "names a bound value".to_string(),
            });
        }
        self.target_var(resolved, target)
            .map_err(|e| not_found(e.to_string()))
    }

    /// The component a named update is aimed at, looking through copies.
    fn action_component(&mut self, target: &str) -> Result<ComponentId, ActionError> {
        let id = self
            .component_id(target)
            .map_err(|e| ActionError::TargetNotFound {
                target: target.to_string(),
                reason: e.to_string(),
            })?;
        let Some(kind) = self.tree.kind(id) else {
            return Ok(id);
        };
        if !kind.is_transparent() {
            return Ok(id);
        }
        let mut edges = BTreeSet::new();
        let mut inner = Vec::new();
        self.flatten_into(id, &mut edges, &mut inner);
        match inner.as_slice() {
            [only] => Ok(*only),
            _ => Ok(id),
        }
    }

    // =========================================================================
    // PLANNING
    // =========================================================================

    /// The policy flag that vetoes changes through `owner`, if any.
    fn veto(&mut self, owner: ComponentId) -> Option<&'static str> {
        let table = kinds::spec(self.tree.kind(owner)?);
        kinds::POLICY_VARS.into_iter().find(|flag| {
            table.has_var(flag)
                && self
                    .resolve_var(&VarRef::new(owner, *flag))
                    .is_ok_and(|v| v.as_bool() == Some(true))
        })
    }

    fn veto_error(&self, plan: &Plan<'_>, owner: ComponentId, flag: &str) -> ActionError {
        let path = self
            .component_path(owner)
            .unwrap_or_else(|| owner.to_string());
        if owner == plan.component {
            ActionError::NotUpdatable {
                target: plan.target.to_string(),
                reason: format!("{path} is {flag}"),
            }
        } else {
            ActionError::Reverted {
                target: plan.target.to_string(),
                vetoed_by: path,
                reason: format!("component is {flag}"),
            }
        }
    }

    /// Current value of a variable as the plan would leave it.
    fn current_value(&mut self, plan: &Plan<'_>, var: &VarRef) -> Result<Value, ActionError> {
        if let Some(planned) = plan.assignments.get(var) {
            return Ok(planned.clone());
        }
        self.resolve_var(var).map_err(|e| ActionError::NotUpdatable {
            target: plan.target.to_string(),
            reason: e.to_string(),
        })
    }

    /// Coerce a value for an essential slot, keeping point dimensions.
    fn coerce_essential(&self, var: &VarRef, value: Value, target: &str) -> Result<Value, ActionError> {
        let invalid = |reason: String| ActionError::InvalidPayload {
            target: target.to_string(),
            reason,
        };
        let domain = self
            .tree
            .kind(var.component)
            .and_then(|kind| kinds::spec(kind).var(&var.name))
            .map_or(Domain::Any, |spec| match spec.source {
                VarSource::Attribute { domain, .. } => domain,
                _ => Domain::Any,
            });
        let value = domain.coerce(value).map_err(invalid)?;
        if domain == Domain::Point {
            let before = self
                .registry
                .essential(var)
                .and_then(Value::as_array)
                .map(<[Value]>::len);
            let after = value.as_array().map(<[Value]>::len);
            if let (Some(before), Some(after)) = (before, after) {
                if before != after {
                    return Err(invalid(format!(
                        "point has {before} coordinates, got {after}"
                    )));
                }
            }
        }
        Ok(value)
    }

    /// Push `desired` onto `var`, recursing through inverse definitions until
    /// essential variables are reached. `owner` is the component whose policy
    /// governs this hop.
    fn plan_assignment(
        &mut self,
        plan: &mut Plan<'_>,
        var: &VarRef,
        desired: Value,
        owner: ComponentId,
        hop: usize,
    ) -> Result<(), ActionError> {
        let target = plan.target;
        let not_updatable = |reason: String| ActionError::NotUpdatable {
            target: target.to_string(),
            reason,
        };
        if hop > self.config.max_inverse_hops {
            return Err(not_updatable(format!(
                "more than {} inverse hops",
                self.config.max_inverse_hops
            )));
        }
        if let Some(flag) = self.veto(owner) {
            return Err(self.veto_error(plan, owner, flag));
        }

        let (kind, scope, shadow_source, attribute) = {
            let component = self.tree.get(var.component).ok_or_else(|| {
                ActionError::TargetNotFound {
                    target: target.to_string(),
                    reason: format!("{var} no longer exists"),
                }
            })?;
            let attribute = kinds::spec(component.kind)
                .attribute_of(&var.name)
                .and_then(|a| component.attributes.get(a).cloned());
            (
                component.kind,
                component.reference_scope(),
                component.shadows(&var.name),
                attribute,
            )
        };

        // the shadow's own policy was checked above; the source's is not
        if let Some(source) = shadow_source {
            let source_var = VarRef::new(source, var.name.clone());
            return self.plan_assignment(plan, &source_var, desired, owner, hop + 1);
        }

        let Some(var_spec) = kinds::spec(kind).var(&var.name) else {
            return Err(not_updatable(format!("a {kind} has no '{}'", var.name)));
        };
        match var_spec.source {
            VarSource::Attribute { .. } if self.registry.essential(var).is_some() => {
                let value = self.coerce_essential(var, desired, target)?;
                plan.assignments.insert(var.clone(), value);
                Ok(())
            }
            VarSource::Attribute { .. } => match attribute {
                Some(AttributeValue::Reference(text)) => {
                    self.plan_through_reference(plan, scope, &text, desired, hop)
                }
                Some(AttributeValue::Expression { text, bindings }) => {
                    match bindings.get(text.trim()) {
                        Some(reference) => {
                            self.plan_through_reference(plan, scope, reference, desired, hop)
                        }
                        None => Err(not_updatable(format!(
                            "{} is computed by '{text}', which has no inverse",
                            self.describe(var)
                        ))),
                    }
                }
                Some(AttributeValue::Bound { var: bound, index }) => {
                    let desired = match index {
                        Some(i) => {
                            let current = self.current_value(plan, &bound)?;
                            replace_element(current, &[i + 1], desired).map_err(not_updatable)?
                        }
                        None => desired,
                    };
                    let owner = bound.component;
                    self.plan_assignment(plan, &bound, desired, owner, hop + 1)
                }
                Some(AttributeValue::References(list)) => {
                    let items = match desired {
                        Value::Array(items) if items.len() == list.len() => items,
                        other => {
                            return Err(ActionError::InvalidPayload {
                                target: target.to_string(),
                                reason: format!(
                                    "expected {} values, got {}",
                                    list.len(),
                                    other.type_name()
                                ),
                            });
                        }
                    };
                    for (text, item) in list.iter().zip(items) {
                        if !item.is_missing() {
                            self.plan_through_reference(plan, scope, text, item, hop)?;
                        }
                    }
                    Ok(())
                }
                _ => Err(not_updatable(format!(
                    "{} has no inverse",
                    self.describe(var)
                ))),
            },
            VarSource::Derived {
                deps,
                inverse: Some(inverse),
                ..
            } => {
                let mut edges = BTreeSet::new();
                let current = self
                    .dependency_values(var.component, scope, deps, &mut edges)
                    .map_err(|e| not_updatable(e.to_string()))?;
                let pushed = inverse(&desired, &current).map_err(|reason| {
                    ActionError::InvalidPayload {
                        target: target.to_string(),
                        reason,
                    }
                })?;
                for (dep, value) in deps.iter().zip(pushed) {
                    let Some(value) = value else {
                        continue;
                    };
                    match *dep {
                        DepSpec::Var(name) => {
                            let dep_var = VarRef::new(var.component, name);
                            self.plan_assignment(plan, &dep_var, value, owner, hop + 1)?;
                        }
                        DepSpec::ReferenceList { attribute, var: wanted } => {
                            self.plan_reference_list(
                                plan,
                                var.component,
                                scope,
                                attribute,
                                wanted,
                                value,
                                hop,
                            )?;
                        }
                        DepSpec::ChildVar { .. } => {
                            return Err(not_updatable(format!(
                                "{} depends on child components",
                                self.describe(var)
                            )));
                        }
                    }
                }
                Ok(())
            }
            VarSource::Derived { inverse: None, .. } | VarSource::Governing => Err(not_updatable(
                format!("{} has no inverse", self.describe(var)),
            )),
        }
    }

    /// Follow a reference attribute to the variable it names. The referenced
    /// component's policy governs the next hop.
    fn plan_through_reference(
        &mut self,
        plan: &mut Plan<'_>,
        scope: ScopeId,
        text: &str,
        desired: Value,
        hop: usize,
    ) -> Result<(), ActionError> {
        let mut edges = BTreeSet::new();
        let parsed = crate::namespace::Reference::parse(text).map_err(|e| {
            ActionError::TargetNotFound {
                target: plan.target.to_string(),
                reason: e.to_string(),
            }
        })?;
        let target = self
            .resolve_target(scope, &parsed, text, &mut edges)
            .map_err(|e| ActionError::TargetNotFound {
                target: plan.target.to_string(),
                reason: e.into_resolve_error(text).to_string(),
            })?;
        let (var, indices) = match target {
            Target::Var { var, indices } => (var, indices),
            Target::Component(id) => match self.component_var(id, None, &mut edges) {
                Some(var) => (var, Vec::new()),
                None => {
                    return Err(ActionError::NotUpdatable {
                        target: plan.target.to_string(),
                        reason: format!("{text} has no value to change"),
                    });
                }
            },
            Target::Literal(_) => {
                return Err(ActionError::NotUpdatable {
                    target: plan.target.to_string(),
                    reason: format!("{text} is a bound value"),
                });
            }
        };
        let desired = if indices.is_empty() {
            desired
        } else {
            let current = self.current_value(plan, &var)?;
            replace_element(current, &indices, desired).map_err(|reason| {
                ActionError::InvalidPayload {
                    target: plan.target.to_string(),
                    reason,
                }
            })?
        };
        let owner = var.component;
        self.plan_assignment(plan, &var, desired, owner, hop + 1)
    }

    /// Split an array over the components of a reference-list attribute.
    #[allow(clippy::too_many_arguments)]
    fn plan_reference_list(
        &mut self,
        plan: &mut Plan<'_>,
        component: ComponentId,
        scope: ScopeId,
        attribute: &str,
        wanted: &str,
        desired: Value,
        hop: usize,
    ) -> Result<(), ActionError> {
        let texts = self
            .reference_list(component, attribute)
            .map_err(|e| ActionError::NotUpdatable {
                target: plan.target.to_string(),
                reason: e.to_string(),
            })?;
        let items = match desired {
            Value::Array(items) if items.len() == texts.len() => items,
            other => {
                return Err(ActionError::InvalidPayload {
                    target: plan.target.to_string(),
                    reason: format!(
                        "expected {} values, got {}",
                        texts.len(),
                        other.type_name()
                    ),
                });
            }
        };
        for (text, item) in texts.iter().zip(items) {
            if item.is_missing() {
                continue;
            }
            let mut edges = BTreeSet::new();
            let (var, indices) = self
                .referenced_var(scope, text, wanted, &mut edges)
                .map_err(|e| ActionError::TargetNotFound {
                    target: plan.target.to_string(),
                    reason: e.to_string(),
                })?;
            let item = if indices.is_empty() {
                item
            } else {
                let current = self.current_value(plan, &var)?;
                replace_element(current, &indices, item).map_err(|reason| {
                    ActionError::InvalidPayload {
                        target: plan.target.to_string(),
                        reason,
                    }
                })?
            };
            let owner = var.component;
            self.plan_assignment(plan, &var, item, owner, hop + 1)?;
        }
        Ok(())
    }

    // =========================================================================
    // COMMIT
    // =========================================================================

    fn commit(&mut self, assignments: BTreeMap<VarRef, Value>, target: &str) -> ActionOutcome {
        let tolerance = self.config.numeric_tolerance;
        let before: BTreeSet<ComponentId> = self.tree.ids().collect();
        let mut changed = Vec::new();
        for (var, value) in assignments {
            let same = self
                .registry
                .essential(&var)
                .is_some_and(|current| current.approx_eq(&value, tolerance));
            if !same && self.registry.set_essential(&var, value) {
                changed.push(var);
            }
        }
        if changed.is_empty() {
            debug!(target, "action changed nothing");
            return ActionOutcome::default();
        }

        self.registry.take_invalidated();
        self.registry.invalidate(changed.iter());
        self.settle();
        // includes whatever re-expansion staled while settling
        let stale = self.registry.take_invalidated();

        let mut affected: BTreeSet<ComponentId> = stale.iter().map(|v| v.component).collect();
        affected.extend(self.tree.ids().filter(|id| !before.contains(id)));
        let affected: BTreeSet<String> = affected
            .into_iter()
            .filter_map(|id| self.component_path(id))
            .collect();
        let changed: Vec<String> = changed.iter().map(|v| self.describe(v)).collect();
        info!(
            target,
            changed = changed.len(),
            affected = affected.len(),
            "action applied"
        );
        ActionOutcome {
            changed,
            affected: affected.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::ComponentKind;
    use crate::spec::ComponentSpec;

    fn point(name: &str, x: f64, y: f64) -> ComponentSpec {
        ComponentSpec::new(ComponentKind::Point)
            .named(name)
            .attr("coords", AttributeValue::Literal(Value::point(x, y)))
    }

    fn doc(children: Vec<ComponentSpec>) -> Document {
        Document::new(&ComponentSpec::new(ComponentKind::Document).with_children(children))
            .expect("build")
    }

    #[test]
    fn set_essential_value_assigns_directly() {
        let mut d = doc(vec![point("P", 1.0, 2.0)]);
        let outcome = d
            .apply_action(&Action::SetEssentialValue {
                target: "$P.coords".into(),
                value: Value::point(3.0, 3.0),
            })
            .expect("apply");
        assert_eq!(outcome.changed, vec!["/P.coords".to_string()]);
        assert!(outcome.affected.contains(&"/P".to_string()));
        assert_eq!(d.value("$P.x").expect("x"), Value::Number(3.0));
    }

    #[test]
    fn derived_variable_is_not_essential() {
        let mut d = doc(vec![point("P", 1.0, 2.0)]);
        let result = d.apply_action(&Action::SetEssentialValue {
            target: "$P.x".into(),
            value: Value::Number(3.0),
        });
        assert!(matches!(result, Err(ActionError::NotUpdatable { .. })));
    }

    #[test]
    fn set_value_inverts_coordinate() {
        let mut d = doc(vec![point("P", 1.0, 2.0)]);
        d.apply_action(&Action::SetValue {
            target: "$P.y".into(),
            value: Value::Number(-4.0),
        })
        .expect("apply");
        assert_eq!(d.value("$P.coords").expect("coords"), Value::point(1.0, -4.0));
    }

    #[test]
    fn value_follows_reference_to_source() {
        let mut d = doc(vec![
            ComponentSpec::new(ComponentKind::NumberInput).named("n"),
            ComponentSpec::new(ComponentKind::Number)
                .named("m")
                .attr("value", AttributeValue::reference("$n")),
        ]);
        d.apply_action(&Action::SetValue {
            target: "$m".into(),
            value: Value::Number(6.0),
        })
        .expect("apply");
        assert_eq!(d.value("$n").expect("n"), Value::Number(6.0));
    }

    #[test]
    fn disabled_input_rejects_updates() {
        let mut d = doc(vec![ComponentSpec::new(ComponentKind::NumberInput)
            .named("n")
            .attr("disabled", AttributeValue::Literal(Value::Bool(true)))]);
        let result = d.apply_action(&Action::update_value("$n", Value::Number(1.0)));
        assert!(matches!(result, Err(ActionError::NotUpdatable { .. })));
    }

    #[test]
    fn expression_without_inverse_is_not_updatable() {
        let mut d = doc(vec![
            ComponentSpec::new(ComponentKind::NumberInput).named("n"),
            ComponentSpec::new(ComponentKind::Number)
                .named("m")
                .attr("value", AttributeValue::expression("2 n", &[("n", "$n")])),
        ]);
        let result = d.apply_action(&Action::SetValue {
            target: "$m".into(),
            value: Value::Number(6.0),
        });
        assert!(matches!(result, Err(ActionError::NotUpdatable { .. })));
    }

    #[test]
    fn repeated_assignment_is_a_noop() {
        let mut d = doc(vec![point("P", 1.0, 2.0)]);
        let action = Action::move_point("$P", 5.0, 5.0);
        assert!(!d.apply_action(&action).expect("first").is_noop());
        assert!(d.apply_action(&action).expect("second").is_noop());
    }

    #[test]
    fn toggle_flips_boolean_input() {
        let mut d = doc(vec![ComponentSpec::new(ComponentKind::BooleanInput).named("b")]);
        let toggle = Action::InvokeNamedUpdate {
            target: "$b".into(),
            update: "toggle".into(),
            args: BTreeMap::new(),
        };
        d.apply_action(&toggle).expect("toggle");
        assert_eq!(d.value("$b").expect("b"), Value::Bool(true));
        d.apply_action(&toggle).expect("toggle");
        assert_eq!(d.value("$b").expect("b"), Value::Bool(false));
    }

    #[test]
    fn point_dimension_is_kept() {
        let mut d = doc(vec![point("P", 1.0, 2.0)]);
        let result = d.apply_action(&Action::SetEssentialValue {
            target: "$P.coords".into(),
            value: Value::Array(vec![1.0.into(), 2.0.into(), 3.0.into()]),
        });
        assert!(matches!(result, Err(ActionError::InvalidPayload { .. })));
    }

    #[test]
    fn unknown_target_is_reported() {
        let mut d = doc(vec![point("P", 1.0, 2.0)]);
        let result = d.apply_action(&Action::move_point("$Q", 0.0, 0.0));
        assert!(matches!(result, Err(ActionError::TargetNotFound { .. })));
    }

    #[test]
    fn disposed_document_rejects_actions() {
        let mut d = doc(vec![point("P", 1.0, 2.0)]);
        d.dispose();
        assert_eq!(
            d.apply_action(&Action::move_point("$P", 0.0, 0.0)),
            Err(ActionError::Disposed)
        );
    }

    #[test]
    fn replace_element_is_one_based() {
        let v = Value::point(1.0, 2.0);
        assert_eq!(
            replace_element(v.clone(), &[2], Value::Number(9.0)),
            Ok(Value::point(1.0, 9.0))
        );
        assert!(replace_element(v, &[3], Value::Null).is_err());
    }
}
