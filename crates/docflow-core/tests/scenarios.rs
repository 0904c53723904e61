//! # Document Scenarios
//!
//! End-to-end behavior of a document session: actions in, resolved state out.
//!
//! ## Groups
//! - Propagation: inverse definitions and policy vetoes
//! - Reconciliation: replacement identity across re-expansion
//! - Shadowing: linked and unlinked copies of leaves, graphs and maps
//! - Failure containment: cycles, missing replacements, degraded operations

use docflow_core::{
    Action, ActionError, AttributeValue, ComponentKind, ComponentSpec, Document, ExpansionStatus,
    Resolution, ResolveError, Severity, Value,
};
use std::collections::BTreeMap;

fn point(name: &str, x: f64, y: f64) -> ComponentSpec {
    ComponentSpec::new(ComponentKind::Point)
        .named(name)
        .attr("coords", AttributeValue::Literal(Value::point(x, y)))
}

fn line(name: &str, through: &[&str]) -> ComponentSpec {
    ComponentSpec::new(ComponentKind::Line).named(name).attr(
        "through",
        AttributeValue::References(through.iter().map(|s| (*s).to_string()).collect()),
    )
}

fn fixed(spec: ComponentSpec) -> ComponentSpec {
    spec.attr("fixed", AttributeValue::Literal(Value::Bool(true)))
}

fn document(children: Vec<ComponentSpec>) -> Document {
    Document::new(&ComponentSpec::new(ComponentKind::Document).with_children(children))
        .expect("document builds")
}

fn number(d: &mut Document, reference: &str) -> f64 {
    d.value(reference)
        .expect("resolves")
        .as_f64()
        .expect("is a number")
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// Map over a sequence whose length is bound to the input `n`; each
/// iteration holds one draggable point `Q`.
fn map_of_points(n: f64) -> Document {
    document(vec![
        ComponentSpec::new(ComponentKind::NumberInput)
            .named("n")
            .attr("value", AttributeValue::number(n)),
        ComponentSpec::new(ComponentKind::Sequence)
            .named("s")
            .attr("length", AttributeValue::reference("$n")),
        ComponentSpec::new(ComponentKind::Map)
            .named("m")
            .attr("sources", AttributeValue::reference("$s"))
            .attr("alias", AttributeValue::Literal(Value::text("k")))
            .child(point("Q", 0.0, 0.0)),
    ])
}

/// Map over the values of `s` (length `$n`, starting at `$start`); each
/// iteration holds a number `twice` computed from the alias `k`, which is
/// bound to a plain number rather than a component.
fn map_of_doubles(n: f64) -> Vec<ComponentSpec> {
    vec![
        ComponentSpec::new(ComponentKind::NumberInput)
            .named("n")
            .attr("value", AttributeValue::number(n)),
        ComponentSpec::new(ComponentKind::NumberInput)
            .named("start")
            .attr("value", AttributeValue::number(1.0)),
        ComponentSpec::new(ComponentKind::Sequence)
            .named("s")
            .attr("from", AttributeValue::reference("$start"))
            .attr("length", AttributeValue::reference("$n")),
        ComponentSpec::new(ComponentKind::Map)
            .named("m")
            .attr("sources", AttributeValue::reference("$s.values"))
            .attr("alias", AttributeValue::Literal(Value::text("k")))
            .child(
                ComponentSpec::new(ComponentKind::Number)
                    .named("twice")
                    .attr("value", AttributeValue::expression("2 a", &[("a", "$k")])),
            ),
    ]
}

fn copy_of(name: &str, source: &str, link: bool) -> ComponentSpec {
    ComponentSpec::new(ComponentKind::Copy)
        .named(name)
        .attr("source", AttributeValue::reference(source))
        .attr("link", AttributeValue::Literal(Value::Bool(link)))
}

// =============================================================================
// PROPAGATION
// =============================================================================

mod propagation {
    use super::*;

    #[test]
    fn moving_an_endpoint_updates_the_line() {
        let mut d = document(vec![
            point("P1", 1.0, 2.0),
            point("P2", 3.0, 4.0),
            line("l", &["$P1", "$P2"]),
        ]);
        assert!(approx(number(&mut d, "$l.slope"), 1.0));

        let outcome = d
            .apply_action(&Action::move_point("$P1", 5.0, -5.0))
            .expect("move");
        assert!(outcome.affected.contains(&"/l".to_string()));

        assert!(approx(number(&mut d, "$l.slope"), -4.5));
        assert!(approx(number(&mut d, "$l.yIntercept"), 17.5));
        assert_eq!(d.value("$P2").expect("P2"), Value::point(3.0, 4.0));
    }

    #[test]
    fn moving_a_line_moves_both_points() {
        let mut d = document(vec![
            point("P1", 0.0, 0.0),
            point("P2", 1.0, 1.0),
            line("l", &["$P1", "$P2"]),
        ]);
        let action = Action::InvokeNamedUpdate {
            target: "$l".into(),
            update: "moveLine".into(),
            args: BTreeMap::from([
                ("point1".to_string(), Value::point(2.0, 2.0)),
                ("point2".to_string(), Value::point(4.0, 3.0)),
            ]),
        };
        let outcome = d.apply_action(&action).expect("move line");
        assert_eq!(outcome.changed, vec!["/P1.coords".to_string(), "/P2.coords".to_string()]);
        assert_eq!(d.value("$P1").expect("P1"), Value::point(2.0, 2.0));
        assert_eq!(d.value("$P2").expect("P2"), Value::point(4.0, 3.0));
        assert!(approx(number(&mut d, "$l.slope"), 0.5));
    }

    #[test]
    fn a_veto_anywhere_reverts_the_whole_action() {
        let mut d = document(vec![
            point("P1", 0.0, 0.0),
            fixed(point("P2", 1.0, 1.0)),
            line("l", &["$P1", "$P2"]),
        ]);
        let before = d.state_values();
        let action = Action::InvokeNamedUpdate {
            target: "$l".into(),
            update: "moveLine".into(),
            args: BTreeMap::from([
                ("point1".to_string(), Value::point(2.0, 2.0)),
                ("point2".to_string(), Value::point(4.0, 3.0)),
            ]),
        };
        let result = d.apply_action(&action);
        assert!(
            matches!(&result, Err(ActionError::Reverted { vetoed_by, .. }) if vetoed_by == "/P2"),
            "expected a revert, got {result:?}"
        );
        assert_eq!(d.value("$P1").expect("P1"), Value::point(0.0, 0.0));
        assert_eq!(d.state_values(), before);
    }

    #[test]
    fn fixed_point_rejects_a_move_its_copy_accepts() {
        let mut d = document(vec![
            fixed(point("P", 1.0, 1.0)),
            ComponentSpec::new(ComponentKind::Copy)
                .named("c")
                .attr("source", AttributeValue::reference("$P"))
                .attr("fixed", AttributeValue::Literal(Value::Bool(false))),
        ]);
        let rejected = d.apply_action(&Action::move_point("$P", 2.0, 2.0));
        assert!(matches!(rejected, Err(ActionError::NotUpdatable { .. })));
        assert_eq!(d.value("$P").expect("P"), Value::point(1.0, 1.0));

        d.apply_action(&Action::move_point("$c", 2.0, 2.0))
            .expect("copy accepts");
        assert_eq!(d.value("$P").expect("P"), Value::point(2.0, 2.0));
        assert_eq!(d.value("$c.coords").expect("c"), Value::point(2.0, 2.0));
    }

    #[test]
    fn repeated_action_is_idempotent() {
        let mut d = document(vec![
            point("P", 1.0, 2.0),
            point("O", 0.0, 0.0),
            line("l", &["$P", "$O"]),
        ]);
        let action = Action::SetEssentialValue {
            target: "$P.coords".into(),
            value: Value::point(4.0, 4.0),
        };
        d.apply_action(&action).expect("first");
        let once = d.state_values();
        let second = d.apply_action(&action).expect("second");
        assert!(second.is_noop());
        assert_eq!(d.state_values(), once);
    }

    #[test]
    fn inverse_reproduces_the_desired_value() {
        let mut d = document(vec![
            point("P", 1.0, 2.0),
            ComponentSpec::new(ComponentKind::Number)
                .named("px")
                .attr("value", AttributeValue::reference("$P.x")),
        ]);
        d.apply_action(&Action::SetValue {
            target: "$px".into(),
            value: Value::Number(-7.25),
        })
        .expect("set through reference");
        assert!(approx(number(&mut d, "$px"), -7.25));
        assert_eq!(d.value("$P").expect("P"), Value::point(-7.25, 2.0));
    }

    #[test]
    fn actions_run_in_order() {
        let mut d = document(vec![ComponentSpec::new(ComponentKind::NumberInput).named("n")]);
        let results = d.process(&[
            Action::update_value("$n", Value::Number(1.0)),
            Action::update_value("$nowhere", Value::Number(2.0)),
            Action::update_value("$n", Value::Number(3.0)),
        ]);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ActionError::TargetNotFound { .. })));
        assert!(results[2].is_ok());
        assert!(approx(number(&mut d, "$n"), 3.0));
    }
}

// =============================================================================
// RECONCILIATION
// =============================================================================

mod reconciliation {
    use super::*;

    #[test]
    fn dragged_points_survive_resizing() {
        let mut d = map_of_points(2.0);
        d.apply_action(&Action::move_point("$m[1]/Q", 5.0, 6.0))
            .expect("drag first");
        d.apply_action(&Action::move_point("$m[2]/Q", -1.0, 3.0))
            .expect("drag second");
        let first = d.component_id("$m[1]/Q").expect("first");

        let grown = d
            .apply_action(&Action::update_value("$n", Value::Number(4.0)))
            .expect("grow");
        assert!(grown.affected.iter().any(|p| p.starts_with("/m/")));
        assert_eq!(d.replacement_paths("$m").expect("paths").len(), 4);
        assert_eq!(d.value("$m[1]/Q").expect("Q1"), Value::point(5.0, 6.0));
        assert_eq!(d.value("$m[2]/Q").expect("Q2"), Value::point(-1.0, 3.0));
        assert_eq!(d.value("$m[4]/Q").expect("Q4"), Value::point(0.0, 0.0));

        d.apply_action(&Action::update_value("$n", Value::Number(2.0)))
            .expect("shrink");
        assert_eq!(d.replacement_paths("$m").expect("paths").len(), 2);
        assert_eq!(d.component_id("$m[1]/Q").expect("first"), first);
        assert_eq!(d.value("$m[1]/Q").expect("Q1"), Value::point(5.0, 6.0));
        assert_eq!(d.value("$m[2]/Q").expect("Q2"), Value::point(-1.0, 3.0));
        assert!(d.resolution("$m[3]/Q").expect("resolution").is_unresolved());
    }

    #[test]
    fn references_into_removed_replacements_are_unresolved() {
        let mut d = map_of_points(3.0);
        d.apply_action(&Action::update_value("$n", Value::Number(1.0)))
            .expect("shrink");
        assert!(d.resolution("$m[2]/Q.x").expect("resolution").is_unresolved());
        assert_eq!(d.value("$m[1]/Q.x").expect("x"), Value::Number(0.0));
    }

    #[test]
    fn failed_expansion_is_not_an_empty_one() {
        let mut d = document(vec![
            ComponentSpec::new(ComponentKind::Sequence)
                .named("broken")
                .attr("length", AttributeValue::reference("$nowhere")),
            ComponentSpec::new(ComponentKind::Conditional)
                .named("none")
                .child(
                    ComponentSpec::new(ComponentKind::Case)
                        .attr("condition", AttributeValue::Literal(Value::Bool(false)))
                        .child(ComponentSpec::new(ComponentKind::Text).named("msg")),
                ),
        ]);
        assert!(matches!(
            d.replacement_status("$broken").expect("status"),
            ExpansionStatus::Failed(_)
        ));
        assert_eq!(
            d.replacement_status("$none").expect("status"),
            ExpansionStatus::Expanded
        );
        assert!(d.replacement_paths("$none").expect("paths").is_empty());
        assert!(d.replacement_paths("$broken").expect("paths").is_empty());
    }

    #[test]
    fn rebound_iterations_are_reported_as_affected() {
        // `twice` has no edge to `start`; only the rebinding while settling
        // makes it stale
        let mut d = document(map_of_doubles(2.0));
        assert!(approx(number(&mut d, "$m[1]/twice"), 2.0));

        let outcome = d
            .apply_action(&Action::update_value("$start", Value::Number(5.0)))
            .expect("shift");
        assert!(
            outcome.affected.contains(&"/m/_group1/twice".to_string()),
            "affected: {:?}",
            outcome.affected
        );
        assert!(approx(number(&mut d, "$m[1]/twice"), 10.0));
    }

    #[test]
    fn replacement_names_are_reproducible() {
        let mut first = map_of_points(3.0);
        let mut second = map_of_points(3.0);
        assert_eq!(
            first.replacement_paths("$m").expect("paths"),
            second.replacement_paths("$m").expect("paths")
        );
    }
}

// =============================================================================
// SHADOWING
// =============================================================================

mod shadowing {
    use super::*;

    #[test]
    fn linked_copy_of_a_graph_mirrors_its_children() {
        let mut d = document(vec![
            ComponentSpec::new(ComponentKind::Graph).named("g").with_children([
                point("A", 1.0, 2.0),
                point("B", 3.0, 4.0),
                line("l", &["$A", "$B"]),
            ]),
            copy_of("c", "$g", true),
        ]);
        assert_eq!(d.value("/c/A").expect("A"), Value::point(1.0, 2.0));
        assert_eq!(d.value("/c/B").expect("B"), Value::point(3.0, 4.0));
        assert!(approx(number(&mut d, "/c/l.slope"), 1.0));

        d.apply_action(&Action::move_point("$A", 1.0, 0.0))
            .expect("move the source point");
        assert_eq!(d.value("/c/A").expect("A"), Value::point(1.0, 0.0));
        assert!(approx(number(&mut d, "/c/l.slope"), 2.0));

        let state = d.state_values();
        for path in ["/c/A", "/c/B", "/c/l"] {
            assert!(state.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn linked_copy_of_a_map_follows_its_iterations() {
        let mut children = map_of_doubles(2.0);
        children.push(copy_of("c", "$m", true));
        let mut d = document(children);
        assert_eq!(
            d.replacement_paths("$c").expect("paths"),
            vec!["/c/_group1", "/c/_group2"]
        );
        assert!(approx(number(&mut d, "/c/_group1/twice"), 2.0));
        assert!(approx(number(&mut d, "/c/_group2/twice"), 4.0));

        d.apply_action(&Action::update_value("$n", Value::Number(3.0)))
            .expect("grow");
        assert!(approx(number(&mut d, "/c/_group3/twice"), 6.0));

        let state = d.state_values();
        for path in ["/c/_group1/twice", "/c/_group2/twice", "/c/_group3/twice"] {
            assert!(state.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn unlinked_copy_of_a_map_keeps_iteration_scopes() {
        let mut children = map_of_doubles(2.0);
        children.push(copy_of("u", "$m", false));
        let mut d = document(children);
        assert!(approx(number(&mut d, "/u/_group1/twice"), 2.0));
        assert!(approx(number(&mut d, "/u/_group2/twice"), 4.0));

        let state = d.state_values();
        assert!(state.contains_key("/u/_group1/twice"));
        assert!(state.contains_key("/u/_group2/twice"));
        assert!(!state.contains_key("/u/twice"));
    }

    #[test]
    fn rendered_state_keeps_components_with_duplicate_paths() {
        let mut d = document(vec![point("P", 1.0, 1.0), point("P", 2.0, 2.0)]);
        let state = d.state_values();
        let points: Vec<&String> = state
            .keys()
            .filter(|key| key.starts_with("/P"))
            .collect();
        assert_eq!(points.len(), 2);
        assert!(state.contains_key("/P"));
    }

    #[test]
    fn unlinked_copy_of_linked_copy_is_detached() {
        let mut d = document(vec![
            point("A", 3.0, 4.0).attr("label", AttributeValue::Literal(Value::text("A"))),
            ComponentSpec::new(ComponentKind::Copy)
                .named("linked")
                .attr("source", AttributeValue::reference("$A")),
            ComponentSpec::new(ComponentKind::Copy)
                .named("frozen")
                .attr("source", AttributeValue::reference("$linked"))
                .attr("link", AttributeValue::Literal(Value::Bool(false))),
        ]);
        assert_eq!(d.value("$frozen.coords").expect("coords"), Value::point(3.0, 4.0));
        assert_eq!(d.value("$frozen.label").expect("label"), Value::text("A"));

        d.apply_action(&Action::move_point("$frozen", 9.0, 9.0))
            .expect("move the detached copy");
        assert_eq!(d.value("$A").expect("A"), Value::point(3.0, 4.0));

        d.apply_action(&Action::move_point("$A", 0.0, 1.0))
            .expect("move the source");
        assert_eq!(d.value("$linked.coords").expect("linked"), Value::point(0.0, 1.0));
        assert_eq!(d.value("$frozen.coords").expect("frozen"), Value::point(9.0, 9.0));
    }
}

// =============================================================================
// FAILURE CONTAINMENT
// =============================================================================

mod containment {
    use super::*;

    #[test]
    fn a_cycle_fails_only_its_members() {
        let mut d = document(vec![
            ComponentSpec::new(ComponentKind::Number)
                .named("a")
                .attr("value", AttributeValue::reference("$b")),
            ComponentSpec::new(ComponentKind::Number)
                .named("b")
                .attr("value", AttributeValue::reference("$a")),
            ComponentSpec::new(ComponentKind::Number)
                .named("c")
                .attr("value", AttributeValue::number(5.0)),
            ComponentSpec::new(ComponentKind::Number)
                .named("d")
                .attr("value", AttributeValue::reference("$c")),
        ]);
        assert!(matches!(
            d.resolution("$a").expect("resolution"),
            Resolution::Error(ResolveError::CycleDetected { .. })
        ));
        assert_eq!(d.value("$d").expect("d"), Value::Number(5.0));
        assert!(
            d.diagnostics()
                .iter()
                .any(|diag| diag.severity == Severity::Error)
        );
    }

    #[test]
    fn intersection_of_three_lines_degrades_to_null() {
        let mut d = document(vec![
            point("A", 0.0, 0.0),
            point("B", 1.0, 1.0),
            point("C", 0.0, 1.0),
            point("D", 1.0, 0.0),
            line("l1", &["$A", "$B"]),
            line("l2", &["$C", "$D"]),
            line("l3", &["$A", "$C"]),
            ComponentSpec::new(ComponentKind::Intersection).named("X").attr(
                "of",
                AttributeValue::References(vec!["$l1".into(), "$l2".into(), "$l3".into()]),
            ),
        ]);
        assert_eq!(d.value("$X").expect("X"), Value::Null);
        assert!(
            d.diagnostics()
                .iter()
                .any(|diag| diag.severity == Severity::Warning)
        );
    }

    #[test]
    fn intersection_of_two_lines() {
        let mut d = document(vec![
            point("A", 0.0, 0.0),
            point("B", 2.0, 2.0),
            point("C", 0.0, 2.0),
            point("D", 2.0, 0.0),
            line("l1", &["$A", "$B"]),
            line("l2", &["$C", "$D"]),
            ComponentSpec::new(ComponentKind::Intersection).named("X").attr(
                "of",
                AttributeValue::References(vec!["$l1".into(), "$l2".into()]),
            ),
        ]);
        assert_eq!(d.value("$X").expect("X"), Value::point(1.0, 1.0));
        d.apply_action(&Action::move_point("$B", 2.0, 4.0))
            .expect("move");
        let moved = d.value("$X").expect("X");
        let coords = moved.as_array().expect("a point");
        assert!(approx(coords[0].as_f64().expect("x"), 2.0 / 3.0));
        assert!(approx(coords[1].as_f64().expect("y"), 4.0 / 3.0));
    }
}

// =============================================================================
// ESSENTIAL STATE
// =============================================================================

mod essential_state {
    use super::*;
    use docflow_core::{snapshot_from_bytes, snapshot_to_bytes};

    #[test]
    fn restore_rebuilds_expansions_and_dragged_state() {
        let mut d = map_of_points(2.0);
        d.apply_action(&Action::update_value("$n", Value::Number(3.0)))
            .expect("grow");
        d.apply_action(&Action::move_point("$m[3]/Q", 7.0, 7.0))
            .expect("drag");
        let snapshot = d.export_essential_state().expect("export");
        let bytes = snapshot_to_bytes(&snapshot).expect("encode");

        let mut fresh = map_of_points(2.0);
        let report = fresh
            .restore_essential_state(&snapshot_from_bytes(&bytes).expect("decode"))
            .expect("restore");
        assert!(report.skipped.is_empty());
        assert_eq!(fresh.value("$m[3]/Q").expect("Q3"), Value::point(7.0, 7.0));
        assert_eq!(fresh.state_values(), d.state_values());
    }
}
