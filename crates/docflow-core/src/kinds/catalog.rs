//! State-variable tables of every component kind.

use super::{ComponentKind, DefinitionInput, DepSpec, Domain, KindSpec, VarSource, VarSpec};
use crate::cas::ComparisonMode;
use crate::primitives::MAX_REPLACEMENTS;
use crate::types::{ResolveError, Value};

/// Behavior table of a kind.
#[must_use]
pub fn spec(kind: ComponentKind) -> &'static KindSpec {
    match kind {
        ComponentKind::Document => &DOCUMENT,
        ComponentKind::Section => &SECTION,
        ComponentKind::Graph => &GRAPH,
        ComponentKind::Group => &GROUP,
        ComponentKind::Point => &POINT,
        ComponentKind::Line => &LINE,
        ComponentKind::Intersection => &INTERSECTION,
        ComponentKind::Math => &MATH,
        ComponentKind::Number => &NUMBER,
        ComponentKind::Text => &TEXT,
        ComponentKind::Boolean => &BOOLEAN,
        ComponentKind::MathInput => &MATH_INPUT,
        ComponentKind::NumberInput => &NUMBER_INPUT,
        ComponentKind::TextInput => &TEXT_INPUT,
        ComponentKind::BooleanInput => &BOOLEAN_INPUT,
        ComponentKind::Sequence => &SEQUENCE,
        ComponentKind::Map => &MAP,
        ComponentKind::Collect => &COLLECT,
        ComponentKind::Copy => &COPY,
        ComponentKind::Conditional => &CONDITIONAL,
        ComponentKind::Case => &CASE,
        ComponentKind::Else => &ELSE,
    }
}

// =============================================================================
// DEFAULTS
// =============================================================================

fn null() -> Value {
    Value::Null
}

fn zero() -> Value {
    Value::Number(0.0)
}

fn one() -> Value {
    Value::Number(1.0)
}

fn ten() -> Value {
    Value::Number(10.0)
}

fn minus_ten() -> Value {
    Value::Number(-10.0)
}

fn origin() -> Value {
    Value::point(0.0, 0.0)
}

fn no() -> Value {
    Value::Bool(false)
}

fn yes() -> Value {
    Value::Bool(true)
}

fn empty_text() -> Value {
    Value::text("")
}

fn empty_math() -> Value {
    Value::Math(String::new())
}

fn numeric_mode() -> Value {
    Value::text(ComparisonMode::Numeric.name())
}

const fn attribute(name: &'static str, default: fn() -> Value, domain: Domain) -> VarSpec {
    VarSpec {
        name,
        source: VarSource::Attribute {
            attribute: name,
            default,
            domain,
        },
        public: true,
    }
}

const fn hidden_attribute(name: &'static str, default: fn() -> Value, domain: Domain) -> VarSpec {
    VarSpec {
        public: false,
        ..attribute(name, default, domain)
    }
}

// =============================================================================
// DEFINITIONS
// =============================================================================

fn identity(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    Ok(input.deps.first().cloned().unwrap_or_default())
}

fn identity_inverse(desired: &Value, _current: &[Value]) -> Result<Vec<Option<Value>>, String> {
    Ok(vec![Some(desired.clone())])
}

fn always_true(_input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    Ok(Value::Bool(true))
}

fn coordinate(input: &DefinitionInput<'_>, axis: usize) -> Result<Value, ResolveError> {
    match input.deps.first() {
        Some(Value::Array(items)) => Ok(items.get(axis).cloned().unwrap_or(Value::Missing)),
        Some(Value::Null) | None => Ok(Value::Null),
        Some(other) => Err(ResolveError::failed(format!(
            "coordinates must be an array, got {}",
            other.type_name()
        ))),
    }
}

fn point_x(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    coordinate(input, 0)
}

fn point_y(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    coordinate(input, 1)
}

fn coordinate_inverse(
    desired: &Value,
    current: &[Value],
    axis: usize,
) -> Result<Vec<Option<Value>>, String> {
    let n = desired
        .as_f64()
        .ok_or_else(|| format!("coordinate must be a number, got {}", desired.type_name()))?;
    let mut coords = current
        .first()
        .and_then(Value::as_array)
        .map(<[Value]>::to_vec)
        .unwrap_or_else(|| vec![Value::Number(0.0), Value::Number(0.0)]);
    if coords.len() <= axis {
        coords.resize(axis + 1, Value::Number(0.0));
    }
    coords[axis] = Value::Number(n);
    Ok(vec![Some(Value::Array(coords))])
}

fn point_x_inverse(desired: &Value, current: &[Value]) -> Result<Vec<Option<Value>>, String> {
    coordinate_inverse(desired, current, 0)
}

fn point_y_inverse(desired: &Value, current: &[Value]) -> Result<Vec<Option<Value>>, String> {
    coordinate_inverse(desired, current, 1)
}

/// The two defining points of a line, if both are known.
fn line_endpoints(points: &Value) -> Option<((f64, f64), (f64, f64))> {
    match points.as_array()? {
        [a, b] => Some((a.as_point()?, b.as_point()?)),
        _ => None,
    }
}

fn line_slope(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let Some(((x1, y1), (x2, y2))) = input.deps.first().and_then(line_endpoints) else {
        return Ok(Value::Null);
    };
    if (x2 - x1).abs() <= input.tolerance {
        return Ok(Value::Null);
    }
    Ok(Value::Number((y2 - y1) / (x2 - x1)))
}

fn line_intercept(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let Some(((x1, y1), (x2, y2))) = input.deps.first().and_then(line_endpoints) else {
        return Ok(Value::Null);
    };
    if (x2 - x1).abs() <= input.tolerance {
        return Ok(Value::Null);
    }
    let slope = (y2 - y1) / (x2 - x1);
    Ok(Value::Number(y1 - slope * x1))
}

fn line_equation(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let Some(((x1, y1), (x2, y2))) = input.deps.first().and_then(line_endpoints) else {
        return Ok(Value::Null);
    };
    // a x + b y = c
    let a = y2 - y1;
    let b = x1 - x2;
    let c = a * x1 + b * y1;
    Ok(Value::Math(format!("{a} x + {b} y = {c}")))
}

fn intersection_coords(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let objects = input.deps.first().and_then(Value::as_array).unwrap_or(&[]);
    if objects.len() > 2 {
        return Err(ResolveError::UnimplementedCombination {
            what: format!("intersection of {} objects", objects.len()),
        });
    }
    let [first, second] = objects else {
        return Ok(Value::Null);
    };
    let (Some(((x1, y1), (x2, y2))), Some(((x3, y3), (x4, y4)))) =
        (line_endpoints(first), line_endpoints(second))
    else {
        return Ok(Value::Null);
    };
    let denominator = (x1 - x2) * (y3 - y4) - (y1 - y2) * (x3 - x4);
    if denominator.abs() <= input.tolerance {
        return Ok(Value::Null);
    }
    let d1 = x1 * y2 - y1 * x2;
    let d2 = x3 * y4 - y3 * x4;
    let x = (d1 * (x3 - x4) - (x1 - x2) * d2) / denominator;
    let y = (d1 * (y3 - y4) - (y1 - y2) * d2) / denominator;
    Ok(Value::point(x, y))
}

fn count(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let n = input.deps.first().and_then(Value::as_array).map_or(0, <[Value]>::len);
    Ok(Value::Number(n as f64))
}

fn count_present(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let n = input
        .deps
        .first()
        .and_then(Value::as_array)
        .map_or(0, |items| items.iter().filter(|v| !v.is_missing()).count());
    Ok(Value::Number(n as f64))
}

fn as_text(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    Ok(Value::Text(
        input.deps.first().map(Value::to_string).unwrap_or_default(),
    ))
}

fn sequence_values(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let number = |i: usize| input.deps.get(i).and_then(Value::as_f64);
    let from = number(0).unwrap_or(1.0);
    let step = number(3).unwrap_or(1.0);
    if !from.is_finite() || !step.is_finite() {
        return Err(ResolveError::failed("sequence bounds must be finite"));
    }
    let length = match (number(1), number(2)) {
        (Some(length), _) => length.round(),
        (None, Some(to)) => {
            if step.abs() <= input.tolerance {
                return Err(ResolveError::failed("sequence step must not be zero"));
            }
            ((to - from) / step + input.tolerance).floor() + 1.0
        }
        (None, None) => return Err(ResolveError::failed("sequence needs a length or a to")),
    };
    if !length.is_finite() {
        return Err(ResolveError::failed("sequence length must be finite"));
    }
    if length <= 0.0 {
        return Ok(Value::Array(Vec::new()));
    }
    if length > MAX_REPLACEMENTS as f64 {
        return Err(ResolveError::failed(format!(
            "too many replacements: sequence of length {length}"
        )));
    }
    let values = (0..length as usize)
        .map(|i| Value::Number(from + step * i as f64))
        .collect();
    Ok(Value::Array(values))
}

fn is_correct(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let (Some(response), Some(answer)) = (input.deps.first(), input.deps.get(1)) else {
        return Ok(Value::Bool(false));
    };
    let response = response.to_expression_text();
    let answer = answer.to_expression_text();
    if response.trim().is_empty() || answer.trim().is_empty() {
        return Ok(Value::Bool(false));
    }
    let mode = input
        .deps
        .get(2)
        .and_then(Value::as_text)
        .and_then(ComparisonMode::from_name)
        .unwrap_or(ComparisonMode::Numeric);
    input
        .cas
        .compare(&response, &answer, mode)
        .map(Value::Bool)
        .map_err(|e| ResolveError::failed(e.to_string()))
}

fn first_true_branch(input: &DefinitionInput<'_>) -> Result<Value, ResolveError> {
    let conditions = input.deps.first().and_then(Value::as_array).unwrap_or(&[]);
    let branch = conditions
        .iter()
        .position(|c| c.as_bool() == Some(true))
        .map_or(0, |i| i + 1);
    Ok(Value::Number(branch as f64))
}

// =============================================================================
// TABLES
// =============================================================================

const IDENTITY_OF_VALUE: VarSource = VarSource::Derived {
    deps: &[DepSpec::Var("value")],
    definition: identity,
    inverse: Some(identity_inverse),
};

static DOCUMENT: KindSpec = KindSpec {
    kind: ComponentKind::Document,
    vars: &[attribute("title", empty_text, Domain::Text)],
    primary: None,
    governing: None,
    updates: &[],
};

static SECTION: KindSpec = KindSpec {
    kind: ComponentKind::Section,
    vars: &[attribute("title", empty_text, Domain::Text)],
    primary: None,
    governing: None,
    updates: &[],
};

static GRAPH: KindSpec = KindSpec {
    kind: ComponentKind::Graph,
    vars: &[
        attribute("xmin", minus_ten, Domain::Number),
        attribute("xmax", ten, Domain::Number),
        attribute("ymin", minus_ten, Domain::Number),
        attribute("ymax", ten, Domain::Number),
        VarSpec {
            name: "pointCoords",
            source: VarSource::Derived {
                deps: &[DepSpec::ChildVar {
                    kinds: &[ComponentKind::Point, ComponentKind::Intersection],
                    var: "coords",
                }],
                definition: identity,
                inverse: None,
            },
            public: true,
        },
        VarSpec {
            name: "numPoints",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("pointCoords")],
                definition: count_present,
                inverse: None,
            },
            public: true,
        },
    ],
    primary: None,
    governing: None,
    updates: &[],
};

static GROUP: KindSpec = KindSpec {
    kind: ComponentKind::Group,
    vars: &[],
    primary: None,
    governing: None,
    updates: &[],
};

static POINT: KindSpec = KindSpec {
    kind: ComponentKind::Point,
    vars: &[
        attribute("coords", origin, Domain::Point),
        VarSpec {
            name: "x",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("coords")],
                definition: point_x,
                inverse: Some(point_x_inverse),
            },
            public: true,
        },
        VarSpec {
            name: "y",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("coords")],
                definition: point_y,
                inverse: Some(point_y_inverse),
            },
            public: true,
        },
        attribute("fixed", no, Domain::Bool),
        attribute("label", empty_text, Domain::Text),
    ],
    primary: Some("coords"),
    governing: None,
    updates: &["movePoint"],
};

static LINE: KindSpec = KindSpec {
    kind: ComponentKind::Line,
    vars: &[
        VarSpec {
            name: "points",
            source: VarSource::Derived {
                deps: &[DepSpec::ReferenceList {
                    attribute: "through",
                    var: "coords",
                }],
                definition: identity,
                inverse: Some(identity_inverse),
            },
            public: true,
        },
        VarSpec {
            name: "slope",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("points")],
                definition: line_slope,
                inverse: None,
            },
            public: true,
        },
        VarSpec {
            name: "yIntercept",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("points")],
                definition: line_intercept,
                inverse: None,
            },
            public: true,
        },
        VarSpec {
            name: "equation",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("points")],
                definition: line_equation,
                inverse: None,
            },
            public: true,
        },
        attribute("fixed", no, Domain::Bool),
    ],
    primary: Some("points"),
    governing: None,
    updates: &["moveLine"],
};

static INTERSECTION: KindSpec = KindSpec {
    kind: ComponentKind::Intersection,
    vars: &[
        VarSpec {
            name: "objects",
            source: VarSource::Derived {
                deps: &[DepSpec::ReferenceList {
                    attribute: "of",
                    var: "points",
                }],
                definition: identity,
                inverse: None,
            },
            public: false,
        },
        VarSpec {
            name: "coords",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("objects")],
                definition: intersection_coords,
                inverse: None,
            },
            public: true,
        },
    ],
    primary: Some("coords"),
    governing: None,
    updates: &[],
};

static MATH: KindSpec = KindSpec {
    kind: ComponentKind::Math,
    vars: &[
        attribute("value", empty_math, Domain::Math),
        VarSpec {
            name: "text",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("value")],
                definition: as_text,
                inverse: None,
            },
            public: true,
        },
    ],
    primary: Some("value"),
    governing: None,
    updates: &[],
};

static NUMBER: KindSpec = KindSpec {
    kind: ComponentKind::Number,
    vars: &[attribute("value", zero, Domain::Number)],
    primary: Some("value"),
    governing: None,
    updates: &[],
};

static TEXT: KindSpec = KindSpec {
    kind: ComponentKind::Text,
    vars: &[attribute("value", empty_text, Domain::Text)],
    primary: Some("value"),
    governing: None,
    updates: &[],
};

static BOOLEAN: KindSpec = KindSpec {
    kind: ComponentKind::Boolean,
    vars: &[attribute("value", no, Domain::Bool)],
    primary: Some("value"),
    governing: None,
    updates: &[],
};

static MATH_INPUT: KindSpec = KindSpec {
    kind: ComponentKind::MathInput,
    vars: &[
        attribute("value", empty_math, Domain::Math),
        VarSpec {
            name: "immediateValue",
            source: IDENTITY_OF_VALUE,
            public: true,
        },
        hidden_attribute("correctAnswer", empty_math, Domain::Math),
        hidden_attribute("comparisonMode", numeric_mode, Domain::Text),
        VarSpec {
            name: "isCorrect",
            source: VarSource::Derived {
                deps: &[
                    DepSpec::Var("value"),
                    DepSpec::Var("correctAnswer"),
                    DepSpec::Var("comparisonMode"),
                ],
                definition: is_correct,
                inverse: None,
            },
            public: true,
        },
        attribute("disabled", no, Domain::Bool),
    ],
    primary: Some("value"),
    governing: None,
    updates: &["updateValue", "updateImmediateValue"],
};

static NUMBER_INPUT: KindSpec = KindSpec {
    kind: ComponentKind::NumberInput,
    vars: &[
        attribute("value", zero, Domain::Number),
        VarSpec {
            name: "immediateValue",
            source: IDENTITY_OF_VALUE,
            public: true,
        },
        attribute("disabled", no, Domain::Bool),
    ],
    primary: Some("value"),
    governing: None,
    updates: &["updateValue", "updateImmediateValue"],
};

static TEXT_INPUT: KindSpec = KindSpec {
    kind: ComponentKind::TextInput,
    vars: &[
        attribute("value", empty_text, Domain::Text),
        VarSpec {
            name: "immediateValue",
            source: IDENTITY_OF_VALUE,
            public: true,
        },
        attribute("disabled", no, Domain::Bool),
    ],
    primary: Some("value"),
    governing: None,
    updates: &["updateValue", "updateImmediateValue"],
};

static BOOLEAN_INPUT: KindSpec = KindSpec {
    kind: ComponentKind::BooleanInput,
    vars: &[
        attribute("value", no, Domain::Bool),
        attribute("disabled", no, Domain::Bool),
    ],
    primary: Some("value"),
    governing: None,
    updates: &["updateValue", "toggle"],
};

static SEQUENCE: KindSpec = KindSpec {
    kind: ComponentKind::Sequence,
    vars: &[
        attribute("from", one, Domain::Number),
        attribute("length", null, Domain::Number),
        attribute("to", null, Domain::Number),
        attribute("step", one, Domain::Number),
        VarSpec {
            name: "values",
            source: VarSource::Derived {
                deps: &[
                    DepSpec::Var("from"),
                    DepSpec::Var("length"),
                    DepSpec::Var("to"),
                    DepSpec::Var("step"),
                ],
                definition: sequence_values,
                inverse: None,
            },
            public: true,
        },
        VarSpec {
            name: "count",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("values")],
                definition: count,
                inverse: None,
            },
            public: true,
        },
    ],
    primary: Some("values"),
    governing: Some("values"),
    updates: &[],
};

static MAP: KindSpec = KindSpec {
    kind: ComponentKind::Map,
    vars: &[
        VarSpec {
            name: "sourceItems",
            source: VarSource::Governing,
            public: false,
        },
        VarSpec {
            name: "count",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("sourceItems")],
                definition: count,
                inverse: None,
            },
            public: true,
        },
    ],
    primary: None,
    governing: Some("sourceItems"),
    updates: &[],
};

static COLLECT: KindSpec = KindSpec {
    kind: ComponentKind::Collect,
    vars: &[
        VarSpec {
            name: "collected",
            source: VarSource::Governing,
            public: false,
        },
        VarSpec {
            name: "count",
            source: VarSource::Derived {
                deps: &[DepSpec::Var("collected")],
                definition: count,
                inverse: None,
            },
            public: true,
        },
    ],
    primary: None,
    governing: Some("collected"),
    updates: &[],
};

static COPY: KindSpec = KindSpec {
    kind: ComponentKind::Copy,
    vars: &[
        VarSpec {
            name: "target",
            source: VarSource::Governing,
            public: false,
        },
        hidden_attribute("link", yes, Domain::Bool),
    ],
    primary: None,
    governing: Some("target"),
    updates: &[],
};

static CONDITIONAL: KindSpec = KindSpec {
    kind: ComponentKind::Conditional,
    vars: &[VarSpec {
        name: "selectedBranch",
        source: VarSource::Derived {
            deps: &[DepSpec::ChildVar {
                kinds: &[ComponentKind::Case, ComponentKind::Else],
                var: "condition",
            }],
            definition: first_true_branch,
            inverse: None,
        },
        public: true,
    }],
    primary: None,
    governing: Some("selectedBranch"),
    updates: &[],
};

static CASE: KindSpec = KindSpec {
    kind: ComponentKind::Case,
    vars: &[hidden_attribute("condition", no, Domain::Bool)],
    primary: None,
    governing: None,
    updates: &[],
};

static ELSE: KindSpec = KindSpec {
    kind: ComponentKind::Else,
    vars: &[VarSpec {
        name: "condition",
        source: VarSource::Derived {
            deps: &[],
            definition: always_true,
            inverse: None,
        },
        public: false,
    }],
    primary: None,
    governing: None,
    updates: &[],
};

// =============================================================================
// TESTS
// =============================================================================
