//! # Component Kinds
//!
//! The closed set of component kinds and their data-driven behavior.
//!
//! Each kind is described by a [`KindSpec`]: a table of state-variable specs
//! (attribute-backed, derived with an optional inverse, or governing for
//! composites) plus the named updates it accepts. The resolver and the
//! propagator dispatch on the kind tag into these tables; there is no
//! per-kind code outside `catalog` and `updates`.

mod catalog;
pub mod updates;

use crate::cas::Cas;
use crate::types::{ResolveError, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use catalog::spec;

// =============================================================================
// COMPONENT KIND
// =============================================================================

/// Tag of a component, as produced by the markup parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentKind {
    Document,
    Section,
    Graph,
    Group,
    Point,
    Line,
    Intersection,
    Math,
    Number,
    Text,
    Boolean,
    MathInput,
    NumberInput,
    TextInput,
    BooleanInput,
    Sequence,
    Map,
    Collect,
    Copy,
    Conditional,
    Case,
    Else,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 22] = [
        Self::Document,
        Self::Section,
        Self::Graph,
        Self::Group,
        Self::Point,
        Self::Line,
        Self::Intersection,
        Self::Math,
        Self::Number,
        Self::Text,
        Self::Boolean,
        Self::MathInput,
        Self::NumberInput,
        Self::TextInput,
        Self::BooleanInput,
        Self::Sequence,
        Self::Map,
        Self::Collect,
        Self::Copy,
        Self::Conditional,
        Self::Case,
        Self::Else,
    ];

    /// Tag name as written in markup.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Section => "section",
            Self::Graph => "graph",
            Self::Group => "group",
            Self::Point => "point",
            Self::Line => "line",
            Self::Intersection => "intersection",
            Self::Math => "math",
            Self::Number => "number",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::MathInput => "mathInput",
            Self::NumberInput => "numberInput",
            Self::TextInput => "textInput",
            Self::BooleanInput => "booleanInput",
            Self::Sequence => "sequence",
            Self::Map => "map",
            Self::Collect => "collect",
            Self::Copy => "copy",
            Self::Conditional => "conditionalContent",
            Self::Case => "case",
            Self::Else => "else",
        }
    }

    /// Parse a tag name (case-insensitive).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Composites expand into replacements instead of rendering themselves.
    #[must_use]
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Self::Sequence | Self::Map | Self::Collect | Self::Copy | Self::Conditional
        )
    }

    /// Kinds whose children are kept as templates rather than built.
    #[must_use]
    pub fn holds_template(self) -> bool {
        matches!(self, Self::Map | Self::Case | Self::Else)
    }

    /// Kinds that are looked through when enumerating effective children.
    #[must_use]
    pub fn is_transparent(self) -> bool {
        matches!(self, Self::Group) || self.is_composite()
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// STATE VARIABLE SPECS
// =============================================================================

/// Value domain of an attribute-backed variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Number,
    Bool,
    Text,
    Math,
    Point,
    Any,
}

impl Domain {
    /// Coerce a value into this domain. `Null` is accepted everywhere.
    pub fn coerce(self, value: Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (Self::Any, v) => Ok(v),
            (Self::Number, v) => v
                .as_f64()
                .or_else(|| v.as_text().and_then(|t| t.trim().parse::<f64>().ok()))
                .map(Value::Number)
                .ok_or_else(|| format!("expected a number, got {}", v.type_name())),
            (Self::Bool, v) => v
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| format!("expected a boolean, got {}", v.type_name())),
            (Self::Text, Value::Text(t)) => Ok(Value::Text(t)),
            (Self::Text, v @ (Value::Number(_) | Value::Bool(_) | Value::Math(_))) => {
                Ok(Value::Text(v.to_string()))
            }
            (Self::Math, v @ (Value::Number(_) | Value::Math(_) | Value::Array(_))) => Ok(v),
            (Self::Math, Value::Text(t)) => Ok(Value::Math(t)),
            (Self::Point, Value::Array(items)) => {
                let coords = items
                    .into_iter()
                    .map(|item| {
                        item.as_f64()
                            .map(Value::Number)
                            .ok_or_else(|| format!("point coordinate is {}", item.type_name()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if coords.is_empty() {
                    return Err("point needs at least one coordinate".to_string());
                }
                Ok(Value::Array(coords))
            }
            (domain, v) => Err(format!("cannot use {} as {domain:?}", v.type_name())),
        }
    }
}

/// Inputs handed to a definition function.
pub struct DefinitionInput<'a> {
    /// Dependency values, in the order of the variable's `deps`.
    pub deps: &'a [Value],
    pub cas: &'a dyn Cas,
    pub tolerance: f64,
}

pub type DefinitionFn = fn(&DefinitionInput<'_>) -> Result<Value, ResolveError>;

/// Inverse definition: desired value plus current dependency values to the
/// desired values of those dependencies (`None` leaves one untouched).
pub type InverseFn = fn(&Value, &[Value]) -> Result<Vec<Option<Value>>, String>;

/// A dependency of a derived variable.
#[derive(Debug, Clone, Copy)]
pub enum DepSpec {
    /// Another variable of the same component.
    Var(&'static str),
    /// A variable of every effective child of the listed kinds, as an array.
    ChildVar {
        kinds: &'static [ComponentKind],
        var: &'static str,
    },
    /// A variable of every component named by a reference-list attribute.
    ReferenceList {
        attribute: &'static str,
        var: &'static str,
    },
}

/// Where a variable's value comes from.
#[derive(Clone, Copy)]
pub enum VarSource {
    /// Backed by an attribute. Literal or absent attributes make the variable
    /// essential; references and expressions make it derived.
    Attribute {
        attribute: &'static str,
        default: fn() -> Value,
        domain: Domain,
    },
    Derived {
        deps: &'static [DepSpec],
        definition: DefinitionFn,
        inverse: Option<InverseFn>,
    },
    /// The enumeration of a composite; computed by the reconciler.
    Governing,
}

/// One entry of a kind's state-variable table.
#[derive(Clone, Copy)]
pub struct VarSpec {
    pub name: &'static str,
    pub source: VarSource,
    /// Reported to the rendering layer.
    pub public: bool,
}

impl fmt::Debug for VarSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarSpec")
            .field("name", &self.name)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Behavior table of one component kind.
#[derive(Debug)]
pub struct KindSpec {
    pub kind: ComponentKind,
    pub vars: &'static [VarSpec],
    /// Variable used when a reference names the component itself.
    pub primary: Option<&'static str>,
    /// Governing variable of a composite.
    pub governing: Option<&'static str>,
    /// Named updates accepted by `invokeNamedUpdate`.
    pub updates: &'static [&'static str],
}

impl KindSpec {
    #[must_use]
    pub fn var(&self, name: &str) -> Option<&'static VarSpec> {
        self.vars.iter().find(|v| v.name == name)
    }

    #[must_use]
    pub fn has_var(&self, name: &str) -> bool {
        self.var(name).is_some()
    }

    /// Attribute names that back a variable of this kind.
    pub fn attribute_of(&self, var: &str) -> Option<&'static str> {
        match self.var(var)?.source {
            VarSource::Attribute { attribute, .. } => Some(attribute),
            _ => None,
        }
    }
}

/// Names of the policy flags that veto inverse assignments.
pub const POLICY_VARS: [&str; 2] = ["fixed", "disabled"];
