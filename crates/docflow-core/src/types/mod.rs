//! # Core Type Definitions
//!
//! This module contains the shared types of the docflow engine:
//! - Identifiers (`ComponentId`, `ScopeId`, `VarRef`)
//! - Values flowing through state variables (`Value`, `Resolution`)
//! - Error types (`ResolveError`, `ActionError`, `CasError`, `DocError`)
//!
//! ## Determinism Guarantees
//!
//! Identifiers implement `Ord` so every map in the engine can be a
//! `BTreeMap`/`BTreeSet` and iteration order never depends on hashing.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Stable identifier of a component instance inside one document session.
///
/// Ids are allocated sequentially and never reused within a session, so an id
/// that disappears (teardown) can never alias a newer component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentId(pub u64);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a namespace scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub u64);

/// Reference to one state variable: owning component plus variable name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub component: ComponentId,
    pub name: String,
}

impl VarRef {
    /// Create a new variable reference.
    #[must_use]
    pub fn new(component: ComponentId, name: impl Into<String>) -> Self {
        Self {
            component,
            name: name.into(),
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.name)
    }
}

// =============================================================================
// VALUE
// =============================================================================

/// A resolved state-variable value.
///
/// Points and vectors are `Array`s of numbers. `Missing` only appears as an
/// element of a partially computable array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// Opaque math expression text, interpreted only by the CAS collaborator.
    Math(String),
    Array(Vec<Value>),
    /// A reference to a live component (composite enumerations).
    Component(ComponentId),
    Missing,
}

impl Value {
    /// Build a two-dimensional point.
    #[must_use]
    pub fn point(x: f64, y: f64) -> Self {
        Self::Array(vec![Self::Number(x), Self::Number(y)])
    }

    /// Build a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Numeric view. Math text that is a plain number literal also counts.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Math(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Text(t) => match t.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) | Self::Math(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_component(&self) -> Option<ComponentId> {
        match self {
            Self::Component(id) => Some(*id),
            _ => None,
        }
    }

    /// Both coordinates of a two-dimensional point, if this is one.
    #[must_use]
    pub fn as_point(&self) -> Option<(f64, f64)> {
        match self.as_array()? {
            [x, y] => Some((x.as_f64()?, y.as_f64()?)),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Short type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Math(_) => "math",
            Self::Array(_) => "array",
            Self::Component(_) => "component",
            Self::Missing => "missing",
        }
    }

    /// Render the value as expression text for the CAS collaborator.
    #[must_use]
    pub fn to_expression_text(&self) -> String {
        match self {
            Self::Null | Self::Missing => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) if *n < 0.0 => format!("({n})"),
            Self::Number(n) => n.to_string(),
            Self::Text(t) => t.clone(),
            Self::Math(t) => format!("({t})"),
            Self::Array(items) => {
                let parts: Vec<String> = items.iter().map(Self::to_expression_text).collect();
                format!("({})", parts.join(", "))
            }
            Self::Component(id) => id.to_string(),
        }
    }

    /// Compare two values, treating numbers within `tolerance` as equal.
    #[must_use]
    pub fn approx_eq(&self, other: &Value, tolerance: f64) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                let scale = a.abs().max(b.abs()).max(1.0);
                (a - b).abs() <= tolerance * scale
            }
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.approx_eq(y, tolerance))
            }
            _ => self == other,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Missing => write!(f, "?"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(t) | Self::Math(t) => write!(f, "{t}"),
            Self::Array(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Self::Component(id) => write!(f, "{id}"),
        }
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Outcome of resolving one state variable, as reported to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "camelCase")]
pub enum Resolution {
    Value(Value),
    /// A defined "missing" state (e.g. a reference into a contracted composite).
    Unresolved(String),
    Error(ResolveError),
}

impl Resolution {
    /// Convert a resolver result into the externally visible form.
    #[must_use]
    pub fn from_result(result: Result<Value, ResolveError>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(e) if e.is_missing() => Self::Unresolved(e.to_string()),
            Err(e) => Self::Error(e),
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved(_))
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Failure of a single state-variable resolution.
///
/// These are stored per variable and never unwind into unrelated variables.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResolveError {
    /// The variable (transitively) depends on itself.
    #[error("cycle detected: {}", .chain.join(" -> "))]
    CycleDetected { chain: Vec<String> },

    /// A reference in a definition could not be resolved.
    #[error("unresolved reference '{reference}': {reason}")]
    UnresolvedReference {
        reference: String,
        reason: String,
        chain: Vec<String>,
    },

    /// A reference into a composite's expansion that no longer exists.
    #[error("missing replacement: {reference}")]
    MissingReplacement {
        reference: String,
        chain: Vec<String>,
    },

    /// The definition function rejected its inputs.
    #[error("definition of {var} failed: {message}")]
    DefinitionFailed {
        var: String,
        message: String,
        chain: Vec<String>,
    },

    /// A combination the engine does not implement; degrades to "no result".
    #[error("unimplemented combination: {what}")]
    UnimplementedCombination { what: String },
}

impl ResolveError {
    /// Definition failure with a message; context is filled in by the resolver.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::DefinitionFailed {
            var: String::new(),
            message: message.into(),
            chain: Vec::new(),
        }
    }

    /// Whether this error denotes a defined missing state rather than a fault.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingReplacement { .. })
    }

    /// The dependency chain recorded for this error.
    #[must_use]
    pub fn chain(&self) -> &[String] {
        match self {
            Self::CycleDetected { chain }
            | Self::UnresolvedReference { chain, .. }
            | Self::MissingReplacement { chain, .. }
            | Self::DefinitionFailed { chain, .. } => chain,
            Self::UnimplementedCombination { .. } => &[],
        }
    }

    /// Fill in the failing variable and chain if they are not set yet.
    #[must_use]
    pub fn with_context(mut self, at: &str, stack: &[String]) -> Self {
        match &mut self {
            Self::DefinitionFailed { var, chain, .. } => {
                if var.is_empty() {
                    *var = at.to_string();
                }
                if chain.is_empty() {
                    *chain = stack.to_vec();
                }
            }
            Self::UnresolvedReference { chain, .. } | Self::MissingReplacement { chain, .. } => {
                if chain.is_empty() {
                    *chain = stack.to_vec();
                }
            }
            Self::CycleDetected { .. } | Self::UnimplementedCombination { .. } => {}
        }
        self
    }
}

/// Failure of an external action. Actions never apply partially.
///
/// The JSON form carries the variant name under `"error"`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "camelCase")]
pub enum ActionError {
    /// The target has neither an essential slot nor an inverse definition,
    /// or the target itself vetoes the change.
    #[error("{target} is not updatable: {reason}")]
    NotUpdatable { target: String, reason: String },

    /// A constraint further down the inverse chain vetoed the action.
    #[error("action on {target} reverted: vetoed by {vetoed_by} ({reason})")]
    Reverted {
        target: String,
        vetoed_by: String,
        reason: String,
    },

    #[error("target not found: {target} ({reason})")]
    TargetNotFound { target: String, reason: String },

    #[error("unknown update '{update}' for {kind}")]
    UnknownUpdate { kind: String, update: String },

    #[error("invalid payload for {target}: {reason}")]
    InvalidPayload { target: String, reason: String },

    #[error("document has been disposed")]
    Disposed,
}

/// Failure reported by the CAS collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CasError {
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("unsupported value in context: {0}")]
    UnsupportedValue(String),
}

/// Errors of the public document API.
///
/// - No silent failures
/// - Use `Result<T, DocError>` for fallible operations
/// - The engine never panics on document input
#[derive(Debug, Error)]
pub enum DocError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous reference: {0}")]
    Ambiguous(String),

    #[error("invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("document has been disposed")]
    Disposed,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================
