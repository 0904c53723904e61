//! # Component Tree Contract
//!
//! The data handed over by the markup parser: a tree of component specs whose
//! attribute values are already split into literals, references and CAS
//! expressions. The engine parses references, never markup.

use crate::kinds::ComponentKind;
use crate::types::{Value, VarRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Line/column range in the original markup (1-based, end inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpan {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// Value of one attribute as delivered by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeValue {
    /// A constant. Seeds the essential slot of the attribute's variable.
    Literal(Value),
    /// A reference such as `$P`, `$P.coords[1]` or `$m[2]/Q.x`.
    Reference(String),
    /// Several references (e.g. the points a line passes through).
    References(Vec<String>),
    /// A CAS expression; each binding maps a variable name to a reference.
    Expression {
        text: String,
        #[serde(default)]
        bindings: BTreeMap<String, String>,
    },
    /// Plain names (e.g. `assignNames`).
    Names(Vec<String>),
    /// Engine-internal link to another variable (sequence items).
    #[serde(skip)]
    Bound { var: VarRef, index: Option<usize> },
}

impl AttributeValue {
    /// Literal number attribute.
    #[must_use]
    pub fn number(n: f64) -> Self {
        Self::Literal(Value::Number(n))
    }

    /// Reference attribute.
    #[must_use]
    pub fn reference(text: impl Into<String>) -> Self {
        Self::Reference(text.into())
    }

    /// Expression attribute with bindings given as `(name, reference)` pairs.
    #[must_use]
    pub fn expression(text: impl Into<String>, bindings: &[(&str, &str)]) -> Self {
        Self::Expression {
            text: text.into(),
            bindings: bindings
                .iter()
                .map(|(name, reference)| ((*name).to_string(), (*reference).to_string()))
                .collect(),
        }
    }

    /// Whether the value is a plain constant.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }
}

/// One node of the parsed component tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub kind: ComponentKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub children: Vec<ComponentSpec>,
    #[serde(default)]
    pub span: Option<SourceSpan>,
}

impl ComponentSpec {
    /// Create an unnamed spec with no attributes or children.
    #[must_use]
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            name: None,
            attributes: BTreeMap::new(),
            children: Vec::new(),
            span: None,
        }
    }

    /// Builder: set the name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder: set an attribute.
    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Builder: append a child.
    #[must_use]
    pub fn child(mut self, child: ComponentSpec) -> Self {
        self.children.push(child);
        self
    }

    /// Builder: append several children.
    #[must_use]
    pub fn with_children(mut self, children: impl IntoIterator<Item = ComponentSpec>) -> Self {
        self.children.extend(children);
        self
    }

    /// Number of specs in this subtree, including itself.
    #[must_use]
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(Self::size).sum::<usize>()
    }
}
