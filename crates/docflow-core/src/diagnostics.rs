//! # Diagnostics Channel
//!
//! Structured warnings and errors with a severity and a source span, consumed
//! by tooling. Propagation logic never reads them back.

use crate::spec::SourceSpan;
use serde::{Deserialize, Serialize};

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One reported problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Name path of the component the problem was found on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    /// Location in the original markup, when the parser provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SourceSpan>,
    /// Dependency chain from the requested variable to the failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            component: None,
            span: None,
            chain: Vec::new(),
        }
    }

    #[must_use]
    pub fn at(mut self, component: impl Into<String>, span: Option<SourceSpan>) -> Self {
        self.component = Some(component.into());
        self.span = span;
        self
    }

    #[must_use]
    pub fn with_chain(mut self, chain: &[String]) -> Self {
        self.chain = chain.to_vec();
        self
    }
}

/// Accumulated diagnostics of one document session.
///
/// Identical consecutive reports (same severity, message and component) are
/// collapsed, since re-resolving an erroring variable reports it again.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        let duplicate = self.items.iter().any(|d| {
            d.severity == diagnostic.severity
                && d.message == diagnostic.message
                && d.component == diagnostic.component
        });
        if !duplicate {
            self.items.push(diagnostic);
        }
    }

    /// All diagnostics in report order.
    #[must_use]
    pub fn items(&self) -> &[Diagnostic] {
        &self.items
    }

    /// Remove and return all diagnostics.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.items)
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_collapsed() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::new(Severity::Warning, "w").at("/P", None));
        diagnostics.push(Diagnostic::new(Severity::Warning, "w").at("/P", None));
        diagnostics.push(Diagnostic::new(Severity::Warning, "w").at("/Q", None));
        assert_eq!(diagnostics.len(), 2);
        assert!(!diagnostics.has_errors());
    }

    #[test]
    fn take_drains() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::new(Severity::Error, "e"));
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.take().len(), 1);
        assert!(diagnostics.is_empty());
    }
}
