//! # Namespace Scopes and References
//!
//! Name scopes of a document session and the reference grammar:
//!
//! ```text
//! reference := "$"? path ( "." prop ( "[" int "]" )* )?
//! path      := "/"? segment ( "/" segment )*
//! segment   := ( name | ".." ) ( "[" int "]" )?
//! ```
//!
//! Parsing is pure. Resolving a parsed reference against live components
//! needs composite expansion and therefore lives on [`crate::Document`].

use crate::types::{ComponentId, DocError, ScopeId, Value, VarRef};
use std::collections::BTreeMap;

// =============================================================================
// REFERENCES
// =============================================================================

/// One path step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Name(String),
    Parent,
}

/// A path step with an optional 1-based replacement index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub step: Step,
    pub index: Option<usize>,
}

/// A parsed reference expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub absolute: bool,
    pub segments: Vec<Segment>,
    pub prop: Option<String>,
    /// 1-based array indices applied to the property value.
    pub prop_indices: Vec<usize>,
}

/// What a reference resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Component(ComponentId),
    Var { var: VarRef, indices: Vec<usize> },
    Literal(Value),
}

fn invalid(text: &str, reason: impl Into<String>) -> DocError {
    DocError::InvalidReference {
        reference: text.to_string(),
        reason: reason.into(),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

impl Reference {
    /// Parse a reference expression.
    pub fn parse(text: &str) -> Result<Self, DocError> {
        let trimmed = text.trim();
        let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let chars: Vec<char> = body.chars().collect();
        let mut pos = 0;
        let absolute = chars.first() == Some(&'/');
        if absolute {
            pos += 1;
        }

        let mut segments = Vec::new();
        loop {
            let step = if chars.get(pos) == Some(&'.') && chars.get(pos + 1) == Some(&'.') {
                pos += 2;
                Step::Parent
            } else {
                let start = pos;
                while pos < chars.len() && is_name_char(chars[pos]) {
                    pos += 1;
                }
                if start == pos {
                    return Err(invalid(text, format!("expected a name at {start}")));
                }
                Step::Name(chars[start..pos].iter().collect())
            };
            let index = if chars.get(pos) == Some(&'[') {
                let (index, next) = parse_index(&chars, pos, text)?;
                pos = next;
                Some(index)
            } else {
                None
            };
            segments.push(Segment { step, index });
            if chars.get(pos) == Some(&'/') {
                pos += 1;
                continue;
            }
            break;
        }

        let mut prop = None;
        let mut prop_indices = Vec::new();
        if chars.get(pos) == Some(&'.') {
            pos += 1;
            let start = pos;
            while pos < chars.len() && is_name_char(chars[pos]) {
                pos += 1;
            }
            if start == pos {
                return Err(invalid(text, "expected a property name after '.'"));
            }
            prop = Some(chars[start..pos].iter().collect::<String>());
            while chars.get(pos) == Some(&'[') {
                let (index, next) = parse_index(&chars, pos, text)?;
                prop_indices.push(index);
                pos = next;
            }
        }
        if pos != chars.len() {
            return Err(invalid(text, format!("unexpected input at {pos}")));
        }
        if segments.last().is_some_and(|s| s.step == Step::Parent) && prop.is_some() {
            return Err(invalid(text, "'..' cannot carry a property"));
        }
        Ok(Self {
            absolute,
            segments,
            prop,
            prop_indices,
        })
    }

    /// The same reference without its property part.
    #[must_use]
    pub fn without_prop(&self) -> Self {
        Self {
            prop: None,
            prop_indices: Vec::new(),
            ..self.clone()
        }
    }
}

fn parse_index(chars: &[char], open: usize, text: &str) -> Result<(usize, usize), DocError> {
    let mut pos = open + 1;
    let start = pos;
    while pos < chars.len() && chars[pos].is_ascii_digit() {
        pos += 1;
    }
    if chars.get(pos) != Some(&']') || start == pos {
        return Err(invalid(text, format!("malformed index at {open}")));
    }
    let digits: String = chars[start..pos].iter().collect();
    let index = digits
        .parse::<usize>()
        .map_err(|_| invalid(text, format!("index out of range at {open}")))?;
    if index == 0 {
        return Err(invalid(text, "indices are 1-based"));
    }
    Ok((index, pos + 1))
}

// =============================================================================
// SCOPES
// =============================================================================

/// A name binding in a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Component(ComponentId),
    Literal(Value),
}

/// Result of looking a name up in one scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Binding),
    Ambiguous,
    Absent,
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    /// Component that owns this scope (`None` for the root scope).
    pub owner: Option<ComponentId>,
    names: BTreeMap<String, Vec<ComponentId>>,
    /// Map iteration bindings (alias and index alias).
    bindings: BTreeMap<String, Binding>,
    counters: BTreeMap<String, usize>,
}

impl Scope {
    fn lookup(&self, name: &str) -> Lookup {
        if let Some(binding) = self.bindings.get(name) {
            return Lookup::Found(binding.clone());
        }
        match self.names.get(name).map(Vec::as_slice) {
            Some([id]) => Lookup::Found(Binding::Component(*id)),
            Some([_, _, ..]) => Lookup::Ambiguous,
            _ => Lookup::Absent,
        }
    }
}

/// All scopes of one document session.
#[derive(Debug, Default)]
pub struct Namespaces {
    scopes: BTreeMap<ScopeId, Scope>,
    next_id: u64,
}

impl Namespaces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope nested in `parent`.
    pub fn create(&mut self, parent: Option<ScopeId>, owner: Option<ComponentId>) -> ScopeId {
        let id = ScopeId(self.next_id);
        self.next_id += 1;
        self.scopes.insert(
            id,
            Scope {
                parent,
                owner,
                ..Scope::default()
            },
        );
        id
    }

    pub fn remove(&mut self, scope: ScopeId) {
        self.scopes.remove(&scope);
    }

    #[must_use]
    pub fn get(&self, scope: ScopeId) -> Option<&Scope> {
        self.scopes.get(&scope)
    }

    #[must_use]
    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes.get(&scope).and_then(|s| s.parent)
    }

    #[must_use]
    pub fn owner(&self, scope: ScopeId) -> Option<ComponentId> {
        self.scopes.get(&scope).and_then(|s| s.owner)
    }

    pub fn register(&mut self, scope: ScopeId, name: &str, id: ComponentId) {
        if let Some(s) = self.scopes.get_mut(&scope) {
            s.names.entry(name.to_string()).or_default().push(id);
        }
    }

    pub fn unregister(&mut self, scope: ScopeId, name: &str, id: ComponentId) {
        if let Some(s) = self.scopes.get_mut(&scope) {
            if let Some(ids) = s.names.get_mut(name) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    s.names.remove(name);
                }
            }
        }
    }

    /// Whether `name` is taken in `scope` (not looking outward).
    #[must_use]
    pub fn is_taken(&self, scope: ScopeId, name: &str) -> bool {
        self.scopes
            .get(&scope)
            .is_some_and(|s| s.names.contains_key(name) || s.bindings.contains_key(name))
    }

    pub fn bind(&mut self, scope: ScopeId, name: &str, binding: Binding) {
        if let Some(s) = self.scopes.get_mut(&scope) {
            s.bindings.insert(name.to_string(), binding);
        }
    }

    #[must_use]
    pub fn binding(&self, scope: ScopeId, name: &str) -> Option<&Binding> {
        self.scopes.get(&scope).and_then(|s| s.bindings.get(name))
    }

    /// Bindings held directly by a scope, in name order.
    #[must_use]
    pub fn bindings(&self, scope: ScopeId) -> Vec<(String, Binding)> {
        self.scopes
            .get(&scope)
            .map(|s| {
                s.bindings
                    .iter()
                    .map(|(name, binding)| (name.clone(), binding.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next value of a per-scope counter (1-based).
    pub fn next_counter(&mut self, scope: ScopeId, key: &str) -> usize {
        match self.scopes.get_mut(&scope) {
            Some(s) => {
                let counter = s.counters.entry(key.to_string()).or_insert(0);
                *counter += 1;
                *counter
            }
            None => 1,
        }
    }

    /// Look a name up in exactly one scope.
    #[must_use]
    pub fn lookup_local(&self, scope: ScopeId, name: &str) -> Lookup {
        self.scopes
            .get(&scope)
            .map_or(Lookup::Absent, |s| s.lookup(name))
    }

    /// Look a name up lexically: `scope`, then its enclosing scopes.
    #[must_use]
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Lookup {
        let mut current = Some(scope);
        while let Some(id) = current {
            match self.lookup_local(id, name) {
                Lookup::Absent => current = self.parent(id),
                found => return found,
            }
        }
        Lookup::Absent
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str, index: Option<usize>) -> Segment {
        Segment {
            step: Step::Name(n.to_string()),
            index,
        }
    }

    #[test]
    fn parse_simple_name() {
        let r = Reference::parse("$P").expect("parse");
        assert!(!r.absolute);
        assert_eq!(r.segments, vec![name("P", None)]);
        assert_eq!(r.prop, None);
    }

    #[test]
    fn parse_full_form() {
        let r = Reference::parse("$m[2]/Q.coords[1]").expect("parse");
        assert_eq!(r.segments, vec![name("m", Some(2)), name("Q", None)]);
        assert_eq!(r.prop.as_deref(), Some("coords"));
        assert_eq!(r.prop_indices, vec![1]);
    }

    #[test]
    fn parse_absolute_and_parent() {
        let r = Reference::parse("/_m_3/P.x").expect("parse");
        assert!(r.absolute);
        assert_eq!(r.segments.len(), 2);

        let r = Reference::parse("../P").expect("parse");
        assert_eq!(r.segments[0].step, Step::Parent);
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["$", "$P.", "$P[0]", "$P[x]", "$P]", "$P..x", "$a//b", "$P.x y"] {
            assert!(Reference::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn lexical_lookup_walks_outward() {
        let mut ns = Namespaces::new();
        let root = ns.create(None, None);
        let inner = ns.create(Some(root), Some(ComponentId(1)));
        ns.register(root, "P", ComponentId(2));
        ns.bind(inner, "n", Binding::Literal(Value::Number(3.0)));

        assert_eq!(
            ns.lookup(inner, "P"),
            Lookup::Found(Binding::Component(ComponentId(2)))
        );
        assert_eq!(
            ns.lookup(inner, "n"),
            Lookup::Found(Binding::Literal(Value::Number(3.0)))
        );
        assert_eq!(ns.lookup(root, "n"), Lookup::Absent);
        assert_eq!(
            ns.bindings(inner),
            vec![("n".to_string(), Binding::Literal(Value::Number(3.0)))]
        );
        assert!(ns.bindings(root).is_empty());
    }

    #[test]
    fn duplicate_names_are_ambiguous() {
        let mut ns = Namespaces::new();
        let root = ns.create(None, None);
        ns.register(root, "P", ComponentId(1));
        ns.register(root, "P", ComponentId(2));
        assert_eq!(ns.lookup(root, "P"), Lookup::Ambiguous);

        ns.unregister(root, "P", ComponentId(2));
        assert_eq!(
            ns.lookup(root, "P"),
            Lookup::Found(Binding::Component(ComponentId(1)))
        );
    }

    #[test]
    fn counters_are_per_scope() {
        let mut ns = Namespaces::new();
        let a = ns.create(None, None);
        let b = ns.create(Some(a), None);
        assert_eq!(ns.next_counter(a, "point"), 1);
        assert_eq!(ns.next_counter(a, "point"), 2);
        assert_eq!(ns.next_counter(b, "point"), 1);
    }
}
