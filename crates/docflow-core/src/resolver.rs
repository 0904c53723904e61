//! # Dependency Resolver
//!
//! Demand-driven evaluation of state variables. Resolving a variable walks its
//! dependencies recursively (references through the namespace scopes,
//! composites through the reconciler), runs the definition and caches the
//! result together with the dependency edges it actually read. Edges are
//! recomputed on every re-resolution, so a changed reference target or a
//! resized composite rewires the graph by itself.
//!
//! Failures are local: a cycle or a broken reference is stored as the result
//! of the variables involved and never unwinds into their siblings.

use crate::diagnostics::Severity;
use crate::kinds::{self, DefinitionInput, DepSpec, VarSource};
use crate::namespace::{Binding, Lookup, Reference, Step, Target};
use crate::registry::Freshness;
use crate::session::Document;
use crate::spec::AttributeValue;
use crate::types::{ComponentId, DocError, ResolveError, ScopeId, Value, VarRef};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{trace, warn};

/// Why a reference did not lead to a target.
#[derive(Debug)]
pub(crate) enum LookupError {
    NotFound(String),
    Ambiguous(String),
    /// A replacement index past the end of a composite's expansion.
    Missing(String),
    Resolve(ResolveError),
}

impl LookupError {
    pub(crate) fn into_doc_error(self) -> DocError {
        match self {
            Self::NotFound(reason) => DocError::NotFound(reason),
            Self::Ambiguous(reason) => DocError::Ambiguous(reason),
            Self::Missing(reference) => DocError::Resolve(ResolveError::MissingReplacement {
                reference,
                chain: Vec::new(),
            }),
            Self::Resolve(e) => DocError::Resolve(e),
        }
    }

    pub(crate) fn into_resolve_error(self, reference: &str) -> ResolveError {
        match self {
            Self::NotFound(reason) | Self::Ambiguous(reason) => ResolveError::UnresolvedReference {
                reference: reference.to_string(),
                reason,
                chain: Vec::new(),
            },
            Self::Missing(reference) => ResolveError::MissingReplacement {
                reference,
                chain: Vec::new(),
            },
            Self::Resolve(e) => e,
        }
    }
}

impl From<ResolveError> for LookupError {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}

/// Position of the reference walk.
enum Cursor {
    Lexical(ScopeId),
    Scope(ScopeId),
    Component(ComponentId),
    Literal(Value),
}

/// Apply 1-based array indices to a value.
pub(crate) fn index_value(
    value: Value,
    indices: &[usize],
    reference: &str,
) -> Result<Value, ResolveError> {
    let mut current = value;
    for &index in indices {
        current = match current {
            Value::Array(mut items) if index >= 1 && index <= items.len() => {
                items.swap_remove(index - 1)
            }
            _ => {
                return Err(ResolveError::MissingReplacement {
                    reference: reference.to_string(),
                    chain: Vec::new(),
                });
            }
        };
    }
    Ok(current)
}

// =============================================================================
// RESOLUTION
// =============================================================================

impl Document {
    /// Resolve one state variable, reusing the cached result when fresh.
    pub(crate) fn resolve_var(&mut self, var: &VarRef) -> Result<Value, ResolveError> {
        let Some(freshness) = self.registry.freshness(var) else {
            return Err(ResolveError::MissingReplacement {
                reference: var.to_string(),
                chain: self.current_chain(None),
            });
        };
        match freshness {
            Freshness::Fresh => {
                if let Some(result) = self.registry.get(var).and_then(|s| s.result.clone()) {
                    return result;
                }
            }
            Freshness::Resolving => {
                let start = self.stack.iter().position(|v| v == var).unwrap_or(0);
                let mut chain: Vec<String> =
                    self.stack[start..].iter().map(|v| self.describe(v)).collect();
                chain.push(self.describe(var));
                let error = ResolveError::CycleDetected { chain };
                self.report(
                    Severity::Error,
                    error.to_string(),
                    Some(var.component),
                    error.chain(),
                );
                return Err(error);
            }
            Freshness::Stale => {}
        }

        if self.stack.len() >= self.config.max_resolution_depth {
            let at = self.describe(var);
            return Err(ResolveError::DefinitionFailed {
                var: at,
                message: format!(
                    "resolution depth exceeds {}",
                    self.config.max_resolution_depth
                ),
                chain: self.current_chain(Some(var)),
            });
        }

        self.registry.mark_resolving(var);
        self.stack.push(var.clone());
        let mut edges = BTreeSet::new();
        let outcome = self.compute_var(var, &mut edges);
        self.stack.pop();

        let outcome = match outcome {
            Err(ResolveError::UnimplementedCombination { what }) => {
                warn!(var = %self.describe(var), %what, "unimplemented combination");
                self.report(
                    Severity::Warning,
                    format!("unimplemented combination: {what}"),
                    Some(var.component),
                    &[],
                );
                Ok(Value::Null)
            }
            Err(e) => {
                let origin = e.chain().is_empty();
                let at = self.describe(var);
                let e = e.with_context(&at, &self.current_chain(Some(var)));
                if origin
                    && matches!(
                        e,
                        ResolveError::UnresolvedReference { .. }
                            | ResolveError::DefinitionFailed { .. }
                    )
                {
                    self.report(Severity::Error, e.to_string(), Some(var.component), e.chain());
                }
                Err(e)
            }
            ok => ok,
        };
        let awaiting = matches!(
            outcome,
            Err(ResolveError::UnresolvedReference { .. } | ResolveError::MissingReplacement { .. })
        );
        trace!(var = %var, ok = outcome.is_ok(), deps = edges.len(), "resolved");
        self.registry.store(var, outcome.clone(), edges, awaiting);
        outcome
    }

    /// The resolution stack rendered for error chains.
    fn current_chain(&self, last: Option<&VarRef>) -> Vec<String> {
        let mut chain: Vec<String> = self.stack.iter().map(|v| self.describe(v)).collect();
        if let Some(var) = last {
            if self.stack.last() != Some(var) {
                chain.push(self.describe(var));
            }
        }
        chain
    }

    fn compute_var(
        &mut self,
        var: &VarRef,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Value, ResolveError> {
        let (kind, scope, shadow_source) = {
            let component = self.tree.get(var.component).ok_or_else(|| {
                ResolveError::MissingReplacement {
                    reference: var.to_string(),
                    chain: Vec::new(),
                }
            })?;
            (
                component.kind,
                component.reference_scope(),
                component.shadows(&var.name),
            )
        };
        let var_spec = kinds::spec(kind)
            .var(&var.name)
            .ok_or_else(|| ResolveError::failed(format!("a {kind} has no variable {}", var.name)))?;

        if let Some(source) = shadow_source {
            let source_var = VarRef::new(source, var.name.clone());
            edges.insert(source_var.clone());
            return self.resolve_var(&source_var);
        }

        match var_spec.source {
            VarSource::Attribute {
                attribute,
                default,
                domain,
            } => {
                let attr = self
                    .tree
                    .get(var.component)
                    .and_then(|c| c.attributes.get(attribute).cloned());
                match attr {
                    None | Some(AttributeValue::Literal(_)) => Ok(self
                        .registry
                        .essential(var)
                        .cloned()
                        .unwrap_or_else(default)),
                    Some(value) => {
                        let resolved = self.attribute_value(scope, &value, edges)?;
                        domain.coerce(resolved).map_err(ResolveError::failed)
                    }
                }
            }
            VarSource::Derived {
                deps, definition, ..
            } => {
                let values = self.dependency_values(var.component, scope, deps, edges)?;
                definition(&DefinitionInput {
                    deps: &values,
                    cas: self.cas.as_ref(),
                    tolerance: self.config.numeric_tolerance,
                })
            }
            VarSource::Governing => self.compute_governing(var.component, edges),
        }
    }

    /// Evaluate a non-literal attribute value in `scope`.
    pub(crate) fn attribute_value(
        &mut self,
        scope: ScopeId,
        value: &AttributeValue,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Value, ResolveError> {
        match value {
            AttributeValue::Literal(v) => Ok(v.clone()),
            AttributeValue::Reference(text) => self.reference_value(scope, text, edges),
            AttributeValue::References(list) => {
                let mut items = Vec::with_capacity(list.len());
                for text in list {
                    items.push(
                        self.reference_value(scope, text, edges)
                            .unwrap_or(Value::Missing),
                    );
                }
                Ok(Value::Array(items))
            }
            AttributeValue::Expression { text, bindings } => {
                let mut context = BTreeMap::new();
                for (name, reference) in bindings {
                    let bound = self.reference_value(scope, reference, edges)?;
                    context.insert(name.clone(), bound);
                }
                self.cas
                    .evaluate(text, &context)
                    .map_err(|e| ResolveError::failed(e.to_string()))
            }
            AttributeValue::Names(names) => Ok(Value::Array(
                names.iter().map(|n| Value::text(n.clone())).collect(),
            )),
            AttributeValue::Bound { var, index } => {
                edges.insert(var.clone());
                let value = self.resolve_var(var)?;
                match index {
                    None => Ok(value),
                    Some(i) => index_value(value, &[i + 1], &self.describe(var)),
                }
            }
        }
    }

    /// Resolve reference text to a value.
    pub(crate) fn reference_value(
        &mut self,
        scope: ScopeId,
        text: &str,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Value, ResolveError> {
        let parsed = Reference::parse(text).map_err(|e| ResolveError::UnresolvedReference {
            reference: text.to_string(),
            reason: e.to_string(),
            chain: Vec::new(),
        })?;
        let target = self
            .resolve_target(scope, &parsed, text, edges)
            .map_err(|e| e.into_resolve_error(text))?;
        match target {
            Target::Literal(v) => Ok(v),
            Target::Var { var, indices } => {
                edges.insert(var.clone());
                let value = self.resolve_var(&var)?;
                index_value(value, &indices, text)
            }
            Target::Component(id) => self.component_value(id, text, edges),
        }
    }

    /// Value of a component named without a property: its primary variable,
    /// or the primaries of its effective children when it has none.
    fn component_value(
        &mut self,
        id: ComponentId,
        text: &str,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Value, ResolveError> {
        if let Some(var) = self.component_var(id, None, edges) {
            edges.insert(var.clone());
            return self.resolve_var(&var);
        }
        let kind = self.tree.kind(id).ok_or_else(|| ResolveError::MissingReplacement {
            reference: text.to_string(),
            chain: Vec::new(),
        })?;
        if !kind.is_transparent() {
            return Err(ResolveError::UnresolvedReference {
                reference: text.to_string(),
                reason: format!("a {kind} has no value"),
                chain: Vec::new(),
            });
        }
        let mut inner = Vec::new();
        self.flatten_into(id, edges, &mut inner);
        let mut items = Vec::with_capacity(inner.len());
        for child in inner {
            let item = match self.component_var(child, None, edges) {
                Some(var) => {
                    edges.insert(var.clone());
                    self.resolve_var(&var).unwrap_or(Value::Missing)
                }
                None => Value::Missing,
            };
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    /// The variable `name` (or the primary variable) of a component, looking
    /// through transparent components with exactly one effective child.
    pub(crate) fn component_var(
        &mut self,
        id: ComponentId,
        name: Option<&str>,
        edges: &mut BTreeSet<VarRef>,
    ) -> Option<VarRef> {
        let kind = self.tree.kind(id)?;
        let table = kinds::spec(kind);
        let own = match name {
            Some(n) => table.var(n).map(|v| v.name),
            None => table.primary,
        };
        if let Some(var) = own {
            return Some(VarRef::new(id, var));
        }
        if !kind.is_transparent() {
            return None;
        }
        let mut inner = Vec::new();
        self.flatten_into(id, edges, &mut inner);
        match inner.as_slice() {
            [only] => self.component_var(*only, name, edges),
            _ => None,
        }
    }

    // =========================================================================
    // REFERENCE LOOKUP
    // =========================================================================

    /// Walk a parsed reference from `origin`.
    pub(crate) fn resolve_target(
        &mut self,
        origin: ScopeId,
        reference: &Reference,
        text: &str,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Target, LookupError> {
        let mut cursor = if reference.absolute {
            Cursor::Scope(self.root_scope)
        } else {
            Cursor::Lexical(origin)
        };

        for segment in &reference.segments {
            cursor = match &segment.step {
                Step::Parent => {
                    let from = match cursor {
                        Cursor::Lexical(s) | Cursor::Scope(s) => s,
                        Cursor::Component(c) => self
                            .tree
                            .get(c)
                            .map(|component| component.scope)
                            .ok_or_else(|| LookupError::NotFound(text.to_string()))?,
                        Cursor::Literal(_) => {
                            return Err(LookupError::NotFound(format!("{text}: '..' after a value")));
                        }
                    };
                    let parent = self
                        .scopes
                        .parent(from)
                        .ok_or_else(|| LookupError::NotFound(format!("{text}: no enclosing scope")))?;
                    Cursor::Scope(parent)
                }
                Step::Name(name) => {
                    let lookup = match cursor {
                        Cursor::Lexical(s) => self.scopes.lookup(s, name),
                        Cursor::Scope(s) => self.scopes.lookup_local(s, name),
                        Cursor::Component(c) => match self.tree.get(c) {
                            Some(component) => {
                                self.scopes.lookup_local(component.child_scope(), name)
                            }
                            None => Lookup::Absent,
                        },
                        Cursor::Literal(_) => Lookup::Absent,
                    };
                    match lookup {
                        Lookup::Found(Binding::Component(id)) => Cursor::Component(id),
                        Lookup::Found(Binding::Literal(v)) => Cursor::Literal(v),
                        Lookup::Ambiguous => {
                            return Err(LookupError::Ambiguous(format!(
                                "{text}: '{name}' names more than one component"
                            )));
                        }
                        Lookup::Absent => {
                            return Err(LookupError::NotFound(format!("{text}: no '{name}'")));
                        }
                    }
                }
            };

            if let Some(index) = segment.index {
                cursor = match cursor {
                    Cursor::Component(c)
                        if self.tree.kind(c).is_some_and(|k| k.is_composite()) =>
                    {
                        let roots = self.replacement_roots(c, edges)?;
                        match roots.get(index - 1) {
                            Some(root) => Cursor::Component(*root),
                            None => return Err(LookupError::Missing(text.to_string())),
                        }
                    }
                    Cursor::Literal(Value::Array(mut items)) if index <= items.len() => {
                        Cursor::Literal(items.swap_remove(index - 1))
                    }
                    Cursor::Literal(Value::Array(_)) => {
                        return Err(LookupError::Missing(text.to_string()));
                    }
                    _ => {
                        return Err(LookupError::NotFound(format!(
                            "{text}: [{index}] needs a composite"
                        )));
                    }
                };
            }
        }

        match (cursor, &reference.prop) {
            (Cursor::Component(id), None) => Ok(Target::Component(id)),
            (Cursor::Component(id), Some(prop)) => {
                let var = self.component_var(id, Some(prop), edges).ok_or_else(|| {
                    let kind = self.tree.kind(id).map_or("component", |k| k.name());
                    LookupError::NotFound(format!("{text}: a {kind} has no '{prop}'"))
                })?;
                Ok(Target::Var {
                    var,
                    indices: reference.prop_indices.clone(),
                })
            }
            (Cursor::Literal(v), None) => Ok(Target::Literal(v)),
            (Cursor::Literal(_), Some(prop)) => Err(LookupError::NotFound(format!(
                "{text}: a bound value has no '{prop}'"
            ))),
            (Cursor::Lexical(_) | Cursor::Scope(_), _) => Err(LookupError::NotFound(format!(
                "{text} names a scope, not a component"
            ))),
        }
    }

    // =========================================================================
    // DEPENDENCIES
    // =========================================================================

    /// Values of a derived variable's dependencies, in declaration order.
    pub(crate) fn dependency_values(
        &mut self,
        component: ComponentId,
        scope: ScopeId,
        deps: &[DepSpec],
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Vec<Value>, ResolveError> {
        let mut values = Vec::with_capacity(deps.len());
        for dep in deps {
            let value = match *dep {
                DepSpec::Var(name) => {
                    let var = VarRef::new(component, name);
                    edges.insert(var.clone());
                    self.resolve_var(&var)?
                }
                DepSpec::ChildVar { kinds: wanted, var } => {
                    let mut items = Vec::new();
                    for child in self.effective_children(component, edges) {
                        if !self.tree.kind(child).is_some_and(|k| wanted.contains(&k)) {
                            continue;
                        }
                        let child_var = VarRef::new(child, var);
                        edges.insert(child_var.clone());
                        items.push(self.resolve_var(&child_var).unwrap_or(Value::Missing));
                    }
                    Value::Array(items)
                }
                DepSpec::ReferenceList { attribute, var } => {
                    let mut items = Vec::new();
                    for text in self.reference_list(component, attribute)? {
                        let item = self
                            .referenced_var(scope, &text, var, edges)
                            .and_then(|(target, indices)| {
                                edges.insert(target.clone());
                                let value = self.resolve_var(&target)?;
                                index_value(value, &indices, &text)
                            })
                            .unwrap_or(Value::Missing);
                        items.push(item);
                    }
                    Value::Array(items)
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Reference texts of a reference-list attribute.
    pub(crate) fn reference_list(
        &self,
        component: ComponentId,
        attribute: &str,
    ) -> Result<Vec<String>, ResolveError> {
        let attr = self
            .tree
            .get(component)
            .and_then(|c| c.attributes.get(attribute));
        match attr {
            None => Ok(Vec::new()),
            Some(AttributeValue::References(list)) => Ok(list.clone()),
            Some(AttributeValue::Reference(text)) => Ok(vec![text.clone()]),
            Some(other) => Err(ResolveError::failed(format!(
                "'{attribute}' must list references, got {other:?}"
            ))),
        }
    }

    /// The variable `var` of the component a reference names. A reference that
    /// already names a variable is used as is.
    pub(crate) fn referenced_var(
        &mut self,
        scope: ScopeId,
        text: &str,
        var: &str,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<(VarRef, Vec<usize>), ResolveError> {
        let parsed = Reference::parse(text).map_err(|e| ResolveError::UnresolvedReference {
            reference: text.to_string(),
            reason: e.to_string(),
            chain: Vec::new(),
        })?;
        match self
            .resolve_target(scope, &parsed, text, edges)
            .map_err(|e| e.into_resolve_error(text))?
        {
            Target::Var { var, indices } => Ok((var, indices)),
            Target::Component(id) => self
                .component_var(id, Some(var), edges)
                .map(|v| (v, Vec::new()))
                .ok_or_else(|| ResolveError::UnresolvedReference {
                    reference: text.to_string(),
                    reason: format!("no '{var}' there"),
                    chain: Vec::new(),
                }),
            Target::Literal(_) => Err(ResolveError::UnresolvedReference {
                reference: text.to_string(),
                reason: "names a bound value".to_string(),
                chain: Vec::new(),
            }),
        }
    }

    /// Built children of a component with groups and composites looked through.
    pub(crate) fn effective_children(
        &mut self,
        id: ComponentId,
        edges: &mut BTreeSet<VarRef>,
    ) -> Vec<ComponentId> {
        let mut out = Vec::new();
        for child in self.tree.children(id) {
            self.flatten_into(child, edges, &mut out);
        }
        out
    }

    /// Push `id`, or its effective content when it is transparent.
    pub(crate) fn flatten_into(
        &mut self,
        id: ComponentId,
        edges: &mut BTreeSet<VarRef>,
        out: &mut Vec<ComponentId>,
    ) {
        let Some(kind) = self.tree.kind(id) else {
            return;
        };
        if kind.is_composite() {
            match self.replacement_roots(id, edges) {
                Ok(roots) => {
                    for root in roots {
                        self.flatten_into(root, edges, out);
                    }
                }
                Err(e) => trace!(component = %id, error = %e, "skipping unexpanded composite"),
            }
        } else if kind.is_transparent() {
            for child in self.tree.children(id) {
                self.flatten_into(child, edges, out);
            }
        } else {
            out.push(id);
        }
    }
}
