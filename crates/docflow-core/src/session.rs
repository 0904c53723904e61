//! # Document Session
//!
//! [`Document`] is the one stateful entry point of the engine. It owns the
//! component tree, the state-variable registry, the namespace scopes and the
//! replacement lists of every composite, and is built from a parsed
//! component tree and torn down explicitly with [`Document::dispose`].
//!
//! There is no process-wide state: independent documents can coexist in one
//! process (tests create hundreds).
//!
//! The engine behavior is split across modules that extend `Document`:
//! - `resolver`: demand-driven resolution and reference lookup
//! - `reconciler`: composite expansion and replacement identity
//! - `propagator`: actions and inverse propagation

use crate::cas::{ArithmeticCas, Cas};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, Diagnostics, Severity};
use crate::formats::{EssentialSnapshot, RestoreReport, SnapshotEntry};
use crate::kinds::{self, ComponentKind};
use crate::namespace::{Namespaces, Reference, Target};
use crate::primitives::MAX_SETTLE_PASSES;
use crate::reconciler::{ExpansionStatus, OwnScope, Placement, ReplacementList};
use crate::registry::Registry;
use crate::resolver::LookupError;
use crate::spec::ComponentSpec;
use crate::tree::ComponentTree;
use crate::types::{ComponentId, DocError, Resolution, ScopeId, Value, VarRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Resolved state of one component, as handed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedComponent {
    pub kind: ComponentKind,
    pub state_values: BTreeMap<String, Resolution>,
}

/// One interactive document.
pub struct Document {
    pub(crate) tree: ComponentTree,
    pub(crate) registry: Registry,
    pub(crate) scopes: Namespaces,
    pub(crate) replacements: BTreeMap<ComponentId, ReplacementList>,
    /// Composites currently being reconciled.
    pub(crate) expanding: BTreeSet<ComponentId>,
    /// Variables currently being resolved, outermost first.
    pub(crate) stack: Vec<VarRef>,
    pub(crate) cas: Box<dyn Cas>,
    pub(crate) config: EngineConfig,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) root: ComponentId,
    pub(crate) root_scope: ScopeId,
    /// Bumped on every structural change (components built or torn down).
    pub(crate) generation: u64,
    pub(crate) disposed: bool,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("components", &self.tree.len())
            .field("variables", &self.registry.len())
            .field("generation", &self.generation)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CONSTRUCTION AND TEARDOWN
// =============================================================================

impl Document {
    /// Build a document with the default configuration and the reference CAS.
    pub fn new(spec: &ComponentSpec) -> Result<Self, DocError> {
        Self::with_options(spec, EngineConfig::default(), Box::new(ArithmeticCas::new()))
    }

    /// Build a document with an explicit configuration and CAS collaborator.
    pub fn with_options(
        spec: &ComponentSpec,
        config: EngineConfig,
        cas: Box<dyn Cas>,
    ) -> Result<Self, DocError> {
        if spec.kind != ComponentKind::Document {
            return Err(DocError::InvalidDocument(format!(
                "root must be a document, got {}",
                spec.kind
            )));
        }
        validate_spec(spec, None)?;

        let mut scopes = Namespaces::new();
        let root_scope = scopes.create(None, None);
        let mut doc = Self {
            tree: ComponentTree::new(),
            registry: Registry::new(),
            scopes,
            replacements: BTreeMap::new(),
            expanding: BTreeSet::new(),
            stack: Vec::new(),
            cas,
            config: config.sanitized(),
            diagnostics: Diagnostics::new(),
            root: ComponentId(0),
            root_scope,
            generation: 0,
            disposed: false,
        };
        doc.root = doc.build(
            spec,
            Placement {
                parent: None,
                scope: root_scope,
                name: None,
                explicit: false,
                own_scope: OwnScope::Existing(root_scope),
                generated_by: None,
            },
        );
        info!(
            components = doc.tree.len(),
            variables = doc.registry.len(),
            "document built"
        );
        Ok(doc)
    }

    /// Tear the session down. Every later call reports `Disposed`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        info!(components = self.tree.len(), "document disposed");
        self.tree = ComponentTree::new();
        self.registry.clear();
        self.scopes = Namespaces::new();
        self.replacements.clear();
        self.expanding.clear();
        self.stack.clear();
        self.disposed = true;
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_live(&self) -> Result<(), DocError> {
        if self.disposed {
            Err(DocError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// Structural checks that do not need a live document.
fn validate_spec(spec: &ComponentSpec, parent: Option<ComponentKind>) -> Result<(), DocError> {
    let is_branch = matches!(spec.kind, ComponentKind::Case | ComponentKind::Else);
    if is_branch != (parent == Some(ComponentKind::Conditional)) {
        return Err(DocError::InvalidDocument(format!(
            "{} cannot be a child of {}",
            spec.kind,
            parent.map_or("the root", ComponentKind::name)
        )));
    }
    if spec.kind == ComponentKind::Document && parent.is_some() {
        return Err(DocError::InvalidDocument(
            "a document cannot be nested".to_string(),
        ));
    }
    for child in &spec.children {
        validate_spec(child, Some(spec.kind))?;
    }
    Ok(())
}

// =============================================================================
// QUERIES
// =============================================================================

impl Document {
    #[must_use]
    pub fn root(&self) -> ComponentId {
        self.root
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of live components, replacements included.
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub fn kind_of(&self, id: ComponentId) -> Option<ComponentKind> {
        self.tree.kind(id)
    }

    /// Name path of a component (`/P`, `/m/_group3/Q`); the root is `/`.
    #[must_use]
    pub fn component_path(&self, id: ComponentId) -> Option<String> {
        if id == self.root {
            return Some("/".to_string());
        }
        let component = self.tree.get(id)?;
        let prefix = match self.scopes.owner(component.scope) {
            Some(owner) if owner != self.root => self.component_path(owner)?,
            _ => String::new(),
        };
        Some(format!("{prefix}/{}", component.name))
    }

    /// Human-readable form of a variable for chains and messages.
    pub(crate) fn describe(&self, var: &VarRef) -> String {
        match self.component_path(var.component) {
            Some(path) => format!("{path}.{}", var.name),
            None => var.to_string(),
        }
    }

    /// Find a component by reference (`$P`, `/_m_2/Q`, `$m[2]`).
    pub fn component_id(&mut self, reference: &str) -> Result<ComponentId, DocError> {
        self.ensure_live()?;
        self.settle();
        match self.lookup(reference)? {
            Target::Component(id) => Ok(id),
            Target::Var { .. } => Err(DocError::NotFound(format!(
                "{reference} names a variable, not a component"
            ))),
            Target::Literal(_) => Err(DocError::NotFound(format!(
                "{reference} names a constant, not a component"
            ))),
        }
    }

    /// Resolve a reference to a value (`$P.x`, `$n`).
    pub fn value(&mut self, reference: &str) -> Result<Value, DocError> {
        self.ensure_live()?;
        self.settle();
        match self.lookup(reference)? {
            Target::Literal(v) => Ok(v),
            target => {
                let (var, indices) = self.target_var(target, reference)?;
                let value = self.resolve_var(&var)?;
                crate::resolver::index_value(value, &indices, reference).map_err(DocError::from)
            }
        }
    }

    /// Resolve a reference to its externally visible resolution.
    ///
    /// Indices past the end of a composite's expansion are `Unresolved`,
    /// not an error.
    pub fn resolution(&mut self, reference: &str) -> Result<Resolution, DocError> {
        self.ensure_live()?;
        self.settle();
        let target = match self.lookup(reference) {
            Ok(target) => target,
            Err(DocError::Resolve(e)) => return Ok(Resolution::from_result(Err(e))),
            Err(e) => return Err(e),
        };
        match target {
            Target::Literal(v) => Ok(Resolution::Value(v)),
            target => {
                let (var, indices) = self.target_var(target, reference)?;
                let result = self
                    .resolve_var(&var)
                    .and_then(|v| crate::resolver::index_value(v, &indices, reference));
                Ok(Resolution::from_result(result))
            }
        }
    }

    /// Expansion status of a composite (distinguishes failed from empty).
    pub fn replacement_status(&mut self, reference: &str) -> Result<ExpansionStatus, DocError> {
        let id = self.component_id(reference)?;
        self.replacements
            .get(&id)
            .map(|list| list.status.clone())
            .ok_or_else(|| DocError::NotFound(format!("{reference} is not a composite")))
    }

    /// Name paths of a composite's replacement roots, in order.
    pub fn replacement_paths(&mut self, reference: &str) -> Result<Vec<String>, DocError> {
        let id = self.component_id(reference)?;
        let roots = self
            .replacements
            .get(&id)
            .map(ReplacementList::roots)
            .ok_or_else(|| DocError::NotFound(format!("{reference} is not a composite")))?;
        Ok(roots
            .into_iter()
            .filter_map(|root| self.component_path(root))
            .collect())
    }

    /// Fully resolved state of every live component, keyed by name path.
    ///
    /// Composites are expanded first, so the result is always consistent with
    /// the current governing variables. Components whose path is already
    /// taken (duplicate names in one scope) are keyed `<path>#<id>`.
    pub fn state_values(&mut self) -> BTreeMap<String, RenderedComponent> {
        let mut out = BTreeMap::new();
        if self.disposed {
            return out;
        }
        self.settle();
        for id in self.walk() {
            let (Some(kind), Some(path)) = (self.tree.kind(id), self.component_path(id)) else {
                continue;
            };
            let mut state_values = BTreeMap::new();
            for var_spec in kinds::spec(kind).vars.iter().filter(|v| v.public) {
                let var = VarRef::new(id, var_spec.name);
                let resolution = Resolution::from_result(self.resolve_var(&var));
                state_values.insert(var_spec.name.to_string(), resolution);
            }
            let key = if out.contains_key(&path) {
                warn!(component = %id, %path, "duplicate path in rendered state");
                format!("{path}{id}")
            } else {
                path
            };
            out.insert(key, RenderedComponent { kind, state_values });
        }
        debug!(components = out.len(), "state values rendered");
        out
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diagnostics.items()
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.take()
    }

    /// Parse and resolve a reference from the root scope.
    pub(crate) fn lookup(&mut self, reference: &str) -> Result<Target, DocError> {
        let parsed = Reference::parse(reference)?;
        let mut edges = BTreeSet::new();
        self.resolve_target(self.root_scope, &parsed, reference, &mut edges)
            .map_err(LookupError::into_doc_error)
    }

    /// The variable a non-literal target denotes (components use their primary).
    pub(crate) fn target_var(
        &mut self,
        target: Target,
        reference: &str,
    ) -> Result<(VarRef, Vec<usize>), DocError> {
        match target {
            Target::Var { var, indices } => Ok((var, indices)),
            Target::Component(id) => {
                let mut edges = BTreeSet::new();
                let var = self.component_var(id, None, &mut edges).ok_or_else(|| {
                    let kind = self.tree.kind(id).map_or("component", ComponentKind::name);
                    DocError::NotFound(format!("{reference}: a {kind} has no value"))
                })?;
                Ok((var, Vec::new()))
            }
            Target::Literal(_) => Err(DocError::NotFound(format!(
                "{reference} names a constant"
            ))),
        }
    }

    /// Live components in render order: each component, its built children,
    /// then the replacement roots of composites.
    pub(crate) fn walk(&self) -> Vec<ComponentId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !self.tree.contains(id) {
                continue;
            }
            out.push(id);
            let mut next = self.tree.children(id);
            if let Some(list) = self.replacements.get(&id) {
                next.extend(list.roots());
            }
            stack.extend(next.into_iter().rev());
        }
        out
    }

    /// Expand every composite until the structure stops changing.
    ///
    /// Only runs at the top level; during a resolution composites are expanded
    /// on demand instead.
    pub(crate) fn settle(&mut self) {
        if !self.stack.is_empty() || self.disposed {
            return;
        }
        for _ in 0..MAX_SETTLE_PASSES {
            let before = self.generation;
            for id in self.walk() {
                if !self.tree.kind(id).is_some_and(ComponentKind::is_composite) {
                    continue;
                }
                if let Err(e) = self.ensure_expanded(id) {
                    debug!(component = %id, error = %e, "expansion deferred");
                }
            }
            if self.generation == before {
                return;
            }
        }
        warn!(passes = MAX_SETTLE_PASSES, "replacements did not settle");
        self.report(
            Severity::Warning,
            format!("replacements did not settle after {MAX_SETTLE_PASSES} passes"),
            None,
            &[],
        );
    }

    /// Record a diagnostic located at a component.
    pub(crate) fn report(
        &mut self,
        severity: Severity,
        message: impl Into<String>,
        component: Option<ComponentId>,
        chain: &[String],
    ) {
        let mut diagnostic = Diagnostic::new(severity, message).with_chain(chain);
        if let Some(id) = component {
            if let (Some(path), Some(c)) = (self.component_path(id), self.tree.get(id)) {
                diagnostic = diagnostic.at(path, c.span);
            }
        }
        self.diagnostics.push(diagnostic);
    }
}

// =============================================================================
// ESSENTIAL STATE
// =============================================================================

impl Document {
    /// Every essential value, keyed by component path and variable name.
    pub fn export_essential_state(&mut self) -> Result<EssentialSnapshot, DocError> {
        self.ensure_live()?;
        self.settle();
        let essentials: Vec<(VarRef, Value)> = self
            .registry
            .essentials()
            .map(|(var, value)| (var.clone(), value.clone()))
            .collect();
        let entries = essentials
            .into_iter()
            .filter_map(|(var, value)| {
                Some(SnapshotEntry {
                    component: self.component_path(var.component)?,
                    variable: var.name,
                    value,
                })
            })
            .collect();
        Ok(EssentialSnapshot { entries })
    }

    /// Replay a snapshot onto this document.
    ///
    /// Entries are applied as their targets appear: restoring a sequence
    /// length can create replacements whose own entries apply on the next
    /// round. Entries whose target never appears are reported as skipped.
    pub fn restore_essential_state(
        &mut self,
        snapshot: &EssentialSnapshot,
    ) -> Result<RestoreReport, DocError> {
        self.ensure_live()?;
        let mut pending: Vec<&SnapshotEntry> = snapshot.entries.iter().collect();
        let mut applied = 0;
        for _ in 0..=snapshot.entries.len() {
            self.settle();
            let mut changed = Vec::new();
            let mut progressed = false;
            pending.retain(|entry| match self.restore_entry(entry) {
                Some(Some(var)) => {
                    changed.push(var);
                    progressed = true;
                    false
                }
                Some(None) => {
                    progressed = true;
                    false
                }
                None => true,
            });
            applied += changed.len();
            self.registry.invalidate(changed.iter());
            if !progressed || pending.is_empty() {
                break;
            }
        }
        self.settle();
        let skipped: Vec<String> = pending
            .iter()
            .map(|e| format!("{}.{}", e.component, e.variable))
            .collect();
        info!(applied, skipped = skipped.len(), "essential state restored");
        Ok(RestoreReport { applied, skipped })
    }

    /// `None`: target not found yet. `Some(None)`: found, value unchanged.
    fn restore_entry(&mut self, entry: &SnapshotEntry) -> Option<Option<VarRef>> {
        let id = if entry.component == "/" {
            self.root
        } else {
            match self.lookup(&entry.component) {
                Ok(Target::Component(id)) => id,
                _ => return None,
            }
        };
        let var = VarRef::new(id, entry.variable.clone());
        let current = self.registry.essential(&var)?;
        if current.approx_eq(&entry.value, self.config.numeric_tolerance) {
            return Some(None);
        }
        self.registry.set_essential(&var, entry.value.clone());
        Some(Some(var))
    }
}
