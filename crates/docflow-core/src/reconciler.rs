//! # Composite Reconciler
//!
//! Expands composites (`sequence`, `map`, `collect`, `copy`,
//! `conditionalContent`) into replacement subtrees and keeps those subtrees in
//! step with the composite's governing variable.
//!
//! Replacements are keyed ([`ReplacementKey`]). When the governing value
//! changes, old and new key lists are diffed: matched keys keep their
//! components (and therefore their essential state), unmatched old keys are
//! torn down, unmatched new keys are built. Expansion is lazy: it happens when
//! something reads a composite's replacements or when the session settles
//! before an external observation.

use crate::diagnostics::Severity;
use crate::kinds::{self, ComponentKind, DepSpec, VarSource};
use crate::namespace::{Binding, Reference, Target};
use crate::session::Document;
use crate::spec::{AttributeValue, ComponentSpec};
use crate::tree::{Component, Shadow};
use crate::types::{ComponentId, ResolveError, ScopeId, Value, VarRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Attributes of a copy that configure the copy itself rather than override
/// the copied component.
const COPY_OWN_ATTRIBUTES: [&str; 3] = ["source", "link", "assignNames"];

// =============================================================================
// TYPES
// =============================================================================

/// Stable identity of one replacement across re-expansions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplacementKey {
    /// Position in a sequence or map enumeration (1-based).
    Index(usize),
    /// A component matched by a collect.
    Component(ComponentId),
    /// The component a copy duplicates.
    Target(ComponentId),
    /// Selected branch of conditional content (1-based).
    Branch(usize),
}

/// Outcome of the last expansion of a composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum ExpansionStatus {
    /// Not expanded yet.
    Pending,
    Expanded,
    /// The governing value was unavailable; the composite has no replacements.
    Failed(String),
}

/// One keyed replacement.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub key: ReplacementKey,
    /// Enumeration item the replacement was built for.
    pub item: Value,
    pub roots: Vec<ComponentId>,
}

/// Ordered replacements of one composite.
#[derive(Debug, Clone)]
pub struct ReplacementList {
    pub entries: Vec<Replacement>,
    pub status: ExpansionStatus,
    /// Governing result the entries were built from.
    pub(crate) source: Option<Result<Value, ResolveError>>,
}

impl Default for ReplacementList {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            status: ExpansionStatus::Pending,
            source: None,
        }
    }
}

impl ReplacementList {
    /// Root components of every replacement, in order.
    #[must_use]
    pub fn roots(&self) -> Vec<ComponentId> {
        self.entries
            .iter()
            .flat_map(|entry| entry.roots.iter().copied())
            .collect()
    }
}

/// Scope a new component owns.
#[derive(Debug, Clone, Copy)]
pub(crate) enum OwnScope {
    /// None, unless the component is a composite.
    Inherit,
    Fresh,
    Existing(ScopeId),
}

/// Where a new component goes.
#[derive(Debug, Clone)]
pub(crate) struct Placement {
    pub(crate) parent: Option<ComponentId>,
    /// Scope the component's name is registered in.
    pub(crate) scope: ScopeId,
    /// Name to use instead of the template's.
    pub(crate) name: Option<String>,
    pub(crate) explicit: bool,
    pub(crate) own_scope: OwnScope,
    pub(crate) generated_by: Option<ComponentId>,
}

fn name_attribute(attributes: &BTreeMap<String, AttributeValue>, key: &str) -> Option<String> {
    match attributes.get(key)? {
        AttributeValue::Literal(Value::Text(name)) => Some(name.clone()),
        AttributeValue::Names(names) => names.first().cloned(),
        _ => None,
    }
}

fn binding_for(item: &Value) -> Binding {
    match item {
        Value::Component(id) => Binding::Component(*id),
        other => Binding::Literal(other.clone()),
    }
}

fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Variables of `kind` that a shadow tracks from its source, given the
/// attributes the shadow overrides.
pub(crate) fn shadowed_vars(
    kind: ComponentKind,
    overrides: &BTreeMap<String, AttributeValue>,
) -> BTreeSet<&'static str> {
    let table = kinds::spec(kind);
    let mut shadowed = BTreeSet::new();
    loop {
        let mut grew = false;
        for var_spec in table.vars {
            if shadowed.contains(var_spec.name) {
                continue;
            }
            let tracks = match var_spec.source {
                VarSource::Attribute { attribute, .. } => !overrides.contains_key(attribute),
                VarSource::Derived { deps, .. } => deps.iter().all(|dep| match dep {
                    DepSpec::Var(name) => shadowed.contains(name),
                    DepSpec::ChildVar { .. } => true,
                    DepSpec::ReferenceList { attribute, .. } => !overrides.contains_key(*attribute),
                }),
                VarSource::Governing => overrides.is_empty(),
            };
            if tracks {
                shadowed.insert(var_spec.name);
                grew = true;
            }
        }
        if !grew {
            return shadowed;
        }
    }
}

// =============================================================================
// BUILDING
// =============================================================================

impl Document {
    /// Build a component subtree from its spec.
    pub(crate) fn build(&mut self, spec: &ComponentSpec, placement: Placement) -> ComponentId {
        let id = self.tree.allocate_id();
        let explicit = placement.explicit || (placement.name.is_none() && spec.name.is_some());
        let name = match placement.name.clone().or_else(|| spec.name.clone()) {
            Some(name) => name,
            None => self.auto_name(placement.scope, spec.kind),
        };
        let own_scope = match placement.own_scope {
            OwnScope::Inherit if spec.kind.is_composite() => OwnScope::Fresh,
            other => other,
        };
        let template = if spec.kind.holds_template() {
            spec.children.clone()
        } else {
            Vec::new()
        };
        self.insert_component(
            Component {
                id,
                kind: spec.kind,
                name,
                explicit_name: explicit,
                parent: placement.parent,
                children: Vec::new(),
                attributes: spec.attributes.clone(),
                template,
                scope: placement.scope,
                own_scope: None,
                shadow: None,
                generated_by: placement.generated_by,
                span: spec.span,
            },
            own_scope,
        );
        if !spec.kind.holds_template() {
            let child_scope = self
                .tree
                .get(id)
                .map_or(placement.scope, Component::child_scope);
            for child in &spec.children {
                self.build(
                    child,
                    Placement {
                        parent: Some(id),
                        scope: child_scope,
                        name: None,
                        explicit: false,
                        own_scope: OwnScope::Inherit,
                        generated_by: None,
                    },
                );
            }
        }
        id
    }

    /// Register a component with its scope and variables.
    fn insert_component(&mut self, mut component: Component, own_scope: OwnScope) {
        let id = component.id;
        let kind = component.kind;
        component.own_scope = match own_scope {
            OwnScope::Inherit => None,
            OwnScope::Fresh => Some(self.scopes.create(Some(component.scope), Some(id))),
            OwnScope::Existing(scope) => Some(scope),
        };
        self.scopes.register(component.scope, &component.name, id);

        let mut rejected = Vec::new();
        for var_spec in kinds::spec(kind).vars {
            let essential = match var_spec.source {
                VarSource::Attribute {
                    attribute,
                    default,
                    domain,
                } if component.shadows(var_spec.name).is_none() => {
                    match component.attributes.get(attribute) {
                        None => Some(default()),
                        Some(AttributeValue::Literal(value)) => {
                            Some(domain.coerce(value.clone()).unwrap_or_else(|reason| {
                                rejected.push(format!("{attribute}: {reason}"));
                                default()
                            }))
                        }
                        Some(_) => None,
                    }
                }
                _ => None,
            };
            self.registry.insert(VarRef::new(id, var_spec.name), essential);
        }
        if kind.is_composite() {
            self.replacements.insert(id, ReplacementList::default());
        }
        self.tree.insert(component);
        self.generation += 1;

        for reason in rejected {
            warn!(component = %id, %reason, "invalid literal replaced by its default");
            self.report(
                Severity::Warning,
                format!("invalid attribute {reason}"),
                Some(id),
                &[],
            );
        }
    }

    /// Next free `_<kind><n>` name in a scope.
    fn auto_name(&mut self, scope: ScopeId, kind: ComponentKind) -> String {
        loop {
            let n = self.scopes.next_counter(scope, kind.name());
            let name = format!("{}{}{n}", self.config.auto_name_prefix, kind.name());
            if !self.scopes.is_taken(scope, &name) {
                return name;
            }
        }
    }

    /// Name of a replacement root: an assigned name, then the template's own
    /// name, then `_<kind><position>`.
    fn root_name(
        &self,
        scope: ScopeId,
        candidates: [Option<&str>; 2],
        kind: ComponentKind,
        position: usize,
    ) -> (String, bool) {
        for candidate in candidates.into_iter().flatten() {
            if !self.scopes.is_taken(scope, candidate) {
                return (candidate.to_string(), true);
            }
        }
        let base = format!("{}{}{position}", self.config.auto_name_prefix, kind.name());
        let mut name = base.clone();
        let mut suffix = 1;
        while self.scopes.is_taken(scope, &name) {
            suffix += 1;
            name = format!("{base}_{suffix}");
        }
        (name, false)
    }

    /// Remove a component, its built descendants and its replacements.
    pub(crate) fn teardown(&mut self, root: ComponentId) {
        for id in self.tree.subtree(root).into_iter().rev() {
            if let Some(list) = self.replacements.remove(&id) {
                for entry in list.entries {
                    for replacement in entry.roots {
                        self.teardown(replacement);
                    }
                }
            }
            if let Some(component) = self.tree.remove(id) {
                self.scopes
                    .unregister(component.scope, &component.name, id);
                if let Some(own) = component.own_scope {
                    if self.scopes.owner(own) == Some(id) {
                        self.scopes.remove(own);
                    }
                }
            }
            let removed = self.registry.remove_component(id);
            self.registry.invalidate(removed.iter());
            self.registry.forget(&removed);
        }
        self.generation += 1;
    }
}

// =============================================================================
// EXPANSION
// =============================================================================

impl Document {
    /// Bring a composite's replacements in line with its governing variable.
    pub(crate) fn ensure_expanded(&mut self, id: ComponentId) -> Result<(), ResolveError> {
        let Some(kind) = self.tree.kind(id) else {
            return Ok(());
        };
        let Some(governing) = kinds::spec(kind).governing else {
            return Ok(());
        };
        let var = VarRef::new(id, governing);
        if self.expanding.contains(&id) {
            let at = self.describe(&var);
            return Err(ResolveError::CycleDetected {
                chain: vec![at.clone(), at],
            });
        }
        self.expanding.insert(id);
        let result = self.resolve_var(&var);
        let outcome = match self.mirrored_source(id) {
            Some(source) => self.mirror(id, kind, source),
            None => {
                if !self.is_current(id, &result) {
                    self.reconcile(id, kind, result);
                }
                Ok(())
            }
        };
        self.expanding.remove(&id);
        outcome
    }

    fn is_current(&self, id: ComponentId, result: &Result<Value, ResolveError>) -> bool {
        self.replacements.get(&id).is_some_and(|list| {
            list.status != ExpansionStatus::Pending && list.source.as_ref() == Some(result)
        })
    }

    /// Source of a linked composite whose enumeration is the source's own.
    fn mirrored_source(&self, id: ComponentId) -> Option<ComponentId> {
        let component = self.tree.get(id)?;
        component.shadows(kinds::spec(component.kind).governing?)
    }

    /// Keep a linked composite's replacements one-to-one with its source's.
    fn mirror(
        &mut self,
        id: ComponentId,
        kind: ComponentKind,
        source: ComponentId,
    ) -> Result<(), ResolveError> {
        self.ensure_expanded(source)?;
        let (roots, status) = self
            .replacements
            .get(&source)
            .map(|list| (list.roots(), list.status.clone()))
            .unwrap_or_else(|| (Vec::new(), ExpansionStatus::Expanded));
        let (result, planned) = match status {
            ExpansionStatus::Failed(reason) => {
                (Err(ResolveError::failed(reason.clone())), Err(reason))
            }
            _ => (
                Ok(Value::Array(roots.iter().copied().map(Value::Component).collect())),
                Ok(roots
                    .into_iter()
                    .map(|root| (ReplacementKey::Target(root), Value::Component(root)))
                    .collect::<Vec<_>>()),
            ),
        };
        if !self.is_current(id, &result) {
            self.apply_items(id, kind, result, planned);
        }
        Ok(())
    }

    /// Replacement roots of a composite, expanding it first. Records the
    /// structural dependency on its governing variable.
    pub(crate) fn replacement_roots(
        &mut self,
        id: ComponentId,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Vec<ComponentId>, ResolveError> {
        self.ensure_expanded(id)?;
        if let Some(governing) = self.tree.kind(id).and_then(|k| kinds::spec(k).governing) {
            edges.insert(VarRef::new(id, governing));
        }
        Ok(self
            .replacements
            .get(&id)
            .map(ReplacementList::roots)
            .unwrap_or_default())
    }

    fn reconcile(
        &mut self,
        id: ComponentId,
        kind: ComponentKind,
        result: Result<Value, ResolveError>,
    ) {
        let planned = match &result {
            Ok(value) => self.replacement_items(kind, value),
            Err(e) => Err(e.to_string()),
        };
        let limit = self.config.max_replacements;
        let planned = planned.and_then(|items| {
            if items.len() > limit {
                Err(format!(
                    "too many replacements: {} exceeds the limit of {limit}",
                    items.len()
                ))
            } else {
                Ok(items)
            }
        });
        self.apply_items(id, kind, result, planned);
    }

    /// Diff planned items against the current replacements and rebuild.
    fn apply_items(
        &mut self,
        id: ComponentId,
        kind: ComponentKind,
        result: Result<Value, ResolveError>,
        planned: Result<Vec<(ReplacementKey, Value)>, String>,
    ) {
        let (status, items) = match planned {
            Ok(items) => (ExpansionStatus::Expanded, items),
            Err(reason) => {
                // governing errors were reported where they originated
                if result.is_ok() {
                    self.report(
                        Severity::Warning,
                        format!("cannot expand {kind}: {reason}"),
                        Some(id),
                        &[],
                    );
                }
                (ExpansionStatus::Failed(reason), Vec::new())
            }
        };

        let old = self
            .replacements
            .get_mut(&id)
            .map(|list| std::mem::take(&mut list.entries))
            .unwrap_or_default();
        let mut old_by_key: BTreeMap<ReplacementKey, Replacement> = old
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        let new_keys: BTreeSet<&ReplacementKey> = items.iter().map(|(key, _)| key).collect();

        let gone: Vec<ReplacementKey> = old_by_key
            .keys()
            .filter(|key| !new_keys.contains(key))
            .cloned()
            .collect();
        let removed = gone.len();
        for key in gone {
            if let Some(entry) = old_by_key.remove(&key) {
                for root in entry.roots {
                    self.teardown(root);
                }
            }
        }

        let mut entries = Vec::with_capacity(items.len());
        let (mut kept, mut built) = (0, 0);
        for (position, (key, item)) in items.into_iter().enumerate() {
            if let Some(mut entry) = old_by_key.remove(&key) {
                if entry.item != item {
                    if kind == ComponentKind::Map {
                        self.rebind_iteration(id, &entry.roots, &item);
                    }
                    entry.item = item;
                }
                kept += 1;
                entries.push(entry);
            } else {
                let roots = self.build_replacement(id, kind, &key, &item, position + 1);
                built += 1;
                entries.push(Replacement { key, item, roots });
            }
        }
        // duplicate keys in one enumeration leave extra old entries behind
        for (_, entry) in old_by_key {
            for root in entry.roots {
                self.teardown(root);
            }
        }

        if let Some(list) = self.replacements.get_mut(&id) {
            list.entries = entries;
            list.status = status;
            list.source = Some(result);
        }
        if built > 0 || removed > 0 {
            self.registry.wake_awaiting();
        }
        debug!(component = %id, %kind, kept, built, removed, "reconciled");
    }

    /// Keyed enumeration items for a governing value.
    fn replacement_items(
        &self,
        kind: ComponentKind,
        value: &Value,
    ) -> Result<Vec<(ReplacementKey, Value)>, String> {
        let list = || match value {
            Value::Array(items) => Ok(items.clone()),
            Value::Null => Ok(Vec::new()),
            other => Err(format!("expected a list, got {}", other.type_name())),
        };
        let component = |item: &Value| {
            item.as_component()
                .ok_or_else(|| format!("expected a component, got {}", item.type_name()))
        };
        match kind {
            ComponentKind::Sequence | ComponentKind::Map => Ok(list()?
                .into_iter()
                .enumerate()
                .map(|(i, item)| (ReplacementKey::Index(i + 1), item))
                .collect()),
            ComponentKind::Collect => list()?
                .into_iter()
                .map(|item| Ok((ReplacementKey::Component(component(&item)?), item)))
                .collect(),
            ComponentKind::Copy => list()?
                .into_iter()
                .map(|item| Ok((ReplacementKey::Target(component(&item)?), item)))
                .collect(),
            ComponentKind::Conditional => {
                let branch = value.as_f64().unwrap_or(0.0);
                if branch >= 1.0 {
                    Ok(vec![(ReplacementKey::Branch(branch as usize), value.clone())])
                } else {
                    Ok(Vec::new())
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    fn build_replacement(
        &mut self,
        id: ComponentId,
        kind: ComponentKind,
        key: &ReplacementKey,
        item: &Value,
        position: usize,
    ) -> Vec<ComponentId> {
        let Some(composite) = self.tree.get(id) else {
            return Vec::new();
        };
        let scope = composite.child_scope();
        let attributes = composite.attributes.clone();
        let template = composite.template.clone();
        let assigned: Vec<String> = match attributes.get("assignNames") {
            Some(AttributeValue::Names(names)) => names.clone(),
            _ => Vec::new(),
        };
        let base = Placement {
            parent: Some(id),
            scope,
            name: None,
            explicit: false,
            own_scope: OwnScope::Inherit,
            generated_by: Some(id),
        };
        let slot_name = |index: usize| assigned.get(index).map(String::as_str);

        if self.mirrored_source(id).is_some() {
            let ReplacementKey::Target(root) = key else {
                return Vec::new();
            };
            return self
                .mirror_name(scope, *root, position)
                .and_then(|name| self.build_shadow(*root, BTreeMap::new(), base, name))
                .into_iter()
                .collect();
        }

        match (kind, key) {
            (ComponentKind::Sequence, ReplacementKey::Index(i)) => {
                let spec = ComponentSpec::new(ComponentKind::Number).attr(
                    "value",
                    AttributeValue::Bound {
                        var: VarRef::new(id, "values"),
                        index: Some(i - 1),
                    },
                );
                let (name, explicit) =
                    self.root_name(scope, [slot_name(position - 1), None], spec.kind, position);
                vec![self.build(
                    &spec,
                    Placement {
                        name: Some(name),
                        explicit,
                        ..base
                    },
                )]
            }
            (ComponentKind::Map, ReplacementKey::Index(i)) => {
                let (name, explicit) = self.root_name(
                    scope,
                    [slot_name(position - 1), None],
                    ComponentKind::Group,
                    position,
                );
                let group = self.build(
                    &ComponentSpec::new(ComponentKind::Group),
                    Placement {
                        name: Some(name),
                        explicit,
                        own_scope: OwnScope::Fresh,
                        ..base
                    },
                );
                let group_scope = self
                    .tree
                    .get(group)
                    .map_or(scope, Component::child_scope);
                if let Some(alias) = name_attribute(&attributes, "alias") {
                    self.scopes.bind(group_scope, &alias, binding_for(item));
                }
                if let Some(index_alias) = name_attribute(&attributes, "indexAlias") {
                    self.scopes.bind(
                        group_scope,
                        &index_alias,
                        Binding::Literal(Value::Number(*i as f64)),
                    );
                }
                for child in &template {
                    self.build(
                        child,
                        Placement {
                            parent: Some(group),
                            scope: group_scope,
                            name: None,
                            explicit: false,
                            own_scope: OwnScope::Inherit,
                            generated_by: None,
                        },
                    );
                }
                vec![group]
            }
            (ComponentKind::Collect, ReplacementKey::Component(source)) => self
                .shadow_root_name(scope, *source, slot_name(position - 1), position)
                .and_then(|name| self.build_shadow(*source, BTreeMap::new(), base, name))
                .into_iter()
                .collect(),
            (ComponentKind::Copy, ReplacementKey::Target(target)) => {
                let overrides: BTreeMap<String, AttributeValue> = attributes
                    .into_iter()
                    .filter(|(k, _)| !COPY_OWN_ATTRIBUTES.contains(&k.as_str()))
                    .collect();
                let link = self
                    .resolve_var(&VarRef::new(id, "link"))
                    .ok()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                if link {
                    return self
                        .shadow_root_name(scope, *target, slot_name(position - 1), position)
                        .and_then(|name| self.build_shadow(*target, overrides, base, name))
                        .into_iter()
                        .collect();
                }
                let Some(mut spec) = self.snapshot_spec(*target) else {
                    return Vec::new();
                };
                spec.name = None;
                spec.attributes.extend(overrides);
                let source_scope = self.tree.get(*target).and_then(|c| c.own_scope);
                let (name, explicit) =
                    self.root_name(scope, [slot_name(position - 1), None], spec.kind, position);
                let root = self.build(
                    &spec,
                    Placement {
                        name: Some(name),
                        explicit,
                        own_scope: if source_scope.is_some() {
                            OwnScope::Fresh
                        } else {
                            OwnScope::Inherit
                        },
                        ..base
                    },
                );
                self.copy_bindings(source_scope, root);
                vec![root]
            }
            (ComponentKind::Conditional, ReplacementKey::Branch(b)) => {
                let branch = self
                    .tree
                    .children(id)
                    .into_iter()
                    .filter(|c| {
                        matches!(
                            self.tree.kind(*c),
                            Some(ComponentKind::Case | ComponentKind::Else)
                        )
                    })
                    .nth(b - 1);
                let specs = branch
                    .and_then(|c| self.tree.get(c))
                    .map(|c| c.template.clone())
                    .unwrap_or_default();
                let mut roots = Vec::with_capacity(specs.len());
                for (k, spec) in specs.iter().enumerate() {
                    let (name, explicit) =
                        self.root_name(scope, [slot_name(k), spec.name.as_deref()], spec.kind, k + 1);
                    roots.push(self.build(
                        spec,
                        Placement {
                            name: Some(name),
                            explicit,
                            ..base.clone()
                        },
                    ));
                }
                roots
            }
            _ => Vec::new(),
        }
    }

    /// Name of a shadow root: an assigned name, else `_<kind><position>`.
    fn shadow_root_name(
        &self,
        scope: ScopeId,
        source: ComponentId,
        assigned: Option<&str>,
        position: usize,
    ) -> Option<(String, bool)> {
        let kind = self.tree.kind(source)?;
        Some(self.root_name(scope, [assigned, None], kind, position))
    }

    /// A mirrored component keeps its source's name unless it is taken.
    fn mirror_name(
        &self,
        scope: ScopeId,
        source: ComponentId,
        position: usize,
    ) -> Option<(String, bool)> {
        let component = self.tree.get(source)?;
        let (name, _) = self.root_name(scope, [Some(&component.name), None], component.kind, position);
        let explicit = component.explicit_name && name == component.name;
        Some((name, explicit))
    }

    /// Give `root` the iteration bindings of the scope it was copied from.
    fn copy_bindings(&mut self, from: Option<ScopeId>, root: ComponentId) {
        let Some(from) = from else {
            return;
        };
        let Some(to) = self.tree.get(root).and_then(|c| c.own_scope) else {
            return;
        };
        for (name, binding) in self.scopes.bindings(from) {
            self.scopes.bind(to, &name, binding);
        }
    }

    /// Build a linked shadow of `source` with attribute overrides, mirroring
    /// the source's children below it.
    fn build_shadow(
        &mut self,
        source: ComponentId,
        overrides: BTreeMap<String, AttributeValue>,
        placement: Placement,
        (name, explicit): (String, bool),
    ) -> Option<ComponentId> {
        let (kind, source_scope, span, children) = {
            let component = self.tree.get(source)?;
            (
                component.kind,
                component.own_scope,
                component.span,
                component.children.clone(),
            )
        };
        let id = self.tree.allocate_id();
        let vars = shadowed_vars(kind, &overrides);
        let own_scope = if kind.is_composite() || source_scope.is_some() {
            OwnScope::Fresh
        } else {
            OwnScope::Inherit
        };
        self.insert_component(
            Component {
                id,
                kind,
                name,
                explicit_name: explicit,
                parent: placement.parent,
                children: Vec::new(),
                attributes: overrides,
                template: Vec::new(),
                scope: placement.scope,
                own_scope: None,
                shadow: Some(Shadow { source, vars }),
                generated_by: placement.generated_by,
                span,
            },
            own_scope,
        );
        self.copy_bindings(source_scope, id);

        let child_scope = self
            .tree
            .get(id)
            .map_or(placement.scope, Component::child_scope);
        for (position, child) in children.into_iter().enumerate() {
            let Some(name) = self.mirror_name(child_scope, child, position + 1) else {
                continue;
            };
            self.build_shadow(
                child,
                BTreeMap::new(),
                Placement {
                    parent: Some(id),
                    scope: child_scope,
                    name: None,
                    explicit: false,
                    own_scope: OwnScope::Inherit,
                    generated_by: None,
                },
                name,
            );
        }
        Some(id)
    }

    /// Spec of a component's current state, for unlinked copies.
    ///
    /// Built from the syntactic spec plus current essential values. A shadow
    /// takes its source's snapshot with its own resolved attribute values.
    fn snapshot_spec(&mut self, target: ComponentId) -> Option<ComponentSpec> {
        let component = self.tree.get(target)?.clone();
        let table = kinds::spec(component.kind);
        let mut spec = ComponentSpec::new(component.kind);
        spec.span = component.span;
        if component.explicit_name {
            spec.name = Some(component.name.clone());
        }

        let attribute_vars = table.vars.iter().filter_map(|v| match v.source {
            VarSource::Attribute { attribute, .. } => Some((v.name, attribute)),
            _ => None,
        });

        if let Some(shadow) = &component.shadow {
            let mut spec = match self.snapshot_spec(shadow.source) {
                Some(source) => ComponentSpec {
                    name: spec.name,
                    span: spec.span,
                    ..source
                },
                None => spec,
            };
            for (var, attribute) in attribute_vars {
                if let Ok(value) = self.resolve_var(&VarRef::new(target, var)) {
                    if !value.is_null() {
                        spec.attributes
                            .insert(attribute.to_string(), AttributeValue::Literal(value));
                    }
                }
            }
            return Some(spec);
        }

        for (key, value) in &component.attributes {
            let copied = match value {
                AttributeValue::Bound { var, index } => {
                    let resolved = self.resolve_var(var).and_then(|v| match index {
                        Some(i) => crate::resolver::index_value(v, &[i + 1], key),
                        None => Ok(v),
                    });
                    match resolved {
                        Ok(v) => AttributeValue::Literal(v),
                        Err(_) => continue,
                    }
                }
                other => other.clone(),
            };
            spec.attributes.insert(key.clone(), copied);
        }
        for (var, attribute) in attribute_vars {
            if let Some(value) = self.registry.essential(&VarRef::new(target, var)) {
                spec.attributes
                    .insert(attribute.to_string(), AttributeValue::Literal(value.clone()));
            }
        }

        if component.kind.holds_template() {
            spec.children = component.template.clone();
        } else {
            for child in component.children {
                if let Some(child_spec) = self.snapshot_spec(child) {
                    spec.children.push(child_spec);
                }
            }
        }
        Some(spec)
    }

    /// Point a kept map iteration at a new item.
    fn rebind_iteration(&mut self, map: ComponentId, roots: &[ComponentId], item: &Value) {
        let alias = self
            .tree
            .get(map)
            .and_then(|c| name_attribute(&c.attributes, "alias"));
        for root in roots {
            if let (Some(alias), Some(scope)) = (&alias, self.tree.get(*root).and_then(|c| c.own_scope)) {
                self.scopes.bind(scope, alias, binding_for(item));
            }
            let vars: Vec<VarRef> = self
                .tree
                .subtree(*root)
                .into_iter()
                .filter_map(|id| self.tree.kind(id).map(|k| (id, k)))
                .flat_map(|(id, kind)| {
                    kinds::spec(kind)
                        .vars
                        .iter()
                        .map(move |v| VarRef::new(id, v.name))
                })
                .collect();
            self.registry.invalidate(vars.iter());
        }
    }
}

// =============================================================================
// GOVERNING ENUMERATIONS
// =============================================================================

impl Document {
    /// Enumeration of a map, collect or copy.
    pub(crate) fn compute_governing(
        &mut self,
        id: ComponentId,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Value, ResolveError> {
        let (kind, scope, attributes) = {
            let component = self
                .tree
                .get(id)
                .ok_or_else(|| ResolveError::failed("component is gone"))?;
            (
                component.kind,
                component.reference_scope(),
                component.attributes.clone(),
            )
        };
        match kind {
            ComponentKind::Map => self.map_sources(scope, attributes.get("sources"), edges),
            ComponentKind::Collect => self.collect_matches(id, scope, &attributes, edges),
            ComponentKind::Copy => self.copy_targets(id, scope, attributes.get("source"), edges),
            other => Err(ResolveError::failed(format!(
                "a {other} has no governing enumeration"
            ))),
        }
    }

    /// Items a reference stands for: the replacements of a composite, the
    /// component itself, or the elements of a value.
    fn reference_items(
        &mut self,
        scope: ScopeId,
        text: &str,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Vec<Value>, ResolveError> {
        let parsed = Reference::parse(text).map_err(|e| ResolveError::UnresolvedReference {
            reference: text.to_string(),
            reason: e.to_string(),
            chain: Vec::new(),
        })?;
        let target = self
            .resolve_target(scope, &parsed, text, edges)
            .map_err(|e| e.into_resolve_error(text))?;
        match target {
            Target::Component(c) if self.tree.kind(c).is_some_and(ComponentKind::is_composite) => {
                Ok(self
                    .replacement_roots(c, edges)?
                    .into_iter()
                    .map(Value::Component)
                    .collect())
            }
            Target::Component(c) => Ok(vec![Value::Component(c)]),
            Target::Var { var, indices } => {
                edges.insert(var.clone());
                let value = self.resolve_var(&var)?;
                Ok(as_list(crate::resolver::index_value(value, &indices, text)?))
            }
            Target::Literal(value) => Ok(as_list(value)),
        }
    }

    fn map_sources(
        &mut self,
        scope: ScopeId,
        sources: Option<&AttributeValue>,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Value, ResolveError> {
        match sources {
            None => Err(ResolveError::failed("a map needs 'sources'")),
            Some(AttributeValue::Reference(text)) => {
                Ok(Value::Array(self.reference_items(scope, text, edges)?))
            }
            Some(AttributeValue::References(list)) => {
                let mut items = Vec::new();
                for text in list {
                    items.extend(self.reference_items(scope, text, edges)?);
                }
                Ok(Value::Array(items))
            }
            Some(other) => Ok(Value::Array(as_list(
                self.attribute_value(scope, other, edges)?,
            ))),
        }
    }

    fn copy_targets(
        &mut self,
        id: ComponentId,
        scope: ScopeId,
        source: Option<&AttributeValue>,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Value, ResolveError> {
        let Some(AttributeValue::Reference(text)) = source else {
            return Err(ResolveError::failed("a copy needs a 'source' reference"));
        };
        let items = self.reference_items(scope, text, edges)?;
        for item in &items {
            let Some(target) = item.as_component() else {
                return Err(ResolveError::UnresolvedReference {
                    reference: text.clone(),
                    reason: "a copy source must name a component".to_string(),
                    chain: Vec::new(),
                });
            };
            if self.encloses(target, id) {
                return Err(ResolveError::failed(format!(
                    "{text} encloses the copy itself"
                )));
            }
        }
        Ok(Value::Array(items))
    }

    /// Whether `outer` is `inner` or one of its ancestors.
    fn encloses(&self, outer: ComponentId, inner: ComponentId) -> bool {
        let mut current = Some(inner);
        while let Some(id) = current {
            if id == outer {
                return true;
            }
            current = self.tree.get(id).and_then(|c| c.parent);
        }
        false
    }

    fn collect_matches(
        &mut self,
        id: ComponentId,
        scope: ScopeId,
        attributes: &BTreeMap<String, AttributeValue>,
        edges: &mut BTreeSet<VarRef>,
    ) -> Result<Value, ResolveError> {
        let Some(AttributeValue::Reference(text)) = attributes.get("source") else {
            return Err(ResolveError::failed("a collect needs a 'source' reference"));
        };
        let wanted = match attributes.get("componentKind") {
            Some(AttributeValue::Literal(Value::Text(name))) => ComponentKind::from_name(name)
                .ok_or_else(|| ResolveError::failed(format!("unknown component kind '{name}'")))?,
            _ => return Err(ResolveError::failed("a collect needs a 'componentKind'")),
        };
        let limit = match attributes.get("maxNumber") {
            Some(value) => self
                .attribute_value(scope, value, edges)?
                .as_f64()
                .map(|n| n.max(0.0) as usize),
            None => None,
        };

        let parsed = Reference::parse(text).map_err(|e| ResolveError::UnresolvedReference {
            reference: text.clone(),
            reason: e.to_string(),
            chain: Vec::new(),
        })?;
        let source = match self
            .resolve_target(scope, &parsed, text, edges)
            .map_err(|e| e.into_resolve_error(text))?
        {
            Target::Component(c) => c,
            _ => {
                return Err(ResolveError::UnresolvedReference {
                    reference: text.clone(),
                    reason: "a collect source must name a component".to_string(),
                    chain: Vec::new(),
                });
            }
        };

        let mut found = Vec::new();
        self.descendants_of_kind(source, wanted, id, edges, &mut found);
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(Value::Array(found.into_iter().map(Value::Component).collect()))
    }

    /// Depth-first search for components of `wanted` below `id`, expanding
    /// nested composites. `skip` (the collecting composite) is not entered.
    fn descendants_of_kind(
        &mut self,
        id: ComponentId,
        wanted: ComponentKind,
        skip: ComponentId,
        edges: &mut BTreeSet<VarRef>,
        out: &mut Vec<ComponentId>,
    ) {
        let children = if self.tree.kind(id).is_some_and(ComponentKind::is_composite) {
            self.replacement_roots(id, edges).unwrap_or_default()
        } else {
            self.tree.children(id)
        };
        for child in children {
            if child == skip {
                continue;
            }
            if self.tree.kind(child) == Some(wanted) {
                out.push(child);
            }
            self.descendants_of_kind(child, wanted, skip, edges, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    fn doc(children: Vec<ComponentSpec>) -> Document {
        Document::new(&ComponentSpec::new(ComponentKind::Document).with_children(children))
            .expect("build")
    }

    fn point(name: &str, x: f64, y: f64) -> ComponentSpec {
        ComponentSpec::new(ComponentKind::Point)
            .named(name)
            .attr("coords", AttributeValue::Literal(Value::point(x, y)))
    }

    fn sequence(name: &str, length: AttributeValue) -> ComponentSpec {
        ComponentSpec::new(ComponentKind::Sequence)
            .named(name)
            .attr("length", length)
    }

    fn set(d: &mut Document, component: &str, var: &str, value: Value) {
        let id = d.component_id(component).expect("component");
        let var = VarRef::new(id, var);
        assert!(d.registry.set_essential(&var, value));
        d.registry.invalidate([var].iter());
    }

    #[test]
    fn sequence_expands_to_numbers() {
        let mut d = doc(vec![sequence("s", AttributeValue::number(3.0))]);
        assert_eq!(
            d.replacement_paths("$s").expect("paths"),
            vec!["/s/_number1", "/s/_number2", "/s/_number3"]
        );
        assert_eq!(d.value("$s[2]").expect("item"), Value::Number(2.0));
        assert_eq!(d.replacement_status("$s").expect("status"), ExpansionStatus::Expanded);
    }

    #[test]
    fn resizing_keeps_matched_replacements() {
        let mut d = doc(vec![sequence("s", AttributeValue::number(2.0))]);
        let first = d.component_id("$s[1]").expect("first");
        set(&mut d, "$s", "length", Value::Number(4.0));
        assert_eq!(d.replacement_paths("$s").expect("paths").len(), 4);
        assert_eq!(d.component_id("$s[1]").expect("first"), first);
        set(&mut d, "$s", "length", Value::Number(1.0));
        assert_eq!(d.replacement_paths("$s").expect("paths").len(), 1);
        assert!(d.resolution("$s[3]").expect("resolution").is_unresolved());
    }

    #[test]
    fn failed_expansion_differs_from_empty() {
        let mut d = doc(vec![
            sequence("empty", AttributeValue::number(0.0)),
            sequence("broken", AttributeValue::reference("$nowhere")),
        ]);
        assert_eq!(
            d.replacement_status("$empty").expect("status"),
            ExpansionStatus::Expanded
        );
        assert!(matches!(
            d.replacement_status("$broken").expect("status"),
            ExpansionStatus::Failed(_)
        ));
        assert!(d.replacement_paths("$broken").expect("paths").is_empty());
    }

    #[test]
    fn too_many_replacements_fail() {
        let spec = ComponentSpec::new(ComponentKind::Document)
            .child(sequence("s", AttributeValue::number(50.0)));
        let config = crate::EngineConfig {
            max_replacements: 10,
            ..crate::EngineConfig::default()
        };
        let mut d = Document::with_options(&spec, config, Box::new(crate::ArithmeticCas::new()))
            .expect("build");
        match d.replacement_status("$s").expect("status") {
            ExpansionStatus::Failed(reason) => assert!(reason.contains("too many")),
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[test]
    fn map_binds_alias_per_iteration() {
        let template = ComponentSpec::new(ComponentKind::Number).named("twice").attr(
            "value",
            AttributeValue::expression("2 a + i", &[("a", "$a"), ("i", "$i")]),
        );
        let mut d = doc(vec![
            sequence("s", AttributeValue::number(3.0)),
            ComponentSpec::new(ComponentKind::Map)
                .named("m")
                .attr("sources", AttributeValue::reference("$s"))
                .attr("alias", AttributeValue::Literal(Value::text("a")))
                .attr("indexAlias", AttributeValue::Literal(Value::text("i")))
                .child(template),
        ]);
        assert_eq!(d.value("$m[3]/twice").expect("value"), Value::Number(9.0));
        assert_eq!(d.value("/m/_group2/twice").expect("value"), Value::Number(6.0));
    }

    #[test]
    fn linked_copy_tracks_and_overrides() {
        let mut d = doc(vec![
            point("P", 1.0, 2.0).attr("fixed", AttributeValue::Literal(Value::Bool(true))),
            ComponentSpec::new(ComponentKind::Copy)
                .named("c")
                .attr("source", AttributeValue::reference("$P"))
                .attr("fixed", AttributeValue::Literal(Value::Bool(false))),
        ]);
        assert_eq!(d.value("$c.coords").expect("coords"), Value::point(1.0, 2.0));
        assert_eq!(d.value("$c.fixed").expect("fixed"), Value::Bool(false));
        set(&mut d, "$P", "coords", Value::point(7.0, 8.0));
        assert_eq!(d.value("$c.x").expect("x"), Value::Number(7.0));
    }

    #[test]
    fn unlinked_copy_of_shadow_uses_resolved_values() {
        let mut d = doc(vec![
            point("P", 3.0, 4.0),
            ComponentSpec::new(ComponentKind::Copy)
                .named("linked")
                .attr("source", AttributeValue::reference("$P")),
            ComponentSpec::new(ComponentKind::Copy)
                .named("frozen")
                .attr("source", AttributeValue::reference("$linked"))
                .attr("link", AttributeValue::Literal(Value::Bool(false))),
        ]);
        assert_eq!(d.value("$frozen.coords").expect("coords"), Value::point(3.0, 4.0));
        set(&mut d, "$P", "coords", Value::point(0.0, 0.0));
        assert_eq!(d.value("$linked.coords").expect("coords"), Value::point(0.0, 0.0));
        assert_eq!(d.value("$frozen.coords").expect("coords"), Value::point(3.0, 4.0));
    }

    #[test]
    fn shadowed_composites_mirror_their_source() {
        let mut d = doc(vec![
            ComponentSpec::new(ComponentKind::Graph)
                .named("g")
                .child(sequence("s", AttributeValue::number(2.0))),
            ComponentSpec::new(ComponentKind::Copy)
                .named("c")
                .attr("source", AttributeValue::reference("$g")),
        ]);
        assert_eq!(
            d.replacement_paths("/c/s").expect("paths"),
            vec!["/c/s/_number1", "/c/s/_number2"]
        );
        set(&mut d, "$s", "length", Value::Number(3.0));
        assert_eq!(d.replacement_paths("/c/s").expect("paths").len(), 3);
        assert_eq!(d.value("/c/s[3]").expect("third"), Value::Number(3.0));
        set(&mut d, "$s", "length", Value::Number(1.0));
        assert_eq!(d.replacement_paths("/c/s").expect("paths"), vec!["/c/s/_number1"]);
    }

    #[test]
    fn copy_of_enclosing_component_fails() {
        let mut d = doc(vec![ComponentSpec::new(ComponentKind::Section).named("sec").child(
            ComponentSpec::new(ComponentKind::Copy)
                .named("c")
                .attr("source", AttributeValue::reference("$sec")),
        )]);
        assert!(matches!(
            d.replacement_status("$c").expect("status"),
            ExpansionStatus::Failed(_)
        ));
    }

    #[test]
    fn collect_shadows_matching_descendants() {
        let mut d = doc(vec![
            ComponentSpec::new(ComponentKind::Graph)
                .named("g")
                .with_children([point("A", 1.0, 1.0), point("B", 2.0, 2.0)])
                .child(ComponentSpec::new(ComponentKind::Number).named("n")),
            ComponentSpec::new(ComponentKind::Collect)
                .named("pts")
                .attr("source", AttributeValue::reference("$g"))
                .attr("componentKind", AttributeValue::Literal(Value::text("point"))),
        ]);
        assert_eq!(d.value("$pts.count").expect("count"), Value::Number(2.0));
        assert_eq!(d.value("$pts[2].coords").expect("coords"), Value::point(2.0, 2.0));
    }

    #[test]
    fn conditional_switches_branches() {
        let case = ComponentSpec::new(ComponentKind::Case)
            .attr("condition", AttributeValue::reference("$flag"))
            .child(ComponentSpec::new(ComponentKind::Text).named("msg").attr(
                "value",
                AttributeValue::Literal(Value::text("on")),
            ));
        let otherwise = ComponentSpec::new(ComponentKind::Else).child(
            ComponentSpec::new(ComponentKind::Text)
                .named("msg")
                .attr("value", AttributeValue::Literal(Value::text("off"))),
        );
        let mut d = doc(vec![
            ComponentSpec::new(ComponentKind::BooleanInput).named("flag"),
            ComponentSpec::new(ComponentKind::Conditional)
                .named("cc")
                .with_children([case, otherwise]),
        ]);
        assert_eq!(d.value("$cc/msg").expect("msg"), Value::text("off"));
        set(&mut d, "$flag", "value", Value::Bool(true));
        assert_eq!(d.value("$cc/msg").expect("msg"), Value::text("on"));
    }

    #[test]
    fn torn_down_targets_become_unresolved() {
        let mut d = doc(vec![
            sequence("s", AttributeValue::number(3.0)),
            ComponentSpec::new(ComponentKind::Number)
                .named("third")
                .attr("value", AttributeValue::reference("$s[3]")),
        ]);
        assert_eq!(d.value("$third").expect("third"), Value::Number(3.0));
        set(&mut d, "$s", "length", Value::Number(2.0));
        assert!(matches!(
            d.resolution("$third").expect("third"),
            Resolution::Unresolved(_)
        ));
        set(&mut d, "$s", "length", Value::Number(3.0));
        assert_eq!(d.value("$third").expect("third"), Value::Number(3.0));
    }

    #[test]
    fn shadow_vars_respect_overrides() {
        let none = shadowed_vars(ComponentKind::Point, &BTreeMap::new());
        assert!(none.contains("coords") && none.contains("x") && none.contains("fixed"));
        let overrides = BTreeMap::from([(
            "coords".to_string(),
            AttributeValue::Literal(Value::point(0.0, 0.0)),
        )]);
        let some = shadowed_vars(ComponentKind::Point, &overrides);
        assert!(!some.contains("coords"));
        assert!(!some.contains("x"));
        assert!(some.contains("label"));

        assert!(shadowed_vars(ComponentKind::Map, &BTreeMap::new()).contains("sourceItems"));
        let sources = BTreeMap::from([(
            "sources".to_string(),
            AttributeValue::Reference("$s".to_string()),
        )]);
        assert!(!shadowed_vars(ComponentKind::Map, &sources).contains("sourceItems"));
    }
}
