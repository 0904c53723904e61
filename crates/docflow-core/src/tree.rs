//! # Component Tree Store
//!
//! Owns every live component instance of a document session: kind,
//! attributes, parent/children links and namespace placement. Pure data with
//! structural queries; all behavior lives in the resolver, propagator and
//! reconciler.

use crate::kinds::ComponentKind;
use crate::spec::{AttributeValue, ComponentSpec, SourceSpan};
use crate::types::{ComponentId, ScopeId};
use std::collections::{BTreeMap, BTreeSet};

/// Link from a shadow component to the component it tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shadow {
    pub source: ComponentId,
    /// Variables that track the source instead of being computed locally.
    pub vars: BTreeSet<&'static str>,
}

/// One component instance.
#[derive(Debug, Clone)]
pub struct Component {
    pub id: ComponentId,
    pub kind: ComponentKind,
    pub name: String,
    /// Whether `name` came from the document (or `assignNames`).
    pub explicit_name: bool,
    pub parent: Option<ComponentId>,
    /// Built children, in document order. Replacements are tracked separately.
    pub children: Vec<ComponentId>,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Unbuilt child specs of template-holding kinds.
    pub template: Vec<ComponentSpec>,
    /// Scope the component's name is registered in.
    pub scope: ScopeId,
    /// Scope owned by the component, if it opens one.
    pub own_scope: Option<ScopeId>,
    pub shadow: Option<Shadow>,
    /// Composite that generated this component as a replacement root.
    pub generated_by: Option<ComponentId>,
    pub span: Option<SourceSpan>,
}

impl Component {
    /// Scope in which the component's own attribute references are resolved.
    #[must_use]
    pub fn reference_scope(&self) -> ScopeId {
        self.scope
    }

    /// Scope its built children are registered in.
    #[must_use]
    pub fn child_scope(&self) -> ScopeId {
        self.own_scope.unwrap_or(self.scope)
    }

    /// Whether `var` is tracked from a shadow source.
    #[must_use]
    pub fn shadows(&self, var: &str) -> Option<ComponentId> {
        self.shadow
            .as_ref()
            .filter(|s| s.vars.contains(var))
            .map(|s| s.source)
    }
}

/// Arena of component instances.
#[derive(Debug, Default)]
pub struct ComponentTree {
    components: BTreeMap<ComponentId, Component>,
    next_id: u64,
}

impl ComponentTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id. Ids are never reused within a session.
    pub fn allocate_id(&mut self) -> ComponentId {
        let id = ComponentId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, component: Component) {
        if let Some(parent) = component.parent {
            if component.generated_by.is_none() {
                if let Some(p) = self.components.get_mut(&parent) {
                    p.children.push(component.id);
                }
            }
        }
        self.components.insert(component.id, component);
    }

    /// Remove a single component, unlinking it from its parent.
    pub fn remove(&mut self, id: ComponentId) -> Option<Component> {
        let component = self.components.remove(&id)?;
        if let Some(parent) = component.parent {
            if let Some(p) = self.components.get_mut(&parent) {
                p.children.retain(|c| *c != id);
            }
        }
        Some(component)
    }

    #[must_use]
    pub fn get(&self, id: ComponentId) -> Option<&Component> {
        self.components.get(&id)
    }

    pub fn get_mut(&mut self, id: ComponentId) -> Option<&mut Component> {
        self.components.get_mut(&id)
    }

    #[must_use]
    pub fn contains(&self, id: ComponentId) -> bool {
        self.components.contains_key(&id)
    }

    #[must_use]
    pub fn kind(&self, id: ComponentId) -> Option<ComponentKind> {
        self.components.get(&id).map(|c| c.kind)
    }

    /// Built children of a component (empty if it does not exist).
    #[must_use]
    pub fn children(&self, id: ComponentId) -> Vec<ComponentId> {
        self.components
            .get(&id)
            .map(|c| c.children.clone())
            .unwrap_or_default()
    }

    /// Ids of all live components, in id order.
    pub fn ids(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.components.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Reconstruct the syntactic spec of a subtree.
    ///
    /// Returns `None` for shadows, which have no syntactic source of their own.
    #[must_use]
    pub fn to_spec(&self, id: ComponentId) -> Option<ComponentSpec> {
        let component = self.components.get(&id)?;
        if component.shadow.is_some() {
            return None;
        }
        let mut children = Vec::new();
        if component.kind.holds_template() {
            children.extend(component.template.iter().cloned());
        } else {
            for child in &component.children {
                children.push(self.to_spec(*child)?);
            }
        }
        Some(ComponentSpec {
            kind: component.kind,
            name: component.explicit_name.then(|| component.name.clone()),
            attributes: component
                .attributes
                .iter()
                .filter(|(_, v)| !matches!(v, AttributeValue::Bound { .. }))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            children,
            span: component.span,
        })
    }

    /// The component and all its built descendants, parents first.
    #[must_use]
    pub fn subtree(&self, id: ComponentId) -> Vec<ComponentId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(component) = self.components.get(&current) {
                out.push(current);
                stack.extend(component.children.iter().rev().copied());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(tree: &mut ComponentTree, kind: ComponentKind, parent: Option<ComponentId>) -> ComponentId {
        let id = tree.allocate_id();
        tree.insert(Component {
            id,
            kind,
            name: format!("c{}", id.0),
            explicit_name: true,
            parent,
            children: Vec::new(),
            attributes: BTreeMap::new(),
            template: Vec::new(),
            scope: ScopeId(0),
            own_scope: None,
            shadow: None,
            generated_by: None,
            span: None,
        });
        id
    }

    #[test]
    fn insert_links_children_in_order() {
        let mut tree = ComponentTree::new();
        let root = component(&mut tree, ComponentKind::Document, None);
        let a = component(&mut tree, ComponentKind::Point, Some(root));
        let b = component(&mut tree, ComponentKind::Point, Some(root));
        assert_eq!(tree.children(root), vec![a, b]);
        assert_eq!(tree.subtree(root), vec![root, a, b]);
    }

    #[test]
    fn remove_unlinks_from_parent() {
        let mut tree = ComponentTree::new();
        let root = component(&mut tree, ComponentKind::Document, None);
        let a = component(&mut tree, ComponentKind::Point, Some(root));
        tree.remove(a);
        assert!(tree.children(root).is_empty());
        assert!(!tree.contains(a));
    }

    #[test]
    fn ids_are_not_reused() {
        let mut tree = ComponentTree::new();
        let a = component(&mut tree, ComponentKind::Point, None);
        tree.remove(a);
        let b = component(&mut tree, ComponentKind::Point, None);
        assert_ne!(a, b);
    }

    #[test]
    fn shadows_have_no_spec() {
        let mut tree = ComponentTree::new();
        let a = component(&mut tree, ComponentKind::Point, None);
        let b = component(&mut tree, ComponentKind::Point, None);
        if let Some(c) = tree.get_mut(b) {
            c.shadow = Some(Shadow {
                source: a,
                vars: BTreeSet::from(["coords"]),
            });
        }
        assert!(tree.to_spec(a).is_some());
        assert!(tree.to_spec(b).is_none());
        assert_eq!(tree.get(b).and_then(|c| c.shadows("coords")), Some(a));
        assert_eq!(tree.get(b).and_then(|c| c.shadows("fixed")), None);
    }
}
