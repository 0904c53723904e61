//! # State Variable Registry
//!
//! Arena of state variables keyed by `(component, name)`. Each entry carries
//! its freshness, last result, essential slot and the dependency edges
//! recorded at its last resolution. Reverse edges drive invalidation.

use crate::types::{ComponentId, ResolveError, Value, VarRef};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Cache-validity flag of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    /// Currently being resolved; reaching it again means a cycle.
    Resolving,
}

/// One state variable.
#[derive(Debug, Clone)]
pub struct VarState {
    pub freshness: Freshness,
    /// Result of the last resolution (`None` before the first one).
    pub result: Option<Result<Value, ResolveError>>,
    /// Directly settable slot; `Some` only for essential variables.
    pub essential: Option<Value>,
    /// Variables read by the last resolution.
    pub deps: BTreeSet<VarRef>,
}

impl VarState {
    fn new(essential: Option<Value>) -> Self {
        Self {
            freshness: Freshness::Stale,
            result: None,
            essential,
            deps: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_essential(&self) -> bool {
        self.essential.is_some()
    }
}

/// All state variables of a session, with forward and reverse edges.
#[derive(Debug, Default)]
pub struct Registry {
    vars: BTreeMap<VarRef, VarState>,
    dependents: BTreeMap<VarRef, BTreeSet<VarRef>>,
    /// Variables whose last failure may be cured by a structural change.
    awaiting: BTreeSet<VarRef>,
    /// Every variable staled since the log was last drained.
    invalidated: BTreeSet<VarRef>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a variable in the `Stale` state.
    pub fn insert(&mut self, var: VarRef, essential: Option<Value>) {
        self.vars.insert(var, VarState::new(essential));
    }

    #[must_use]
    pub fn get(&self, var: &VarRef) -> Option<&VarState> {
        self.vars.get(var)
    }

    #[must_use]
    pub fn contains(&self, var: &VarRef) -> bool {
        self.vars.contains_key(var)
    }

    #[must_use]
    pub fn freshness(&self, var: &VarRef) -> Option<Freshness> {
        self.vars.get(var).map(|s| s.freshness)
    }

    pub fn mark_resolving(&mut self, var: &VarRef) {
        if let Some(state) = self.vars.get_mut(var) {
            state.freshness = Freshness::Resolving;
        }
    }

    /// Store a resolution result and replace the variable's edges.
    ///
    /// Does nothing if the variable was torn down during its own resolution.
    pub fn store(
        &mut self,
        var: &VarRef,
        result: Result<Value, ResolveError>,
        deps: BTreeSet<VarRef>,
        awaiting: bool,
    ) {
        let Some(state) = self.vars.get_mut(var) else {
            return;
        };
        let old = std::mem::take(&mut state.deps);
        state.freshness = Freshness::Fresh;
        state.result = Some(result);
        state.deps = deps.clone();
        for dep in old.difference(&deps) {
            if let Some(set) = self.dependents.get_mut(dep) {
                set.remove(var);
                if set.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
        for dep in deps {
            self.dependents.entry(dep).or_default().insert(var.clone());
        }
        if awaiting {
            self.awaiting.insert(var.clone());
        } else {
            self.awaiting.remove(var);
        }
    }

    #[must_use]
    pub fn essential(&self, var: &VarRef) -> Option<&Value> {
        self.vars.get(var).and_then(|s| s.essential.as_ref())
    }

    /// Overwrite an essential slot. Returns `false` if the variable has none.
    pub fn set_essential(&mut self, var: &VarRef, value: Value) -> bool {
        match self.vars.get_mut(var) {
            Some(state) if state.essential.is_some() => {
                state.essential = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Mark the seeds and every transitive dependent `Stale`.
    ///
    /// Variables currently `Resolving` are skipped: they are recomputing
    /// against the new state already. Returns every variable visited.
    pub fn invalidate<'a>(&mut self, seeds: impl IntoIterator<Item = &'a VarRef>) -> BTreeSet<VarRef> {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<VarRef> = seeds.into_iter().cloned().collect();
        while let Some(var) = queue.pop_front() {
            if !visited.insert(var.clone()) {
                continue;
            }
            self.invalidated.insert(var.clone());
            if let Some(state) = self.vars.get_mut(&var) {
                if state.freshness == Freshness::Fresh {
                    state.freshness = Freshness::Stale;
                }
            }
            if let Some(dependents) = self.dependents.get(&var) {
                queue.extend(dependents.iter().cloned());
            }
        }
        visited
    }

    /// Drain the log of variables staled since the last call.
    pub fn take_invalidated(&mut self) -> BTreeSet<VarRef> {
        std::mem::take(&mut self.invalidated)
    }

    /// Re-stale every variable waiting for a structural change.
    pub fn wake_awaiting(&mut self) -> BTreeSet<VarRef> {
        let waiting: Vec<VarRef> = self.awaiting.iter().cloned().collect();
        self.invalidate(waiting.iter())
    }

    /// Remove every variable of a component. Returns the removed keys.
    ///
    /// Reverse edges pointing at removed variables are kept so that the
    /// caller can invalidate their former dependents.
    pub fn remove_component(&mut self, component: ComponentId) -> Vec<VarRef> {
        let keys: Vec<VarRef> = self
            .vars
            .range(VarRef::new(component, "")..)
            .take_while(|(k, _)| k.component == component)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            if let Some(state) = self.vars.remove(key) {
                for dep in &state.deps {
                    if let Some(set) = self.dependents.get_mut(dep) {
                        set.remove(key);
                        if set.is_empty() {
                            self.dependents.remove(dep);
                        }
                    }
                }
            }
            self.awaiting.remove(key);
        }
        keys
    }

    /// Drop reverse edges of variables that no longer exist.
    pub fn forget(&mut self, removed: &[VarRef]) {
        for var in removed {
            self.dependents.remove(var);
        }
    }

    /// Essential variables, in key order.
    pub fn essentials(&self) -> impl Iterator<Item = (&VarRef, &Value)> {
        self.vars
            .iter()
            .filter_map(|(k, s)| s.essential.as_ref().map(|v| (k, v)))
    }

    #[must_use]
    pub fn dependents_of(&self, var: &VarRef) -> Vec<VarRef> {
        self.dependents
            .get(var)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn clear(&mut self) {
        self.vars.clear();
        self.dependents.clear();
        self.awaiting.clear();
        self.invalidated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(c: u64, n: &str) -> VarRef {
        VarRef::new(ComponentId(c), n)
    }

    fn fresh(registry: &mut Registry, v: &VarRef, deps: &[VarRef]) {
        registry.store(
            v,
            Ok(Value::Null),
            deps.iter().cloned().collect(),
            false,
        );
    }

    #[test]
    fn new_vars_are_stale() {
        let mut registry = Registry::new();
        registry.insert(var(1, "x"), None);
        assert_eq!(registry.freshness(&var(1, "x")), Some(Freshness::Stale));
    }

    #[test]
    fn invalidation_reaches_transitive_dependents() {
        let mut registry = Registry::new();
        for v in [var(1, "a"), var(1, "b"), var(2, "c"), var(3, "d")] {
            registry.insert(v, None);
        }
        fresh(&mut registry, &var(1, "a"), &[]);
        fresh(&mut registry, &var(1, "b"), &[var(1, "a")]);
        fresh(&mut registry, &var(2, "c"), &[var(1, "b")]);
        fresh(&mut registry, &var(3, "d"), &[]);

        let stale = registry.invalidate([var(1, "a")].iter());
        assert!(stale.contains(&var(2, "c")));
        assert_eq!(registry.freshness(&var(2, "c")), Some(Freshness::Stale));
        assert_eq!(registry.freshness(&var(3, "d")), Some(Freshness::Fresh));
    }

    #[test]
    fn invalidation_log_accumulates_until_drained() {
        let mut registry = Registry::new();
        registry.insert(var(1, "a"), None);
        registry.insert(var(2, "b"), None);
        fresh(&mut registry, &var(2, "b"), &[var(1, "a")]);

        registry.invalidate([var(1, "a")].iter());
        registry.invalidate([var(2, "b")].iter());
        let log = registry.take_invalidated();
        assert!(log.contains(&var(1, "a")));
        assert!(log.contains(&var(2, "b")));
        assert!(registry.take_invalidated().is_empty());
    }

    #[test]
    fn invalidation_skips_resolving() {
        let mut registry = Registry::new();
        registry.insert(var(1, "a"), None);
        registry.insert(var(1, "b"), None);
        fresh(&mut registry, &var(1, "b"), &[var(1, "a")]);
        registry.mark_resolving(&var(1, "b"));
        registry.invalidate([var(1, "a")].iter());
        assert_eq!(registry.freshness(&var(1, "b")), Some(Freshness::Resolving));
    }

    #[test]
    fn store_replaces_edges() {
        let mut registry = Registry::new();
        for v in [var(1, "a"), var(1, "b"), var(1, "c")] {
            registry.insert(v, None);
        }
        fresh(&mut registry, &var(1, "c"), &[var(1, "a")]);
        fresh(&mut registry, &var(1, "c"), &[var(1, "b")]);
        assert!(registry.dependents_of(&var(1, "a")).is_empty());
        assert_eq!(registry.dependents_of(&var(1, "b")), vec![var(1, "c")]);
    }

    #[test]
    fn remove_component_keeps_reverse_edges_for_caller() {
        let mut registry = Registry::new();
        registry.insert(var(1, "a"), Some(Value::Number(1.0)));
        registry.insert(var(1, "b"), None);
        registry.insert(var(2, "c"), None);
        fresh(&mut registry, &var(2, "c"), &[var(1, "a")]);

        let removed = registry.remove_component(ComponentId(1));
        assert_eq!(removed, vec![var(1, "a"), var(1, "b")]);
        assert!(!registry.contains(&var(1, "a")));
        assert_eq!(registry.dependents_of(&var(1, "a")), vec![var(2, "c")]);
        registry.invalidate(removed.iter());
        registry.forget(&removed);
        assert_eq!(registry.freshness(&var(2, "c")), Some(Freshness::Stale));
        assert!(registry.dependents_of(&var(1, "a")).is_empty());
    }

    #[test]
    fn essential_slots() {
        let mut registry = Registry::new();
        registry.insert(var(1, "a"), Some(Value::Number(1.0)));
        registry.insert(var(1, "b"), None);
        assert!(registry.set_essential(&var(1, "a"), Value::Number(2.0)));
        assert!(!registry.set_essential(&var(1, "b"), Value::Number(2.0)));
        assert_eq!(registry.essential(&var(1, "a")), Some(&Value::Number(2.0)));
        assert_eq!(registry.essentials().count(), 1);
    }

    #[test]
    fn awaiting_vars_wake_up() {
        let mut registry = Registry::new();
        registry.insert(var(1, "a"), None);
        registry.store(&var(1, "a"), Ok(Value::Null), BTreeSet::new(), true);
        let woken = registry.wake_awaiting();
        assert!(woken.contains(&var(1, "a")));
        assert_eq!(registry.freshness(&var(1, "a")), Some(Freshness::Stale));
    }
}
