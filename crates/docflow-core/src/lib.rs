//! # docflow-core
//!
//! The state engine behind interactive documents.
//!
//! A document is a tree of components. Every component owns a table of
//! state variables; essential variables hold values set directly, all
//! others are derived on demand from their dependencies. The engine:
//! - resolves variables lazily and caches them until a dependency changes
//! - carries external actions down to essential variables through inverse
//!   definitions, vetoing the whole action when any hop is not allowed
//! - expands composite components (`sequence`, `map`, `collect`, `copy`,
//!   `conditionalContent`) into replacement subtrees and keeps them
//!   reconciled as their governing values change
//! - resolves name references (`$P`, `$m[2]/Q.x`) against nested scopes
//!
//! ## Architectural Constraints
//!
//! - Single-threaded and synchronous: one [`Document`] is one session
//! - Deterministic: ordered maps everywhere, ids are never reused
//! - Failures stay local: a cycle or a bad reference fails only the
//!   variables that depend on it, never the whole document

// =============================================================================
// MODULES
// =============================================================================

pub mod action;
pub mod cas;
pub mod config;
pub mod diagnostics;
pub mod formats;
pub mod kinds;
pub mod namespace;
pub mod primitives;
pub mod propagator;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod spec;
pub mod tree;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    ActionError, CasError, ComponentId, DocError, Resolution, ResolveError, ScopeId, Value, VarRef,
};

// =============================================================================
// RE-EXPORTS: Document Engine
// =============================================================================

pub use action::{Action, ActionOutcome};
pub use cas::{ArithmeticCas, Cas, ComparisonMode};
pub use config::EngineConfig;
pub use diagnostics::{Diagnostic, Severity};
pub use kinds::ComponentKind;
pub use reconciler::{ExpansionStatus, ReplacementKey};
pub use session::{Document, RenderedComponent};
pub use spec::{AttributeValue, ComponentSpec, SourceSpan};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{
    EssentialSnapshot, RestoreReport, SnapshotEntry, SnapshotHeader, load_snapshot,
    save_snapshot, snapshot_from_bytes, snapshot_to_bytes,
};
