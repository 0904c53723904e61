//! # Engine Primitives
//!
//! Hardcoded constants of the docflow engine.
//!
//! These are the defaults behind [`crate::EngineConfig`]; the bounds keep every
//! resolution and expansion computationally finite even for hostile documents.

/// Maximum nesting of recursive state-variable resolution.
///
/// Resolution recurses once per dependency hop. A chain deeper than this is
/// reported as a definition failure on the variable at the bound instead of
/// exhausting the native stack.
pub const MAX_RESOLUTION_DEPTH: usize = 256;

/// Maximum number of replacement keys a single composite may expand to.
pub const MAX_REPLACEMENTS: usize = 10_000;

/// Relative tolerance used when comparing numbers for equality.
pub const NUMERIC_TOLERANCE: f64 = 1e-12;

/// Maximum number of inverse-definition hops followed by one action.
pub const MAX_INVERSE_HOPS: usize = 64;

/// Maximum number of top-level expansion passes before a document is
/// considered settled.
///
/// Each pass expands every stale composite once; nested composites created
/// by one pass are expanded by the next.
pub const MAX_SETTLE_PASSES: usize = 64;

/// Magic bytes for the essential-state snapshot header.
///
/// - File Header = Magic Bytes ("DFLW") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"DFLW";

/// Current snapshot format version.
///
/// Increment this when making breaking changes to the snapshot format.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum payload size accepted when decoding a snapshot (64 MB).
pub const MAX_SNAPSHOT_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Prefix marking automatically generated component names.
pub const AUTO_NAME_PREFIX: char = '_';
