//! # Essential-State Snapshots
//!
//! Binary encoding of a document's essential values, keyed by
//! component name path and variable name so they survive a rebuild.
//!
//! Format: Header (5 bytes) + postcard-serialized entries.
//! - 4 bytes: Magic ("DFLW")
//! - 1 byte: Version
//!
//! The payload size is checked before anything is decoded. The types are
//! plain serde structs, so callers can also write them as JSON.

use crate::primitives::{FORMAT_VERSION, MAGIC_BYTES, MAX_SNAPSHOT_PAYLOAD_SIZE};
use crate::types::{DocError, Value};
use serde::{Deserialize, Serialize};
use std::path::Path;

const HEADER_SIZE: usize = 5;

// =============================================================================
// SNAPSHOT
// =============================================================================

/// One essential value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Name path of the owning component (e.g. `/_m_3/P`).
    pub component: String,
    pub variable: String,
    pub value: Value,
}

/// Essential values of a document, in registry order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EssentialSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl EssentialSnapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look an entry up by component path and variable name.
    #[must_use]
    pub fn get(&self, component: &str, variable: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.component == component && e.variable == variable)
            .map(|e| &e.value)
    }
}

/// Outcome of restoring a snapshot onto a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub applied: usize,
    /// `path.variable` of entries whose target no longer exists.
    pub skipped: Vec<String>,
}

// =============================================================================
// HEADER
// =============================================================================

/// Header preceding the snapshot payload.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl SnapshotHeader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *MAGIC_BYTES,
            version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), DocError> {
        if &self.magic != MAGIC_BYTES {
            return Err(DocError::DeserializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(DocError::DeserializationError(format!(
                "Unsupported version: {} (expected {FORMAT_VERSION})",
                self.version
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocError> {
        let Some(header) = bytes.get(..HEADER_SIZE) else {
            return Err(DocError::DeserializationError(
                "Header too short".to_string(),
            ));
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        Ok(Self {
            magic,
            version: header[4],
        })
    }
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Encode a snapshot (header + postcard payload).
pub fn snapshot_to_bytes(snapshot: &EssentialSnapshot) -> Result<Vec<u8>, DocError> {
    let payload =
        postcard::to_stdvec(snapshot).map_err(|e| DocError::SerializationError(e.to_string()))?;
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&SnapshotHeader::new().to_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a snapshot, validating size and header before the payload.
pub fn snapshot_from_bytes(bytes: &[u8]) -> Result<EssentialSnapshot, DocError> {
    if bytes.len() > HEADER_SIZE + MAX_SNAPSHOT_PAYLOAD_SIZE {
        return Err(DocError::DeserializationError(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            HEADER_SIZE + MAX_SNAPSHOT_PAYLOAD_SIZE
        )));
    }
    let header = SnapshotHeader::from_bytes(bytes)?;
    header.validate()?;
    postcard::from_bytes(&bytes[HEADER_SIZE..]).map_err(|e| {
        DocError::DeserializationError(format!("Failed to deserialize snapshot: {e}"))
    })
}

/// Write a snapshot file.
pub fn save_snapshot(path: &Path, snapshot: &EssentialSnapshot) -> Result<(), DocError> {
    let bytes = snapshot_to_bytes(snapshot)?;
    std::fs::write(path, bytes).map_err(|e| DocError::IoError(e.to_string()))
}

/// Read a snapshot file.
pub fn load_snapshot(path: &Path) -> Result<EssentialSnapshot, DocError> {
    let bytes = std::fs::read(path).map_err(|e| DocError::IoError(e.to_string()))?;
    snapshot_from_bytes(&bytes)
}

// =============================================================================
// TESTS
// =============================================================================
