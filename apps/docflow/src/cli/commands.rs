//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::api;
use crate::config::ServerSettings;
use docflow_core::{
    Action, ActionError, ArithmeticCas, ComponentSpec, DocError, Document, EngineConfig,
    EssentialSnapshot, RenderedComponent, Severity, load_snapshot, save_snapshot,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a document file (16 MB).
const MAX_DOCUMENT_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Maximum size of an action script (16 MB).
const MAX_ACTIONS_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Maximum number of actions in one script.
const MAX_ACTIONS: usize = 100_000;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), DocError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| DocError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(DocError::IoError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and make sure it is a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, DocError> {
    let canonical = path.canonicalize().map_err(|e| {
        DocError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(DocError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Validate an output path: its parent must be an existing directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, DocError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        DocError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(DocError::IoError(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| DocError::IoError("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

/// Read a validated input file.
fn read_input(path: &Path, max_size: u64) -> Result<Vec<u8>, DocError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, max_size)?;
    std::fs::read(&validated).map_err(|e| DocError::IoError(format!("Read file: {}", e)))
}

// =============================================================================
// LOADING
// =============================================================================

/// Parse a component tree from JSON.
pub fn parse_document(bytes: &[u8]) -> Result<ComponentSpec, DocError> {
    serde_json::from_slice(bytes)
        .map_err(|e| DocError::DeserializationError(format!("document: {}", e)))
}

/// Parse an action script (a JSON array of actions).
pub fn parse_actions(bytes: &[u8]) -> Result<Vec<Action>, DocError> {
    let actions: Vec<Action> = serde_json::from_slice(bytes)
        .map_err(|e| DocError::DeserializationError(format!("actions: {}", e)))?;
    if actions.len() > MAX_ACTIONS {
        return Err(DocError::DeserializationError(format!(
            "Action count {} exceeds maximum allowed {}",
            actions.len(),
            MAX_ACTIONS
        )));
    }
    Ok(actions)
}

/// Build a document from a JSON file.
pub fn load_document(path: &Path, config: EngineConfig) -> Result<Document, DocError> {
    let spec = parse_document(&read_input(path, MAX_DOCUMENT_FILE_SIZE)?)?;
    tracing::info!(path = %path.display(), components = spec.size(), "loading document");
    let tolerance = config.numeric_tolerance;
    Document::with_options(&spec, config, Box::new(ArithmeticCas::with_tolerance(tolerance)))
}

/// Whether a snapshot path uses the JSON form (by extension).
fn is_json_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Read a snapshot in the binary form, or JSON when the file ends in `.json`.
pub fn read_snapshot(path: &Path) -> Result<EssentialSnapshot, DocError> {
    if is_json_path(path) {
        let bytes = read_input(path, MAX_DOCUMENT_FILE_SIZE)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DocError::DeserializationError(format!("snapshot: {}", e)))
    } else {
        load_snapshot(&validate_file_path(path)?)
    }
}

/// Write a snapshot in the binary form, or JSON when the file ends in `.json`.
pub fn write_snapshot(path: &Path, snapshot: &EssentialSnapshot) -> Result<(), DocError> {
    let output = validate_output_path(path)?;
    if is_json_path(&output) {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| DocError::SerializationError(e.to_string()))?;
        std::fs::write(&output, json).map_err(|e| DocError::IoError(e.to_string()))
    } else {
        save_snapshot(&output, snapshot)
    }
}

// =============================================================================
// RUN COMMAND
// =============================================================================

/// Build a document, apply actions in order and print the resolved state.
///
/// A failed action is reported and skipped; later actions still run.
pub fn cmd_run(
    document: &Path,
    config: EngineConfig,
    json_mode: bool,
    actions: Option<&Path>,
    restore_state: Option<&Path>,
    save_state: Option<&Path>,
) -> Result<(), DocError> {
    let mut doc = load_document(document, config)?;

    if let Some(path) = restore_state {
        let snapshot = read_snapshot(path)?;
        let report = doc.restore_essential_state(&snapshot)?;
        for skipped in &report.skipped {
            tracing::warn!(entry = %skipped, "snapshot entry has no target");
        }
    }

    let actions = match actions {
        Some(path) => parse_actions(&read_input(path, MAX_ACTIONS_FILE_SIZE)?)?,
        None => Vec::new(),
    };
    let results = doc.process(&actions);

    if let Some(path) = save_state {
        let snapshot = doc.export_essential_state()?;
        write_snapshot(path, &snapshot)?;
        tracing::info!(path = %path.display(), entries = snapshot.len(), "essential state saved");
    }

    let state = doc.state_values();
    if json_mode {
        let output = serde_json::json!({
            "actions": results.iter().map(action_json).collect::<Vec<_>>(),
            "state": state,
            "diagnostics": doc.diagnostics(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    for (action, result) in actions.iter().zip(&results) {
        match result {
            Ok(outcome) if outcome.is_noop() => {
                println!("{} {}: no change", action.kind_name(), action.target());
            }
            Ok(outcome) => println!(
                "{} {}: changed {}",
                action.kind_name(),
                action.target(),
                outcome.changed.join(", ")
            ),
            Err(e) => println!("{} {}: FAILED {}", action.kind_name(), action.target(), e),
        }
    }
    if !actions.is_empty() {
        println!();
    }
    print_state(&state);
    print_diagnostics(&doc);
    Ok(())
}

fn action_json(result: &Result<docflow_core::ActionOutcome, ActionError>) -> serde_json::Value {
    match result {
        Ok(outcome) => serde_json::json!({ "success": true, "outcome": outcome }),
        Err(e) => serde_json::json!({ "success": false, "error": e.to_string() }),
    }
}

fn print_state(state: &BTreeMap<String, RenderedComponent>) {
    for (path, component) in state {
        println!("{} ({})", path, component.kind);
        for (name, resolution) in &component.state_values {
            let shown = match resolution {
                docflow_core::Resolution::Value(v) => v.to_string(),
                docflow_core::Resolution::Unresolved(reason) => format!("<unresolved: {}>", reason),
                docflow_core::Resolution::Error(e) => format!("<error: {}>", e),
            };
            println!("  {:<16} {}", name, shown);
        }
    }
}

fn print_diagnostics(doc: &Document) {
    if doc.diagnostics().is_empty() {
        return;
    }
    println!();
    println!("Diagnostics:");
    for diagnostic in doc.diagnostics() {
        let place = diagnostic.component.as_deref().unwrap_or("-");
        println!("  [{:?}] {}: {}", diagnostic.severity, place, diagnostic.message);
    }
}

// =============================================================================
// CHECK COMMAND
// =============================================================================

/// Build a document, resolve everything and report diagnostics.
///
/// Fails when any error-level diagnostic was produced.
pub fn cmd_check(document: &Path, config: EngineConfig, json_mode: bool) -> Result<(), DocError> {
    let mut doc = load_document(document, config)?;
    let state = doc.state_values();
    let errors = doc
        .diagnostics()
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();

    if json_mode {
        let output = serde_json::json!({
            "components": state.len(),
            "errors": errors,
            "diagnostics": doc.diagnostics(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
    } else {
        println!("Document:    {}", document.display());
        println!("Components:  {}", state.len());
        println!("Diagnostics: {}", doc.diagnostics().len());
        print_diagnostics(&doc);
    }

    if errors > 0 {
        return Err(DocError::InvalidDocument(format!(
            "{} error diagnostic(s)",
            errors
        )));
    }
    Ok(())
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_server(
    document: &Path,
    config: EngineConfig,
    settings: ServerSettings,
    host: &str,
    port: u16,
) -> Result<(), DocError> {
    let doc = load_document(document, config)?;

    println!("docflow server starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", host);
    println!("  Port:     {}", port);
    println!("  Document: {}", document.display());
    println!("  Actions:  {} per second (0 = unlimited)", settings.actions_per_second);
    println!();
    println!("Endpoints:");
    println!("  GET  /health      - Health check");
    println!("  GET  /state       - Resolved state of every component");
    println!("  POST /value       - Resolve one reference");
    println!("  POST /action      - Apply an action");
    println!("  GET  /diagnostics - Diagnostics so far");
    println!("  GET  /snapshot    - Export essential state");
    println!("  POST /snapshot    - Restore essential state");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", host, port);
    api::run_server(&addr, doc, settings).await
}

// =============================================================================
// TESTS
// =============================================================================
