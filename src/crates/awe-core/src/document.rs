//! Workflow document loading
//!
//! Workflow documents arrive as JSON or YAML trees with snake_case keys
//! and 8-4-4-4-12 identifiers. Parsing is strict: unknown fields are
//! rejected at this boundary, and reference checks run before a
//! [`Workflow`] is handed to the engine. Loading a document, serializing
//! it back and reloading yields structurally identical data.

use std::path::Path;

use crate::error::{Result, WorkflowError};
use crate::graph::{Workflow, WorkflowDocument};

/// Parse a JSON document string into a validated workflow.
pub fn from_json(input: &str) -> Result<Workflow> {
    let doc: WorkflowDocument =
        serde_json::from_str(input).map_err(|e| WorkflowError::Validation(e.to_string()))?;
    Workflow::from_document(doc)
}

/// Parse a YAML document string into a validated workflow.
pub fn from_yaml(input: &str) -> Result<Workflow> {
    let doc: WorkflowDocument =
        serde_yaml::from_str(input).map_err(|e| WorkflowError::Validation(e.to_string()))?;
    Workflow::from_document(doc)
}

/// Load a workflow from a file, choosing the parser by extension
/// (`.yaml`/`.yml` for YAML, anything else JSON).
pub fn load_path(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => from_yaml(&raw),
        _ => from_json(&raw),
    }
}

/// Serialize a workflow back to pretty JSON.
pub fn to_json(workflow: &Workflow) -> Result<String> {
    Ok(serde_json::to_string_pretty(workflow.document())?)
}
