//! Workflow files: parsing YAML or JSON into a `WorkflowDocument`.
//!
//! Only document-level checks happen here (a name, at least one step).
//! Structural problems such as duplicate ids or cycles are reported by the
//! DAG validator so that `validate` shows all of them at once.

use std::path::Path;

use neuronforge_types::step::WorkflowDocument;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid workflow: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a workflow document. Text starting with `{` is read as JSON,
/// anything else as YAML (a JSON superset, so JSON parse errors are not
/// masked).
pub fn parse_workflow(text: &str) -> Result<WorkflowDocument, DefinitionError> {
    let doc: WorkflowDocument = if text.trim_start().starts_with('{') {
        serde_json::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?
    } else {
        serde_yaml_ng::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?
    };
    check_document(&doc)?;
    Ok(doc)
}

/// Read and parse a workflow file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDocument, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

/// Serialize a document to YAML.
pub fn serialize_workflow_yaml(doc: &WorkflowDocument) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(doc).map_err(|e| DefinitionError::Parse(e.to_string()))
}

fn check_document(doc: &WorkflowDocument) -> Result<(), DefinitionError> {
    if doc.name.trim().is_empty() {
        return Err(DefinitionError::Invalid("workflow name must not be empty".to_string()));
    }
    if doc.steps.is_empty() {
        return Err(DefinitionError::Invalid(format!(
            "workflow '{}' must have at least one step",
            doc.name
        )));
    }
    if let Some(step) = doc.steps.iter().find(|s| s.id.trim().is_empty()) {
        return Err(DefinitionError::Invalid(format!(
            "step '{}' has an empty id",
            step.label()
        )));
    }
    Ok(())
}
