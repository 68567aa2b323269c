//! DAG validation report.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// A structural problem that prevents a step list from running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("duplicate step id '{step_id}'")]
    DuplicateStepId { step_id: String },

    #[error("step id '{step_id}' is reserved for a built-in binding")]
    ReservedStepId { step_id: String },

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    MissingDependency { step_id: String, dependency: String },

    #[error("step '{step_id}' references step '{reference}' which is declared after it")]
    ForwardReference { step_id: String, reference: String },

    #[error("cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

impl ValidationIssue {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateStepId { .. } | Self::ReservedStepId { .. } => ErrorKind::DuplicateStepId,
            Self::MissingDependency { .. } => ErrorKind::MissingDependency,
            Self::ForwardReference { .. } => ErrorKind::ForwardReference,
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
        }
    }
}

/// Steps that can run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelBatch {
    /// Zero-based depth of the batch.
    pub batch_number: usize,
    pub steps: Vec<String>,
}

/// Result of validating a step list.
///
/// The optional fields are `None` when analysis could not get that far
/// (duplicate ids abort before any graph is built; cycles leave the
/// ordering fields empty).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
    pub has_cycles: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_points: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_order: Option<Vec<String>>,
    /// Number of levels in the graph (length of the longest chain).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelization_opportunities: Option<Vec<ParallelBatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_path: Option<Vec<String>>,
}

impl DagValidationResult {
    /// One-line summary of every error.
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            return "workflow is valid".to_string();
        }
        let joined: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        format!("workflow validation failed: {}", joined.join("; "))
    }

    /// Batches as step id lists, empty when validation failed.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.parallelization_opportunities
            .as_ref()
            .map(|batches| batches.iter().map(|b| b.steps.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_issue_display_joins_path() {
        let issue = ValidationIssue::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(issue.to_string(), "cycle detected: a -> b -> a");
        assert_eq!(issue.kind(), ErrorKind::CycleDetected);
    }

    #[test]
    fn summary_lists_all_errors() {
        let report = DagValidationResult {
            is_valid: false,
            errors: vec![
                ValidationIssue::DuplicateStepId { step_id: "a".into() },
                ValidationIssue::MissingDependency {
                    step_id: "b".into(),
                    dependency: "zz".into(),
                },
            ],
            ..Default::default()
        };
        let summary = report.summary();
        assert!(summary.contains("duplicate step id 'a'"));
        assert!(summary.contains("unknown step 'zz'"));
        assert!(report.batches().is_empty());
    }

    #[test]
    fn issue_serializes_with_kind_tag() {
        let issue = ValidationIssue::ForwardReference {
            step_id: "a".into(),
            reference: "b".into(),
        };
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["kind"], "forward_reference");
    }
}
