//! Error types shared by every stage of the compiler pipeline.
//!
//! Configuration problems are collected into a [`ValidationReport`] instead of failing on the
//! first problem, so that a caller can report every issue in one pass. Everything else is a
//! single [`CompilerError`] variant.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generator::GeneratorError;

/// Category of a single validation issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Missing,
    InvalidValue,
    InvalidProbabilities,
    UnknownReference,
    Unsupported,
    Parse,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                IssueKind::Missing => "missing",
                IssueKind::InvalidValue => "invalid_value",
                IssueKind::InvalidProbabilities => "invalid_probabilities",
                IssueKind::UnknownReference => "unknown_reference",
                IssueKind::Unsupported => "unsupported",
                IssueKind::Parse => "parse",
            }
        )
    }
}

/// One problem found while validating a configuration, addressed by its field path
/// (e.g. `tokens[1].probability`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field_path: String,
    pub error_type: IssueKind,
    pub message: String,
    pub value: Option<String>,
    pub expected: Option<String>,
}

impl ValidationIssue {
    pub fn new(field_path: impl Into<String>, error_type: IssueKind, message: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            error_type,
            message: message.into(),
            value: None,
            expected: None,
        }
    }

    pub fn with_value(mut self, value: impl fmt::Display) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.field_path, self.error_type, self.message)?;
        if let Some(value) = &self.value {
            write!(f, " (got {value}")?;
            if let Some(expected) = &self.expected {
                write!(f, ", expected {expected}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Ordered collection of [`ValidationIssue`]s.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// Converts the collected issues into a result.
    ///
    /// A report made only of probability issues becomes [`CompilerError::InvalidProbabilities`],
    /// anything else [`CompilerError::InvalidConfig`].
    pub fn into_result(self) -> Result<()> {
        if self.issues.is_empty() {
            Ok(())
        } else if self
            .issues
            .iter()
            .all(|issue| issue.error_type == IssueKind::InvalidProbabilities)
        {
            Err(CompilerError::InvalidProbabilities(self))
        } else {
            Err(CompilerError::InvalidConfig(self))
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let lines = self
            .issues
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<String>>()
            .join("; ");
        write!(f, "{} issue(s): {}", self.issues.len(), lines)
    }
}

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(ValidationReport),
    #[error("invalid probabilities: {0}")]
    InvalidProbabilities(ValidationReport),
    #[error("element {trial_index}/{element_index} references unknown stimulus '{stimulus_ref}'")]
    UnknownStimulus {
        stimulus_ref: String,
        trial_index: usize,
        element_index: usize,
    },
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error("artifact i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact container: {0}")]
    Container(#[from] bincode::Error),
    #[error("not a sequence artifact container (bad magic bytes)")]
    BadMagic,
    #[error("audio hash mismatch: manifest says {expected}, buffer hashes to {found}")]
    HashMismatch { expected: String, found: String },
}

impl CompilerError {
    /// Wraps a parse failure as a single-issue configuration error.
    pub fn parse(field_path: &str, err: impl fmt::Display) -> Self {
        let mut report = ValidationReport::new();
        report.push(ValidationIssue::new(field_path, IssueKind::Parse, err.to_string()));
        CompilerError::InvalidConfig(report)
    }

    /// Issues carried by a validation error, empty for every other kind.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            CompilerError::InvalidConfig(report) | CompilerError::InvalidProbabilities(report) => {
                &report.issues
            }
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;
