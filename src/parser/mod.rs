pub mod types;
pub mod yaml;

pub use types::*;
pub use yaml::{parse_duration_str, parse_test_file, parse_yaml_content};

use crate::runner::state::ErrorKind;
use thiserror::Error;

/// Errors raised while turning a script into a step tree
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("missing required field '{field}' for {action}")]
    MissingRequiredField { action: String, field: String },

    #[error("invalid step: {0}")]
    Invalid(String),
}

impl ParseError {
    /// Engine error class for parse failures that have one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ParseError::UnknownAction(_) => Some(ErrorKind::UnknownAction),
            ParseError::MissingRequiredField { .. } => Some(ErrorKind::MissingRequiredField),
            _ => None,
        }
    }

    pub(crate) fn missing(action: &str, field: &str) -> Self {
        ParseError::MissingRequiredField {
            action: action.to_string(),
            field: field.to_string(),
        }
    }
}
