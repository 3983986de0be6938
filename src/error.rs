//! Error types for the template store and transformer

use thiserror::Error;

use crate::store::StoreError;

/// Result type for template operations
pub type Result<T> = std::result::Result<T, TemplateError>;

/// Template store and transformer errors
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Template version already exists: {template_id} version {version}")]
    AlreadyExists { template_id: String, version: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Malformed template: {0}")]
    Structural(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl TemplateError {
    pub(crate) fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Whether the failure came from an unreachable or slow collaborator.
    ///
    /// Only these take the degraded transform path; everything else is an
    /// authoring or integration mistake and surfaces to the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Io(_) => true,
            Self::Store(e) => !matches!(e, StoreError::DuplicateKey { .. }),
            _ => false,
        }
    }
}
