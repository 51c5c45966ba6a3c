//! Error taxonomy shared by the resolver, the IP lookup and the search engine.

use crate::gcp::http::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Every tier or scan was exhausted without a match
    #[error("{kind} '{name}' not found in project {project}")]
    NotFound {
        kind: &'static str,
        name: String,
        project: String,
    },

    /// Rejected before any network call
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A directory API call failed
    #[error("{op} failed in {scope}")]
    Upstream {
        op: &'static str,
        scope: String,
        #[source]
        source: ApiError,
    },

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn upstream(op: &'static str, scope: impl Into<String>, source: ApiError) -> Self {
        Self::Upstream {
            op,
            scope: scope.into(),
            source,
        }
    }

    pub fn not_found(kind: &'static str, name: &str, project: &str) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
            project: project.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a caller may reasonably retry the same call
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
