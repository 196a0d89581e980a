//! Error taxonomy surfaced by the retrieval engine.

use std::fmt;

use thiserror::Error;

/// External collaborator that can fail or time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    Embedding,
    VectorSearch,
    Reranker,
    QueryExpansion,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Collaborator::Embedding => "embedding provider",
            Collaborator::VectorSearch => "vector search",
            Collaborator::Reranker => "reranker",
            Collaborator::QueryExpansion => "query expansion",
        })
    }
}

/// Errors returned by [`HybridRetriever`](crate::HybridRetriever).
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Bad input from the caller. Never retried.
    #[error("validation error: {0}")]
    Validation(String),
    /// A collaborator call failed or timed out.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: Collaborator,
        message: String,
    },
    /// The lexical index could not be read or swapped.
    #[error("lexical index unavailable: {0}")]
    Index(String),
}

impl RetrievalError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn collaborator(collaborator: Collaborator, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
