use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::StreamToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentIdError {
    #[error("content id '{raw}' has {found} segments, expected 3")]
    WrongSegmentCount { raw: String, found: usize },
    #[error("content id '{raw}' has non-numeric id segment '{segment}'")]
    InvalidNumericId { raw: String, segment: String },
    #[error("content id segment '{segment}' collides with the '::' delimiter")]
    DelimiterInSegment { segment: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    NoContent,
    PaginationError,
}

/// Infrastructure error surfaced to model observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    /// The continuation that failed, so the caller can retry it.
    pub continuation_token: Option<StreamToken>,
}

impl ModelError {
    pub fn no_content() -> Self {
        Self {
            kind: ModelErrorKind::NoContent,
            continuation_token: None,
        }
    }

    pub fn pagination(token: StreamToken) -> Self {
        Self {
            kind: ModelErrorKind::PaginationError,
            continuation_token: Some(token),
        }
    }
}
