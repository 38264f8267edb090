use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the rewards core.
pub type RewardsResult<T> = Result<T, RewardsError>;

/// Failure taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    PermissionDenied,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    AlreadyExists,
    ResourceExhausted,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::FailedPrecondition => "failed_precondition",
            Self::AlreadyExists => "already_exists",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}

/// Rewards core errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RewardsError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Insufficient points: required {required}, available {available}")]
    InsufficientPoints { required: u64, available: u64 },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Unique index '{index}' already holds '{value}'")]
    UniqueViolation { index: String, value: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RewardsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::FailedPrecondition(_) | Self::InsufficientPoints { .. } => {
                ErrorKind::FailedPrecondition
            }
            Self::AlreadyExists(_) | Self::UniqueViolation { .. } => ErrorKind::AlreadyExists,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{entity} '{id}' not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_variants_report_their_taxonomy_kind() {
        let err = RewardsError::InsufficientPoints {
            required: 300,
            available: 120,
        };
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert!(err.to_string().contains("required 300"));
        assert!(err.to_string().contains("available 120"));

        let dup = RewardsError::UniqueViolation {
            index: "redemption_code".to_string(),
            value: "AAAA-BBBB-CCCC".to_string(),
        };
        assert_eq!(dup.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let value = serde_json::to_value(ErrorKind::ResourceExhausted).unwrap();
        assert_eq!(value, serde_json::json!("resource_exhausted"));
        assert_eq!(ErrorKind::FailedPrecondition.as_str(), "failed_precondition");
    }
}
