use thiserror::Error;

use crate::{
    capability::KeysetOperation,
    models::{KeysetId, KeysetState},
};

pub type KeysetResult<T> = Result<T, KeysetError>;

#[derive(Debug, Error)]
pub enum KeysetError {
    #[error("keyset not found: {0}")]
    NotFound(String),
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    #[error("keyset '{name}' already exists in namespace '{namespace}'")]
    AlreadyExists { namespace: String, name: String },
    #[error("keyset {id} is inactive (state {state})")]
    KeysetInactive { id: KeysetId, state: KeysetState },
    #[error("keyset {id} cannot transition from {from} to {to}")]
    BlockedTransition {
        id: KeysetId,
        from: KeysetState,
        to: KeysetState,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid keyset usage: {operation} is not one of {}", format_operations(.supported))]
    InvalidUsage {
        operation: KeysetOperation,
        supported: Vec<KeysetOperation>,
    },
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error(
        "key material for '{name}' in namespace '{namespace}' was created but its metadata was not persisted: {reason}"
    )]
    OrphanedMaterial {
        namespace: String,
        name: String,
        reason: String,
    },
    #[error("tamper detected for key material {0}")]
    TamperDetected(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("event sink failure: {0}")]
    Event(String),
}

impl KeysetError {
    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        Self::Storage(err.to_string())
    }
    pub fn crypto<E: std::fmt::Display>(err: E) -> Self {
        Self::Crypto(err.to_string())
    }
    pub fn event<E: std::fmt::Display>(err: E) -> Self {
        Self::Event(err.to_string())
    }
    pub fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidRequest(err.to_string())
    }
    pub fn not_found(id: &KeysetId) -> Self {
        Self::NotFound(id.to_string())
    }

    /// Collapse the variant into the caller-facing failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::NamespaceNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::KeysetInactive { .. } | Self::BlockedTransition { .. } => ErrorKind::Conflict,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::InvalidUsage { .. } => ErrorKind::InvalidUsage,
            Self::OperationFailed(_) => ErrorKind::OperationFailed,
            Self::OrphanedMaterial { .. }
            | Self::TamperDetected(_)
            | Self::Storage(_)
            | Self::Crypto(_)
            | Self::Event(_) => ErrorKind::Internal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    InvalidRequest,
    InvalidUsage,
    OperationFailed,
    Internal,
}

impl ErrorKind {
    /// Status code a transport binding should answer with.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists | ErrorKind::InvalidRequest | ErrorKind::InvalidUsage => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::OperationFailed => 422,
            ErrorKind::Internal => 500,
        }
    }
}

fn format_operations(ops: &[KeysetOperation]) -> String {
    let labels: Vec<&str> = ops.iter().map(|op| op.as_str()).collect();
    format!("[{}]", labels.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn conflict_variants_share_a_kind() {
        let id = Uuid::new_v4();
        let inactive = KeysetError::KeysetInactive {
            id,
            state: KeysetState::Inactive,
        };
        let blocked = KeysetError::BlockedTransition {
            id,
            from: KeysetState::PendingDestruction,
            to: KeysetState::Inactive,
        };
        assert!(inactive.is_conflict());
        assert!(blocked.is_conflict());
        assert_eq!(blocked.kind().status_code(), 409);
    }

    #[test]
    fn usage_error_lists_supported_operations() {
        let err = KeysetError::InvalidUsage {
            operation: KeysetOperation::Sign,
            supported: vec![KeysetOperation::Encrypt, KeysetOperation::Decrypt],
        };
        assert_eq!(
            err.to_string(),
            "invalid keyset usage: SIGN is not one of [ENCRYPT, DECRYPT]"
        );
        assert_eq!(err.kind().status_code(), 400);
    }

    #[test]
    fn operation_failure_is_distinct_from_usage() {
        let err = KeysetError::OperationFailed("tag mismatch".into());
        assert_eq!(err.kind(), ErrorKind::OperationFailed);
        assert_eq!(err.kind().status_code(), 422);
    }
}
