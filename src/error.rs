//! Error taxonomy shared by the reconciliation engine and the runner.
//!
//! Every variant is a structured value (kind + parameters); `Display` is a
//! one-line rendering for logs and the CLI.

use thiserror::Error;

use crate::entity::TcmsClass;

/// Coarse error categories used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Resolution,
    AmbiguousMatch,
    OwnerMismatch,
    Gateway,
    Assistant,
    Attachment,
    Container,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Missing or invalid local paths/settings; raised before any TCMS contact.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Referenced object has no counterpart in the target and may not be created.
    #[error("{class} '{key}' not found in TCMS")]
    Missing { class: TcmsClass, key: String },

    /// Product and Version must pre-exist in the target.
    #[error("{class} '{key}' must exist in TCMS, it cannot be created")]
    MustExist { class: TcmsClass, key: String },

    /// An entity references an object that failed to resolve earlier in the pass.
    #[error("{class} '{key}' references unresolved {ref_class} #{ref_id}")]
    Unresolved {
        class: TcmsClass,
        key: String,
        ref_class: TcmsClass,
        ref_id: i64,
    },

    #[error("User '{username}' not found in TCMS")]
    UserNotFound { username: String },

    #[error("{count} objects of class {class} match '{key}'")]
    AmbiguousMatch {
        class: TcmsClass,
        key: String,
        count: usize,
    },

    #[error("{owner_class} of {class} '{name}' is '{actual}' in TCMS, expected '{expected}'")]
    OwnerMismatch {
        class: TcmsClass,
        name: String,
        owner_class: TcmsClass,
        expected: String,
        actual: String,
    },

    #[error("TCMS gateway error: {0}")]
    Gateway(String),

    #[error("{scope} assistant failed during {action}: {message}")]
    AssistantFailed {
        scope: String,
        action: String,
        message: String,
    },

    #[error("Objects of class {class} cannot hold attachments")]
    AttachmentsNotSupported { class: TcmsClass },

    #[error("Attachment file {path} not found")]
    AttachmentMissing { path: String },

    #[error("Transfer of attachment {file} failed: {message}")]
    AttachmentTransfer { file: String, message: String },

    #[error("Invalid entity container: {0}")]
    Container(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Configuration(_) => ErrorKind::Configuration,
            SyncError::Missing { .. }
            | SyncError::MustExist { .. }
            | SyncError::Unresolved { .. }
            | SyncError::UserNotFound { .. } => ErrorKind::Resolution,
            SyncError::AmbiguousMatch { .. } => ErrorKind::AmbiguousMatch,
            SyncError::OwnerMismatch { .. } => ErrorKind::OwnerMismatch,
            SyncError::Gateway(_) => ErrorKind::Gateway,
            SyncError::AssistantFailed { .. } => ErrorKind::Assistant,
            SyncError::AttachmentsNotSupported { .. }
            | SyncError::AttachmentMissing { .. }
            | SyncError::AttachmentTransfer { .. } => ErrorKind::Attachment,
            SyncError::Container(_) => ErrorKind::Container,
        }
    }
}

impl From<crate::gateway::GatewayError> for SyncError {
    fn from(err: crate::gateway::GatewayError) -> Self {
        SyncError::Gateway(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;

    #[test]
    fn test_kind_groups_resolution_failures() {
        let errors = [
            SyncError::Missing {
                class: TcmsClass::Build,
                key: "b1".to_string(),
            },
            SyncError::MustExist {
                class: TcmsClass::Version,
                key: "1.0".to_string(),
            },
            SyncError::UserNotFound {
                username: "bob".to_string(),
            },
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Resolution);
        }
    }

    #[test]
    fn test_gateway_error_conversion() {
        let err: SyncError = GatewayError::Remote("boom".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Gateway);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_ambiguous_message_carries_count() {
        let err = SyncError::AmbiguousMatch {
            class: TcmsClass::TestPlan,
            key: "Smoke/demo/1.0".to_string(),
            count: 2,
        };
        assert_eq!(err.to_string(), "2 objects of class TestPlan match 'Smoke/demo/1.0'");
    }
}
