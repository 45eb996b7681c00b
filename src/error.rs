use std::{fmt, io};

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The store call an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    CreateBucket,
    InitiateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    PutObject,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOperation::CreateBucket => write!(f, "CreateBucket"),
            StoreOperation::InitiateMultipartUpload => write!(f, "CreateMultipartUpload"),
            StoreOperation::UploadPart => write!(f, "UploadPart"),
            StoreOperation::CompleteMultipartUpload => write!(f, "CompleteMultipartUpload"),
            StoreOperation::AbortMultipartUpload => write!(f, "AbortMultipartUpload"),
            StoreOperation::PutObject => write!(f, "PutObject"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store answered and refused the request.
    #[error("{operation} rejected by store: {message}")]
    Rejected {
        operation: StoreOperation,
        message: String,
    },

    /// The request never produced a usable answer (connection, timeout, dispatch).
    #[error("{operation} request failed")]
    Transport {
        operation: StoreOperation,
        #[source]
        source: BoxError,
    },

    #[error("{operation} response is missing {field}")]
    MalformedResponse {
        operation: StoreOperation,
        field: &'static str,
    },
}

impl StoreError {
    pub fn operation(&self) -> StoreOperation {
        match self {
            StoreError::Rejected { operation, .. }
            | StoreError::Transport { operation, .. }
            | StoreError::MalformedResponse { operation, .. } => *operation,
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload target: {0}")]
    InvalidTarget(String),

    #[error("failed to read the next chunk from the source")]
    SourceRead(#[source] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("source needs more than {limit} parts; raise the chunk size")]
    TooManyParts { limit: u32 },

    #[error("upload cancelled")]
    Cancelled,

    /// The upload failed and the cleanup abort failed too. `cause` is the
    /// failure that triggered the abort; `abort` is what the abort returned.
    #[error("{cause}; aborting upload {upload_id} also failed: {abort}")]
    AbortFailed {
        upload_id: String,
        #[source]
        cause: Box<UploadError>,
        abort: StoreError,
    },
}

impl UploadError {
    /// The failure that ended the upload, looking through a failed abort.
    pub fn root_cause(&self) -> &UploadError {
        match self {
            UploadError::AbortFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// The abort failure, when cleanup itself went wrong.
    pub fn abort_error(&self) -> Option<&StoreError> {
        match self {
            UploadError::AbortFailed { abort, .. } => Some(abort),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("failed to launch `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("no host port is mapped to container port {port}: {output:?}")]
    PortNotMapped { port: u16, output: String },

    #[error("environment not ready after {waited:?}")]
    NotReady { waited: std::time::Duration },

    #[error("environment {name} is not running")]
    NotRunning { name: String },

    #[error("environment startup cancelled")]
    Cancelled,

    #[error("invalid endpoint {endpoint}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_looks_through_abort_failure() {
        let error = UploadError::AbortFailed {
            upload_id: "u-1".to_string(),
            cause: Box::new(UploadError::Cancelled),
            abort: StoreError::Rejected {
                operation: StoreOperation::AbortMultipartUpload,
                message: "NoSuchUpload".to_string(),
            },
        };

        assert!(matches!(error.root_cause(), UploadError::Cancelled));
        assert_eq!(
            error.abort_error().map(StoreError::operation),
            Some(StoreOperation::AbortMultipartUpload)
        );

        let message = error.to_string();
        assert!(message.starts_with("upload cancelled"));
        assert!(message.contains("aborting upload u-1 also failed"));
    }

    #[test]
    fn test_root_cause_of_plain_error_is_itself() {
        let error = UploadError::TooManyParts { limit: 10_000 };
        assert!(matches!(
            error.root_cause(),
            UploadError::TooManyParts { limit: 10_000 }
        ));
        assert!(error.abort_error().is_none());
    }
}
