// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by the HTTP layer to pick a
/// status code without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum ErrorKind {
    Validation,
    UnsupportedMediaType,
    Unauthorized,
    NotFound,
    Conflict,
    Unsupported,
    Internal,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::Conflict | ErrorKind::Unsupported => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::UnsupportedMediaType => 415,
            ErrorKind::Internal => 500,
        }
    }
}

/// Errors surfaced by the key broker. Messages of the non-internal variants
/// are safe to hand back to a caller; the cause of an `Internal` error is
/// only ever logged.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("algorithm not supported: {0}")]
    Unsupported(String),

    #[error("{context}")]
    Internal {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::UnsupportedMediaType(_) => ErrorKind::UnsupportedMediaType,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn internal(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Internal {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Message that may be returned to a remote caller.
    pub fn public_message(&self) -> String {
        match self {
            Error::Internal { .. } => "internal server error".to_string(),
            // Evidence failures never say which attribute mismatched.
            Error::Unauthorized(_) => "unauthorized".to_string(),
            other => other.to_string(),
        }
    }
}

/// Attach an internal-error context to any fallible result, in the manner of
/// `anyhow::Context`.
pub trait InternalContext<T> {
    fn internal(self, context: &str) -> Result<T>;
}

impl<T, E> InternalContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn internal(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::internal(context, e))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Error::Validation("bad".into()), 400)]
    #[case(Error::UnsupportedMediaType("text/html".into()), 415)]
    #[case(Error::Unauthorized("nonce".into()), 401)]
    #[case(Error::NotFound("key".into()), 404)]
    #[case(Error::Conflict("in use".into()), 400)]
    #[case(Error::Unsupported("EC".into()), 400)]
    #[case(Error::internal("store", anyhow::anyhow!("disk")), 500)]
    fn test_status_codes(#[case] err: Error, #[case] status: u16) {
        assert_eq!(err.kind().status_code(), status);
    }

    #[test]
    fn test_internal_error_hides_cause() {
        let err: Result<()> = Err(anyhow::anyhow!("kmip: socket reset")).internal("delete key");
        let err = err.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.public_message().contains("kmip"));
        assert_eq!(err.to_string(), "delete key");
    }

    #[test]
    fn test_unauthorized_is_generic() {
        let err = Error::Unauthorized("mrsigner mismatch".into());
        assert_eq!(err.public_message(), "unauthorized");
    }
}
