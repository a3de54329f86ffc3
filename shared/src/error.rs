use serde::{Serialize, Deserialize};
use std::fmt;
use thiserror::Error;
use crate::validation::ValidationError;

#[derive(Debug, Clone, Copy, Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    #[error("Invalid choice")]
    InvalidChoice,
    #[error("Unsupported channel")]
    UnsupportedChannel,
    #[error("Resource not found")]
    NotFound,
    #[error("Dependency unavailable")]
    Unavailable,
    #[error("Internal system error")]
    SystemError,
}

/// Error body returned to viewers and voters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(details) = &self.details {
            write!(f, "{}: {} ({})", self.code, self.message, details)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        let code = match err {
            ValidationError::UnsupportedChannel(_) => ErrorCode::UnsupportedChannel,
            _ => ErrorCode::InvalidChoice,
        };
        Self::new(code, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
