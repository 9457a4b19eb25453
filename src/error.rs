//! Error types for pgsentinel.

use thiserror::Error;

use crate::classify::{classify_error, ErrorClass};
use crate::pg::PgError;

#[derive(Error, Debug)]
pub enum SentinelError {
    /// Missing or invalid settings. Never retried.
    #[error("Configuration error: {message}. {hint}")]
    Configuration { message: String, hint: String },

    /// A database failure, classified and annotated with a remediation hint.
    #[error("Database error ({class}): {source}. {hint}")]
    Database {
        class: ErrorClass,
        hint: &'static str,
        #[source]
        source: PgError,
    },
}

impl SentinelError {
    pub fn configuration(message: impl Into<String>, hint: impl Into<String>) -> Self {
        SentinelError::Configuration {
            message: message.into(),
            hint: hint.into(),
        }
    }

    /// Classify a driver error and attach its hint.
    pub fn database(source: PgError) -> Self {
        let class = classify_error(&source);
        SentinelError::Database {
            class,
            hint: class.hint(),
            source,
        }
    }

    /// Classification of a database error; `None` for configuration errors.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            SentinelError::Database { class, .. } => Some(*class),
            SentinelError::Configuration { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_some_and(ErrorClass::is_retryable)
    }

    pub fn hint(&self) -> &str {
        match self {
            SentinelError::Configuration { hint, .. } => hint,
            SentinelError::Database { hint, .. } => hint,
        }
    }

    /// The underlying driver error, if any.
    pub fn pg_error(&self) -> Option<&PgError> {
        match self {
            SentinelError::Database { source, .. } => Some(source),
            SentinelError::Configuration { .. } => None,
        }
    }
}

impl From<PgError> for SentinelError {
    fn from(err: PgError) -> Self {
        SentinelError::database(err)
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_database_error_keeps_source() {
        let err = SentinelError::from(PgError::Server {
            severity: "FATAL".to_string(),
            code: "28P01".to_string(),
            message: "password authentication failed for user \"app\"".to_string(),
            detail: None,
            hint: None,
        });

        assert_eq!(err.class(), Some(ErrorClass::Authentication));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("password authentication failed"));
        assert!(err.to_string().contains("DATABASE_URL"));
        assert!(err.source().is_some());
        assert_eq!(err.pg_error().and_then(PgError::code), Some("28P01"));
    }

    #[test]
    fn test_configuration_error() {
        let err = SentinelError::configuration("DATABASE_URL is not set", "Set DATABASE_URL");

        assert_eq!(err.class(), None);
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Configuration error: DATABASE_URL is not set. Set DATABASE_URL"
        );
    }

    #[test]
    fn test_termination_is_retryable() {
        let err = SentinelError::from(PgError::ConnectionClosed);
        assert_eq!(err.class(), Some(ErrorClass::Termination));
        assert!(err.is_retryable());
    }
}
