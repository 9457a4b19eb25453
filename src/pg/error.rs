//! Driver errors.

use std::io;

use thiserror::Error;

pub type PgResult<T> = Result<T, PgError>;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected message or malformed frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Client-side authentication failure (missing password, bad SCRAM exchange).
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid connection settings: {0}")]
    Config(String),

    /// ErrorResponse from the server.
    #[error("{severity}: {message} ({code}){}", server_extras(.detail, .hint))]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    #[error("Type error: {0}")]
    Type(String),

    /// The server hung up, or the connection was already marked closed.
    #[error("Connection terminated by server")]
    ConnectionClosed,

    #[error("Pool has been closed")]
    PoolClosed,

    /// Establishing a connection or waiting for a pool slot took too long.
    #[error("Timed out establishing connection")]
    Timeout,
}

fn server_extras(detail: &Option<String>, hint: &Option<String>) -> String {
    let mut extras = String::new();
    if let Some(detail) = detail {
        extras.push_str("\nDetail: ");
        extras.push_str(detail);
    }
    if let Some(hint) = hint {
        extras.push_str("\nHint: ");
        extras.push_str(hint);
    }
    extras
}

impl PgError {
    /// SQLSTATE reported by the server, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } if !code.is_empty() => Some(code),
            _ => None,
        }
    }

    pub fn severity(&self) -> Option<&str> {
        match self {
            PgError::Server { severity, .. } => Some(severity),
            _ => None,
        }
    }

    /// FATAL and PANIC end the session; the server closes the socket next.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), Some("FATAL" | "PANIC"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = PgError::Server {
            severity: "ERROR".to_string(),
            code: "42P01".to_string(),
            message: "relation \"orders\" does not exist".to_string(),
            detail: None,
            hint: Some("Run migrations.".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "ERROR: relation \"orders\" does not exist (42P01)\nHint: Run migrations."
        );
        assert_eq!(err.code(), Some("42P01"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_io_source() {
        let err = PgError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(PgError::Timeout.code(), None);
    }
}
