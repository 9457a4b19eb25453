//! Error classification.
//!
//! A pure mapping from an error's message and SQLSTATE code to an
//! [`ErrorClass`]. Only [`ErrorClass::Termination`] is retried; the other
//! classes carry an operator-facing remediation hint.

use std::fmt;
use std::io;

use crate::pg::PgError;

/// What kind of failure an error represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The server (or a proxy in front of it) closed the connection.
    Termination,
    /// Credentials or tenant were rejected.
    Authentication,
    /// TLS certificate verification failed.
    Certificate,
    /// A table or relation is missing.
    SchemaRelated,
    Other,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::Termination
    }

    /// Remediation hint shown alongside the error.
    pub fn hint(self) -> &'static str {
        match self {
            ErrorClass::Termination => {
                "The database closed the connection. The pool was rebuilt and the statement \
                 retried; if this persists, check the server's idle timeout and availability."
            }
            ErrorClass::Authentication => {
                "Authentication failed. Check the user name, password and project/tenant in \
                 DATABASE_URL."
            }
            ErrorClass::Certificate => {
                "TLS certificate verification failed. Managed databases often present \
                 certificates that do not chain to a public root; use sslmode=require instead \
                 of verify-full in development only."
            }
            ErrorClass::SchemaRelated => {
                "A table or relation does not exist. The database schema may be out of sync \
                 with the application; run pending migrations."
            }
            ErrorClass::Other => "Unexpected database error. See the underlying error for details.",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Termination => "termination",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Certificate => "certificate",
            ErrorClass::SchemaRelated => "schema",
            ErrorClass::Other => "other",
        };
        f.write_str(name)
    }
}

/// Message fragments (lower case) that mean the server closed the session.
pub const TERMINATION_MARKERS: &[&str] = &[
    "shutdown",
    "db_termination",
    "connection terminated",
    "server closed the connection",
    "terminating connection",
];

/// SQLSTATEs: admin_shutdown, crash_shutdown, cannot_connect_now.
pub const TERMINATION_CODES: &[&str] = &["57P01", "57P02", "57P03"];

pub const AUTHENTICATION_MARKERS: &[&str] =
    &["tenant or user not found", "password authentication failed"];

pub const CERTIFICATE_MARKERS: &[&str] = &[
    "self signed certificate",
    "self-signed certificate",
    "self_signed_cert_in_chain",
    "invalid peer certificate",
];

const UNDEFINED_TABLE: &str = "42P01";

/// Classify an error from its message and optional SQLSTATE code.
///
/// Rules are checked in order; the first match wins.
pub fn classify(message: &str, code: Option<&str>) -> ErrorClass {
    let message = message.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| message.contains(m));

    if contains_any(TERMINATION_MARKERS) || code.is_some_and(|c| TERMINATION_CODES.contains(&c))
    {
        ErrorClass::Termination
    } else if contains_any(AUTHENTICATION_MARKERS) {
        ErrorClass::Authentication
    } else if contains_any(CERTIFICATE_MARKERS) {
        ErrorClass::Certificate
    } else if (message.contains("relation") && message.contains("does not exist"))
        || code == Some(UNDEFINED_TABLE)
    {
        ErrorClass::SchemaRelated
    } else {
        ErrorClass::Other
    }
}

/// Classify a driver error.
///
/// A closed connection, a closed pool and a reset socket are terminations
/// regardless of their wording.
pub fn classify_error(error: &PgError) -> ErrorClass {
    match error {
        PgError::ConnectionClosed | PgError::PoolClosed => ErrorClass::Termination,
        PgError::Io(e) if is_disconnect(e) => ErrorClass::Termination,
        PgError::Server { message, code, .. } => {
            classify(message, (!code.is_empty()).then_some(code.as_str()))
        }
        other => classify(&other.to_string(), None),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(severity: &str, code: &str, message: &str) -> PgError {
        PgError::Server {
            severity: severity.to_string(),
            code: code.to_string(),
            message: message.to_string(),
            detail: None,
            hint: None,
        }
    }

    #[test]
    fn test_termination_messages() {
        for message in [
            "terminating connection due to administrator command",
            "Connection terminated unexpectedly",
            "server closed the connection unexpectedly",
            "{:shutdown, :db_termination}",
            "server shutdown in progress",
        ] {
            assert_eq!(classify(message, None), ErrorClass::Termination, "{message}");
        }
    }

    #[test]
    fn test_termination_codes() {
        for code in TERMINATION_CODES {
            assert_eq!(classify("boom", Some(*code)), ErrorClass::Termination);
        }
        assert_eq!(classify("boom", Some("57014")), ErrorClass::Other);
    }

    #[test]
    fn test_authentication() {
        assert_eq!(
            classify("FATAL: Tenant or user not found", Some("XX000")),
            ErrorClass::Authentication
        );
        assert_eq!(
            classify("password authentication failed for user \"app\"", Some("28P01")),
            ErrorClass::Authentication
        );
    }

    #[test]
    fn test_certificate() {
        assert_eq!(
            classify("self signed certificate in certificate chain", None),
            ErrorClass::Certificate
        );
        assert_eq!(classify("SELF_SIGNED_CERT_IN_CHAIN", None), ErrorClass::Certificate);
        assert_eq!(
            classify("TLS error: handshake failed: invalid peer certificate: UnknownIssuer", None),
            ErrorClass::Certificate
        );
    }

    #[test]
    fn test_schema() {
        assert_eq!(
            classify("relation \"orders\" does not exist", None),
            ErrorClass::SchemaRelated
        );
        assert_eq!(classify("no such thing", Some("42P01")), ErrorClass::SchemaRelated);
        assert_eq!(
            classify("column \"x\" does not exist", Some("42703")),
            ErrorClass::Other
        );
    }

    #[test]
    fn test_termination_takes_precedence() {
        // An admin shutdown whose text also mentions a relation.
        assert_eq!(
            classify("terminating connection; relation \"t\" does not exist", Some("42P01")),
            ErrorClass::Termination
        );
    }

    #[test]
    fn test_classify_driver_errors() {
        assert_eq!(classify_error(&PgError::ConnectionClosed), ErrorClass::Termination);
        assert_eq!(classify_error(&PgError::PoolClosed), ErrorClass::Termination);
        assert_eq!(
            classify_error(&PgError::Io(io::Error::from(io::ErrorKind::ConnectionReset))),
            ErrorClass::Termination
        );
        assert_eq!(
            classify_error(&PgError::Io(io::Error::from(io::ErrorKind::ConnectionRefused))),
            ErrorClass::Other
        );
        assert_eq!(classify_error(&PgError::Timeout), ErrorClass::Other);
        assert_eq!(
            classify_error(&server_error(
                "FATAL",
                "57P01",
                "terminating connection due to administrator command"
            )),
            ErrorClass::Termination
        );
        assert_eq!(
            classify_error(&server_error("ERROR", "42P01", "relation \"t\" does not exist")),
            ErrorClass::SchemaRelated
        );
    }

    #[test]
    fn test_only_termination_is_retryable() {
        assert!(ErrorClass::Termination.is_retryable());
        assert!(!ErrorClass::Authentication.is_retryable());
        assert!(!ErrorClass::Other.is_retryable());
    }
}
