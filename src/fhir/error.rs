//! FHIR client error types.
//!
//! Errors are split into two kinds because only one of them is worth retrying:
//!
//! - **Transient**: connect failures, timeouts, HTTP 429 and 5xx.
//! - **Permanent**: every other 4xx, malformed response bodies, invalid URLs.

use std::fmt;
use thiserror::Error;

/// The kind of FHIR client error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FhirErrorKind {
    /// Safe to retry with backoff.
    Transient,
    /// Retrying will not help.
    Permanent,
}

impl FhirErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, FhirErrorKind::Transient)
    }

    /// Classifies an HTTP status code returned by a FHIR server.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => FhirErrorKind::Transient,
            500..=599 => FhirErrorKind::Transient,
            _ => FhirErrorKind::Permanent,
        }
    }
}

/// A failed call to a FHIR server.
#[derive(Debug, Error)]
pub struct FhirError {
    pub kind: FhirErrorKind,

    /// The HTTP status code, if the server answered.
    pub status: Option<u16>,

    /// What was being attempted, plus the server's response body if any.
    pub message: String,

    #[source]
    pub source: Option<reqwest::Error>,
}

impl fmt::Display for FhirError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "FHIR server error (HTTP {}): {}", code, self.message),
            None => write!(f, "FHIR client error: {}", self.message),
        }
    }
}

impl FhirError {
    /// Creates an error for a non-success HTTP response.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        FhirError {
            kind: FhirErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transient error without a transport source.
    pub fn transient(message: impl Into<String>) -> Self {
        FhirError {
            kind: FhirErrorKind::Transient,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent error without a transport source.
    pub fn permanent(message: impl Into<String>) -> Self {
        FhirError {
            kind: FhirErrorKind::Permanent,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes a reqwest error raised while `context` was being attempted.
    pub fn from_reqwest(context: impl Into<String>, err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let kind = match status {
            Some(code) => FhirErrorKind::from_status(code),
            None if err.is_timeout() || err.is_connect() || err.is_request() => {
                FhirErrorKind::Transient
            }
            None => FhirErrorKind::Permanent,
        };

        FhirError {
            kind,
            status,
            message: format!("{}: {}", context.into(), err),
            source: Some(err),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(FhirErrorKind::from_status(429), FhirErrorKind::Transient);
        assert_eq!(FhirErrorKind::from_status(500), FhirErrorKind::Transient);
        assert_eq!(FhirErrorKind::from_status(503), FhirErrorKind::Transient);
        assert_eq!(FhirErrorKind::from_status(400), FhirErrorKind::Permanent);
        assert_eq!(FhirErrorKind::from_status(404), FhirErrorKind::Permanent);
        assert_eq!(FhirErrorKind::from_status(412), FhirErrorKind::Permanent);
    }

    #[test]
    fn display_includes_status_when_known() {
        let err = FhirError::status(422, "PUT Patient/1: invalid resource");
        assert_eq!(
            err.to_string(),
            "FHIR server error (HTTP 422): PUT Patient/1: invalid resource"
        );
        assert!(!err.is_retriable());

        let err = FhirError::transient("connection reset");
        assert_eq!(err.to_string(), "FHIR client error: connection reset");
        assert!(err.is_retriable());
    }
}
