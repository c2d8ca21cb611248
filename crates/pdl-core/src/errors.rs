//! Error types for the PDL interpreter.
//!
//! This module defines the full error taxonomy:
//!
//! - [`PdlError`] — top-level enum wrapping all error kinds
//! - [`ProviderError`] — model/api/code/read provider failure taxonomy
//!
//! All types derive `Serialize` so an error can be embedded in a trace node
//! and serialized out alongside the document.
//!
//! Per the propagation policy, most of these are never `?`-propagated out of
//! `eval` — a block that fails still lets its siblings run (P1), so the
//! common case is pushing a `PdlError` onto a trace node's `errors` list,
//! not returning `Err`. `Result<_, PdlError>` is reserved for the few true
//! abort points: internal invariant violations and cooperative cancellation.

use serde::Serialize;

use crate::ast::Location;

/// Model/api/code/read provider failure taxonomy.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
pub enum ProviderError {
    #[error("{message}")]
    RateLimit {
        message: String,
        provider: Option<String>,
        retry_after: Option<f64>,
    },

    #[error("{message}")]
    Authentication {
        message: String,
        provider: Option<String>,
    },

    #[error("{message}")]
    Unavailable {
        message: String,
        provider: Option<String>,
        status_code: Option<u16>,
    },

    #[error("{message}")]
    Timeout { message: String, provider: Option<String> },

    /// Nonzero exit / stderr output from a `code` provider.
    #[error("{message}")]
    ExecutionFailed {
        message: String,
        stdout: Option<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("{message}")]
    Other {
        message: String,
        provider: Option<String>,
        retryable: bool,
    },
}

impl ProviderError {
    /// RateLimit/Unavailable/Timeout are retryable by default; `Other`
    /// carries an explicit flag.
    pub fn retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } => true,
            Self::Unavailable { .. } => true,
            Self::Timeout { .. } => true,
            Self::Other { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// The full error taxonomy, independent of where in evaluation it occurred.
/// Every variant carries the `<file>:<line>` location needed for the
/// user-visible `<file>:<line> - <message>` format.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
pub enum PdlError {
    /// Surface-level field-missing / field-not-allowed / type-shape errors
    /// from the AST validator. The evaluator never raises these itself —
    /// they can only appear here if a caller attaches pre-validation errors
    /// to a block before evaluating it — but the variant exists so the
    /// taxonomy is complete and a single error type can flow end to end.
    #[error("{}", location.format(message))]
    Validation { location: Location, message: String },

    /// `get`, `call`, or template reference to a name absent from scope.
    #[error("{}", location.format(&format!("{name} is undefined")))]
    UndefinedName { location: Location, name: String },

    /// Spec-check mismatch at a block boundary, call site, or return.
    #[error("{}", location.format(message))]
    Type { location: Location, message: String },

    /// `json`/`yaml`/regex/pdl sub-parser failed on a string.
    #[error("{}", location.format(message))]
    Parser { location: Location, message: String },

    /// For-block inputs are not lists, or have unequal lengths.
    #[error("{}", location.format(message))]
    Iterable { location: Location, message: String },

    /// Model, api, code, or read provider failed.
    #[error("{}", location.format(&source.to_string()))]
    Provider {
        location: Location,
        #[source]
        source: ProviderError,
    },

    /// Should-not-happen; aborts the current block.
    #[error("{}", location.format(message))]
    Internal { location: Location, message: String },
}

impl PdlError {
    pub fn location(&self) -> &Location {
        match self {
            PdlError::Validation { location, .. }
            | PdlError::UndefinedName { location, .. }
            | PdlError::Type { location, .. }
            | PdlError::Parser { location, .. }
            | PdlError::Iterable { location, .. }
            | PdlError::Provider { location, .. }
            | PdlError::Internal { location, .. } => location,
        }
    }

    pub fn undefined_name(location: Location, name: impl Into<String>) -> PdlError {
        PdlError::UndefinedName {
            location,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Location {
        Location {
            path: vec![],
            file: "prog.pdl".to_string(),
            table: Default::default(),
        }
    }

    #[test]
    fn undefined_name_message_matches_the_documented_format() {
        let err = PdlError::undefined_name(loc(), "somevar");
        assert_eq!(err.to_string(), "prog.pdl:0 - somevar is undefined");
    }

    #[test]
    fn provider_rate_limit_is_retryable() {
        let err = ProviderError::RateLimit {
            message: "429".into(),
            provider: Some("openai".into()),
            retry_after: Some(1.5),
        };
        assert!(err.retryable());
    }

    #[test]
    fn provider_authentication_is_not_retryable_by_default() {
        let err = ProviderError::Authentication {
            message: "bad key".into(),
            provider: Some("watsonx".into()),
        };
        assert!(!err.retryable());
    }

    #[test]
    fn errors_are_serializable() {
        let err = PdlError::Type {
            location: loc(),
            message: "hello should be of type <class 'int'>".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("hello should be of type"));
    }
}
