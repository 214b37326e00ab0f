//! Layered error definitions
//!
//! Categorized by recoverability: decode / auth / lookup errors are dropped
//! and counted, channel errors trigger reconnects, invariant violations halt
//! the affected component.

use thiserror::Error;

/// Unified error type
#[derive(Debug, Error)]
pub enum TimingError {
    // ===== Recoverable: skip bytes / frame =====
    /// Frame could not be parsed; pipeline resyncs on the next frame start
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    // ===== Recoverable: drop message =====
    /// Signature missing or wrong; the message is discarded
    #[error("authentication error: {reason}")]
    Authentication { reason: String },

    // ===== Recoverable: surfaced as operator warning =====
    /// Crossing for a transponder with no active race assignment
    #[error("unknown transponder: {transponder_id}")]
    UnknownTransponder { transponder_id: String },

    // ===== Recoverable: triggers reconnect =====
    /// Network or serial channel failed
    #[error("channel error: {message}")]
    Channel {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // ===== Fatal to the affected component =====
    /// Sequence gap, overlapping pause windows, or similar corruption;
    /// implies a hole in timing data and must surface loudly
    #[error("invariant violation: {context}")]
    InvariantViolation { context: String },

    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Structural equality over the public fields. The opaque `source` boxes and
/// the wrapped [`std::io::Error`] are not themselves `PartialEq`, so they are
/// compared by presence / kind rather than deep equality.
impl PartialEq for TimingError {
    fn eq(&self, other: &Self) -> bool {
        use TimingError::*;
        match (self, other) {
            (MalformedFrame { reason: a }, MalformedFrame { reason: b }) => a == b,
            (Authentication { reason: a }, Authentication { reason: b }) => a == b,
            (
                UnknownTransponder { transponder_id: a },
                UnknownTransponder { transponder_id: b },
            ) => a == b,
            (
                Channel {
                    message: a,
                    source: sa,
                },
                Channel {
                    message: b,
                    source: sb,
                },
            ) => a == b && sa.is_some() == sb.is_some(),
            (InvariantViolation { context: a }, InvariantViolation { context: b }) => a == b,
            (
                ConfigParse {
                    message: a,
                    source: sa,
                },
                ConfigParse {
                    message: b,
                    source: sb,
                },
            ) => a == b && sa.is_some() == sb.is_some(),
            (
                ConfigValidation {
                    field: fa,
                    message: ma,
                },
                ConfigValidation {
                    field: fb,
                    message: mb,
                },
            ) => fa == fb && ma == mb,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            (Other(a), Other(b)) => a == b,
            _ => false,
        }
    }
}

impl TimingError {
    /// Create a malformed frame error
    pub fn malformed_frame(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create an unknown transponder error
    pub fn unknown_transponder(transponder_id: impl Into<String>) -> Self {
        Self::UnknownTransponder {
            transponder_id: transponder_id.into(),
        }
    }

    /// Create a channel error without an underlying source
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
            source: None,
        }
    }

    /// Create a channel error wrapping an underlying error
    pub fn channel_from(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Channel {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invariant violation
    pub fn invariant(context: impl Into<String>) -> Self {
        Self::InvariantViolation {
            context: context.into(),
        }
    }

    /// Create a configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True when the pipeline should keep running after logging this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvariantViolation { .. })
    }
}
