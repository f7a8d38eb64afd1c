//! Error types and handling for the gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Why the guardian refused a dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardianErrorKind {
    /// The address is not a literal IP or could not be parsed
    BadHost,
    /// The address falls inside a blocked range
    BlockedIp,
}

impl std::fmt::Display for GuardianErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardianErrorKind::BadHost => write!(f, "bad host"),
            GuardianErrorKind::BlockedIp => write!(f, "blocked ip"),
        }
    }
}

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed client input
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// Missing or rejected credentials
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Entity lookup failed
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Input is well formed but cannot be acted upon
    #[error("Invalid: {message}")]
    Invalid { message: String },

    /// Internal state assumption was broken
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Upstream failed or could not be reached
    #[error("Gateway error: {message}")]
    Gateway { message: String },

    /// Anything else
    #[error("Unexpected error: {message}")]
    Unexpected { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Dial refused by the SSRF policy
    #[error("Guardian refused dial ({kind}): {message}")]
    Guardian {
        kind: GuardianErrorKind,
        message: String,
    },

    /// Encryption or decryption failure
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    /// Operation was cancelled by the caller
    #[error("Cancelled: {message}")]
    Cancelled { message: String },

    /// Workflow or activity failure
    #[error("Workflow error: {message}")]
    Workflow { message: String, non_retryable: bool },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Create a bad request error
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an invariant violation error
    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create an upstream gateway error
    pub fn gateway<S: Into<String>>(message: S) -> Self {
        Self::Gateway {
            message: message.into(),
        }
    }

    /// Create an unexpected error
    pub fn unexpected<S: Into<String>>(message: S) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a guardian error for a host that is not a literal IP
    pub fn bad_host<S: Into<String>>(message: S) -> Self {
        Self::Guardian {
            kind: GuardianErrorKind::BadHost,
            message: message.into(),
        }
    }

    /// Create a guardian error for an address inside a blocked range
    pub fn blocked_ip<S: Into<String>>(message: S) -> Self {
        Self::Guardian {
            kind: GuardianErrorKind::BlockedIp,
            message: message.into(),
        }
    }

    /// Create an encryption error
    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a workflow error that the engine may retry
    pub fn workflow<S: Into<String>>(message: S) -> Self {
        Self::Workflow {
            message: message.into(),
            non_retryable: false,
        }
    }

    /// Create a workflow error that must not be retried
    pub fn non_retryable<S: Into<String>>(message: S) -> Self {
        Self::Workflow {
            message: message.into(),
            non_retryable: true,
        }
    }

    /// HTTP status code this error maps to when surfaced to a caller
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BadRequest { .. } => 400,
            GatewayError::Unauthorized { .. } => 401,
            GatewayError::NotFound { .. } => 404,
            GatewayError::Invalid { .. } | GatewayError::Url(_) => 422,
            GatewayError::Gateway { .. } | GatewayError::Guardian { .. } | GatewayError::Http(_) => 502,
            GatewayError::Cancelled { .. } => 499,
            GatewayError::InvariantViolation { .. }
            | GatewayError::Unexpected { .. }
            | GatewayError::Config { .. }
            | GatewayError::Encryption { .. }
            | GatewayError::Workflow { .. }
            | GatewayError::Io(_)
            | GatewayError::Serde(_)
            | GatewayError::Yaml(_)
            | GatewayError::Internal(_) => 500,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Gateway { .. } | GatewayError::Http(_) | GatewayError::Io(_) => true,
            GatewayError::Workflow { non_retryable, .. } => !non_retryable,
            GatewayError::Unexpected { .. } | GatewayError::Internal(_) => true,
            _ => false,
        }
    }

    /// Get the error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::BadRequest { .. } => "bad_request",
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::Invalid { .. } => "invalid",
            GatewayError::InvariantViolation { .. } => "invariant_violation",
            GatewayError::Gateway { .. } => "gateway_error",
            GatewayError::Unexpected { .. } => "unexpected",
            GatewayError::Config { .. } => "config",
            GatewayError::Guardian { .. } => "guardian",
            GatewayError::Encryption { .. } => "encryption",
            GatewayError::Cancelled { .. } => "cancelled",
            GatewayError::Workflow { .. } => "workflow",
            GatewayError::Io(_) => "io",
            GatewayError::Serde(_) => "serialization",
            GatewayError::Yaml(_) => "yaml",
            GatewayError::Http(_) => "http",
            GatewayError::Url(_) => "url",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Guardian failure kind, if this error came from a refused dial
    pub fn guardian_kind(&self) -> Option<GuardianErrorKind> {
        match self {
            GatewayError::Guardian { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl Clone for GatewayError {
    fn clone(&self) -> Self {
        match self {
            GatewayError::BadRequest { message } => GatewayError::bad_request(message.clone()),
            GatewayError::Unauthorized { message } => GatewayError::unauthorized(message.clone()),
            GatewayError::NotFound { message } => GatewayError::not_found(message.clone()),
            GatewayError::Invalid { message } => GatewayError::invalid(message.clone()),
            GatewayError::InvariantViolation { message } => GatewayError::invariant(message.clone()),
            GatewayError::Gateway { message } => GatewayError::gateway(message.clone()),
            GatewayError::Unexpected { message } => GatewayError::unexpected(message.clone()),
            GatewayError::Config { message } => GatewayError::config(message.clone()),
            GatewayError::Guardian { kind, message } => GatewayError::Guardian {
                kind: *kind,
                message: message.clone(),
            },
            GatewayError::Encryption { message } => GatewayError::encryption(message.clone()),
            GatewayError::Cancelled { message } => GatewayError::cancelled(message.clone()),
            GatewayError::Workflow {
                message,
                non_retryable,
            } => GatewayError::Workflow {
                message: message.clone(),
                non_retryable: *non_retryable,
            },

            // For non-cloneable types, keep the rendered message
            GatewayError::Io(e) => GatewayError::unexpected(format!("IO error: {}", e)),
            GatewayError::Serde(e) => GatewayError::unexpected(format!("Serialization error: {}", e)),
            GatewayError::Yaml(e) => GatewayError::unexpected(format!("YAML error: {}", e)),
            GatewayError::Http(e) => GatewayError::gateway(format!("HTTP error: {}", e)),
            GatewayError::Url(e) => GatewayError::invalid(format!("URL error: {}", e)),
            GatewayError::Internal(e) => GatewayError::unexpected(format!("Internal error: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(GatewayError::bad_request("x").status_code(), 400);
        assert_eq!(GatewayError::unauthorized("x").status_code(), 401);
        assert_eq!(GatewayError::not_found("x").status_code(), 404);
        assert_eq!(GatewayError::invalid("x").status_code(), 422);
        assert_eq!(GatewayError::invariant("x").status_code(), 500);
        assert_eq!(GatewayError::gateway("x").status_code(), 502);
        assert_eq!(GatewayError::unexpected("x").status_code(), 500);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::gateway("upstream down").is_retryable());
        assert!(GatewayError::workflow("transient").is_retryable());
        assert!(!GatewayError::non_retryable("bad state").is_retryable());
        assert!(!GatewayError::bad_request("nope").is_retryable());
        assert!(!GatewayError::invariant("broken").is_retryable());
    }

    #[test]
    fn test_clone_keeps_guardian_kind() {
        let err = GatewayError::blocked_ip("10.0.0.1");
        assert_eq!(err.clone().guardian_kind(), Some(GuardianErrorKind::BlockedIp));
        assert_eq!(err.category(), "guardian");
    }
}
