//! Error types for the Scaleway adapter.

use scaleway_rs::ScalewayError;
use thiserror::Error;

use crate::backend::{ClassifiedError, FailureKind};
use crate::config::ConfigError;

/// Errors raised by the Scaleway adapter.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the API answers with an error document.
    #[error("Scaleway API error ({etype}): {message}")]
    Api {
        /// Scaleway error type, for example `not_found`.
        etype: String,
        /// Message returned by the API.
        message: String,
    },
    /// Raised when a raw HTTP call returns a non-success status.
    #[error("{method} {path} returned {status}: {body}")]
    Http {
        /// HTTP method used.
        method: &'static str,
        /// Request path below the zone.
        path: String,
        /// Status code returned.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// Raised when the request never got an answer.
    #[error("transport error: {message}")]
    Transport {
        /// Message returned by the HTTP client or SDK.
        message: String,
    },
    /// Raised when a response cannot be decoded.
    #[error("cannot decode {resource}: {message}")]
    Decode {
        /// Resource being decoded.
        resource: &'static str,
        /// Decoder message.
        message: String,
    },
    /// Raised when a server exists but was not created by this crate.
    #[error("server {id} carries no batch tag")]
    NotManaged {
        /// Server identifier.
        id: String,
    },
    /// Raised when a server cannot be powered on after creation.
    #[error("server {id} in state {state} cannot be powered on")]
    PowerOnNotAllowed {
        /// Server identifier.
        id: String,
        /// State reported by the API.
        state: String,
    },
}

impl ScalewayBackendError {
    pub(super) const fn from_status(
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    ) -> Self {
        Self::Http {
            method,
            path,
            status,
            body,
        }
    }
}

impl ClassifiedError for ScalewayBackendError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Api { etype, .. } => match etype.as_str() {
                "denied_authentication" | "authentication_error" | "permissions_denied" => {
                    FailureKind::Authorization
                }
                "not_found" | "unknown_resource" => FailureKind::NotFound,
                "transient_state" | "out_of_stock" | "quotas_exceeded" => FailureKind::Transient,
                _ => FailureKind::Fatal,
            },
            Self::Http { status, .. } => match *status {
                401 | 403 => FailureKind::Authorization,
                404 => FailureKind::NotFound,
                405 | 501 => FailureKind::Unsupported,
                409 | 429 | 500..=599 => FailureKind::Transient,
                _ => FailureKind::Fatal,
            },
            Self::Transport { .. } => FailureKind::Transient,
            Self::NotManaged { .. } => FailureKind::NotFound,
            Self::Config(_) | Self::Decode { .. } | Self::PowerOnNotAllowed { .. } => {
                FailureKind::Fatal
            }
        }
    }
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        match value {
            ScalewayError::Api(api_err) => Self::Api {
                etype: api_err.etype,
                message: api_err.message,
            },
            other => Self::Transport {
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for ScalewayBackendError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode {
                resource: "response",
                message: value.to_string(),
            }
        } else {
            Self::Transport {
                message: value.to_string(),
            }
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
