// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for service clients.

use thiserror::Error;
use vmflow_core::TaskError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors returned by service clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientError {
    /// The request never produced a response (connect, timeout, TLS).
    #[error("{service}: transport error: {message}")]
    Transport {
        /// Service name
        service: &'static str,
        /// Error details
        message: String,
    },

    /// Non-success status not covered by a more specific variant.
    #[error("{service}: HTTP {status}: {body}")]
    Http {
        /// Service name
        service: &'static str,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The resource does not exist (404).
    #[error("{service}: not found: {resource}")]
    NotFound {
        /// Service name
        service: &'static str,
        /// Resource path or identifier
        resource: String,
    },

    /// Conflicting concurrent update (409).
    #[error("{service}: conflict: {message}")]
    Conflict {
        /// Service name
        service: &'static str,
        /// Error details
        message: String,
    },

    /// The response body could not be decoded.
    #[error("{service}: invalid response: {message}")]
    Decode {
        /// Service name
        service: &'static str,
        /// Error details
        message: String,
    },
}

impl ClientError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Http { .. } => "HTTP_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::Decode { .. } => "DECODE_ERROR",
        }
    }

    /// Whether this is a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is a 409.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Service that produced the error.
    pub fn service(&self) -> &'static str {
        match self {
            Self::Transport { service, .. }
            | Self::Http { service, .. }
            | Self::NotFound { service, .. }
            | Self::Conflict { service, .. }
            | Self::Decode { service, .. } => service,
        }
    }
}

impl From<ClientError> for TaskError {
    fn from(err: ClientError) -> Self {
        let service = err.service().to_string();
        match err {
            ClientError::Transport { message, .. } | ClientError::Conflict { message, .. } => {
                TaskError::Transient { service, message }
            }
            ClientError::Http { status, body, .. } if status >= 500 => TaskError::Transient {
                service,
                message: format!("HTTP {}: {}", status, body),
            },
            ClientError::Http { status, body, .. } => TaskError::Service {
                service,
                status,
                message: body,
            },
            ClientError::NotFound { resource, .. } => TaskError::Service {
                service,
                status: 404,
                message: format!("not found: {}", resource),
            },
            ClientError::Decode { message, .. } => TaskError::Service {
                service,
                status: 0,
                message: format!("invalid response: {}", message),
            },
        }
    }
}
