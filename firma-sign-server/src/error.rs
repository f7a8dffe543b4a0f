//! API-level error taxonomy and the HTTP error envelope.
//!
//! Every failure that crosses the API boundary is an [`ApiError`]. Layer
//! errors ([`StoreError`](crate::db::StoreError),
//! [`BlobError`](crate::blob::BlobError),
//! [`TransportError`](crate::transport::TransportError)) convert into it,
//! and `IntoResponse` renders the `{error:{code,message,details?}}`
//! envelope with the matching status code.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::blob::BlobError;
use crate::db::StoreError;
use crate::transport::TransportError;

/// A single invalid field in a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Dotted path of the offending field.
    pub field: String,
    /// Why the field was rejected.
    pub reason: String,
}

impl FieldError {
    /// Creates a field error.
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced through the HTTP API and the WebSocket error frame.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Client input failed validation.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Summary of the failure.
        message: String,
        /// Per-field reasons.
        details: Vec<FieldError>,
    },

    /// An entity lookup found nothing.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource kind, e.g. `peer`, `group`, `transfer`.
        resource: &'static str,
        /// The id that missed.
        id: String,
    },

    /// An invariant would be violated (duplicate identifier, owner removal).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Connecting to a peer failed over every requested transport.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The named transport is not registered or not active.
    #[error("transport not available: {0}")]
    TransportUnavailable(String),

    /// A transport failed in a retryable way.
    #[error("transport error (retryable): {0}")]
    TransportTransient(String),

    /// A transport failed permanently (auth, unsupported operation).
    #[error("transport error (permanent): {0}")]
    TransportPermanent(String),

    /// Persistence or blob storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Too many requests from this client.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Shorthand for a single-field validation failure.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        let field = field.into();
        let reason = reason.into();
        Self::InvalidRequest {
            message: format!("{field}: {reason}"),
            details: vec![FieldError::new(field, reason)],
        }
    }

    /// Shorthand for a not-found lookup.
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Machine-readable error code for the envelope.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::InvalidRequest { .. } => "INVALID_REQUEST".into(),
            Self::NotFound { resource, .. } => {
                format!("{}_NOT_FOUND", resource.to_ascii_uppercase())
            }
            Self::Conflict(_) => "CONFLICT".into(),
            Self::Unauthorized => "UNAUTHORIZED".into(),
            Self::Forbidden(_) => "FORBIDDEN".into(),
            Self::ConnectionFailed(_) => "CONNECTION_FAILED".into(),
            Self::TransportUnavailable(_) => "TRANSPORT_NOT_AVAILABLE".into(),
            Self::TransportTransient(_) | Self::TransportPermanent(_) => "TRANSFER_FAILED".into(),
            Self::Storage(_) => "STORAGE_ERROR".into(),
            Self::RateLimited => "RATE_LIMITED".into(),
            Self::Internal(_) => "INTERNAL_ERROR".into(),
        }
    }

    /// HTTP status the envelope is sent with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::TransportUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ConnectionFailed(_)
            | Self::TransportTransient(_)
            | Self::TransportPermanent(_)
            | Self::Storage(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorEnvelope,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let details = match &self {
            Self::InvalidRequest { details, .. } if !details.is_empty() => Some(details.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorEnvelope {
                code: self.code(),
                message: self.to_string(),
                details,
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { resource, id } => Self::NotFound { resource, id },
            StoreError::Constraint { column } => {
                Self::Conflict(format!("constraint violated on {column}"))
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(path) => Self::NotFound {
                resource: "document",
                id: path,
            },
            BlobError::InvalidPath(reason) => Self::invalid("path", reason),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(name) => Self::TransportUnavailable(name),
            TransportError::Transient(msg) => Self::TransportTransient(msg),
            TransportError::Permanent(msg) | TransportError::Unsupported(msg) => {
                Self::TransportPermanent(msg)
            }
        }
    }
}
