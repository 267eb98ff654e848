//! Outcome taxonomy shared by both transports.
//!
//! Every request resolves to exactly one [`PipelineOutcome`]; its
//! [`OutcomeClass`] is what metrics are labelled with and what the transport
//! adapters translate into status codes.  The translation table lives here so
//! the RPC and HTTP encodings cannot drift apart.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::authz::OracleError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    Unauthenticated,
    RateLimited,
    PermissionDenied,
    AuthorizationUnavailable,
    Fault,
    HandlerError,
    Canceled,
}

/// Non-standard "client closed request" status, as used by nginx.
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl OutcomeClass {
    pub const ALL: [OutcomeClass; 8] = [
        OutcomeClass::Success,
        OutcomeClass::Unauthenticated,
        OutcomeClass::RateLimited,
        OutcomeClass::PermissionDenied,
        OutcomeClass::AuthorizationUnavailable,
        OutcomeClass::Fault,
        OutcomeClass::HandlerError,
        OutcomeClass::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Success => "success",
            OutcomeClass::Unauthenticated => "unauthenticated",
            OutcomeClass::RateLimited => "rate_limited",
            OutcomeClass::PermissionDenied => "permission_denied",
            OutcomeClass::AuthorizationUnavailable => "authorization_unavailable",
            OutcomeClass::Fault => "fault",
            OutcomeClass::HandlerError => "handler_error",
            OutcomeClass::Canceled => "canceled",
        }
    }

    /// Machine-readable code placed in HTTP error bodies.
    pub fn machine_code(&self) -> &'static str {
        match self {
            OutcomeClass::Success => "OK",
            OutcomeClass::Unauthenticated => "UNAUTHENTICATED",
            OutcomeClass::RateLimited => "RATE_LIMITED",
            OutcomeClass::PermissionDenied => "PERMISSION_DENIED",
            OutcomeClass::AuthorizationUnavailable => "AUTHORIZATION_UNAVAILABLE",
            OutcomeClass::Fault => "INTERNAL",
            OutcomeClass::HandlerError => "HANDLER_ERROR",
            OutcomeClass::Canceled => "CANCELED",
        }
    }

    /// HTTP status for outcomes the pipeline itself produces.  Handler errors
    /// keep whatever status the handler chose; 500 is only a fallback.
    pub fn http_status(&self) -> StatusCode {
        match self {
            OutcomeClass::Success => StatusCode::OK,
            OutcomeClass::Unauthenticated => StatusCode::UNAUTHORIZED,
            OutcomeClass::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            OutcomeClass::PermissionDenied => StatusCode::FORBIDDEN,
            OutcomeClass::AuthorizationUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            OutcomeClass::Fault | OutcomeClass::HandlerError => StatusCode::INTERNAL_SERVER_ERROR,
            OutcomeClass::Canceled => StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::REQUEST_TIMEOUT),
        }
    }

    /// RPC status code for the same outcome.
    pub fn rpc_code(&self) -> tonic::Code {
        match self {
            OutcomeClass::Success => tonic::Code::Ok,
            OutcomeClass::Unauthenticated => tonic::Code::Unauthenticated,
            OutcomeClass::RateLimited => tonic::Code::ResourceExhausted,
            OutcomeClass::PermissionDenied => tonic::Code::PermissionDenied,
            OutcomeClass::AuthorizationUnavailable => tonic::Code::Unavailable,
            OutcomeClass::Fault | OutcomeClass::HandlerError => tonic::Code::Internal,
            OutcomeClass::Canceled => tonic::Code::Cancelled,
        }
    }
}

impl fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The gate stage that turned a request away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Admission,
    Authorization,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Admission => "admission",
            StageKind::Authorization => "authorization",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("missing caller identity")]
    Unauthenticated,
    #[error("too many requests")]
    RateLimited { retry_after: Option<Duration> },
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },
    #[error("authorization service unavailable")]
    AuthorizationUnavailable(#[source] OracleError),
}

impl Rejection {
    pub fn stage(&self) -> StageKind {
        match self {
            Rejection::RateLimited { .. } => StageKind::Admission,
            _ => StageKind::Authorization,
        }
    }

    pub fn class(&self) -> OutcomeClass {
        match self {
            Rejection::Unauthenticated => OutcomeClass::Unauthenticated,
            Rejection::RateLimited { .. } => OutcomeClass::RateLimited,
            Rejection::PermissionDenied { .. } => OutcomeClass::PermissionDenied,
            Rejection::AuthorizationUnavailable(_) => OutcomeClass::AuthorizationUnavailable,
        }
    }
}

/// A panic recovered from somewhere below the recovery guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub message: String,
}

impl Fault {
    /// Public message; the panic payload itself is only logged.
    pub const PUBLIC_MESSAGE: &'static str = "internal server error";
}

#[derive(Debug)]
pub enum PipelineOutcome<R, E> {
    Success(R),
    Rejected(Rejection),
    /// The business handler ran and returned its own error.
    HandlerFailed(E),
    Faulted(Fault),
    Canceled,
}

impl<R, E> PipelineOutcome<R, E> {
    pub fn class(&self) -> OutcomeClass {
        match self {
            PipelineOutcome::Success(_) => OutcomeClass::Success,
            PipelineOutcome::Rejected(rejection) => rejection.class(),
            PipelineOutcome::HandlerFailed(_) => OutcomeClass::HandlerError,
            PipelineOutcome::Faulted(_) => OutcomeClass::Fault,
            PipelineOutcome::Canceled => OutcomeClass::Canceled,
        }
    }
}
