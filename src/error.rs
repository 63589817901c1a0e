//! Fault taxonomy for the proxy core.
//!
//! Every error the core produces carries one of a fixed set of kinds, each
//! with a stable HTTP status mapping. The client receives a small JSON
//! document with a human-readable message and a correlation timestamp; the
//! full cause chain goes to the logging backend only.

use std::{net::IpAddr, time::Duration};

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use http::StatusCode;
use serde::Serialize;

/// Errors produced by the request admission and relay pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The URL named an instance that is not configured.
    #[error("unknown instance '{0}'")]
    InstanceNotFound(String),

    /// Missing or invalid authentication token.
    #[error("missing or invalid token")]
    Unauthorized,

    /// The client address is outside the instance's inbound allow set.
    #[error("client address {0} is not permitted to use this instance")]
    InboundDenied(IpAddr),

    /// The target violates the instance's outbound network policy.
    #[error("target '{0}' violates the instance's outbound network policy")]
    OutboundDenied(String),

    /// Missing or malformed `url` parameter, or another malformed request
    /// parameter (bad header-override name, unparseable timeout).
    #[error("{0}")]
    BadTarget(String),

    /// The upstream did not complete within the effective timeout.
    #[error("upstream did not respond within {}s", .0.as_secs())]
    UpstreamTimeout(Duration),

    /// DNS, connect, or TLS failure on the way to the upstream.
    #[error("failed to reach upstream: {0}")]
    UpstreamUnreachable(String),

    /// The upstream produced a malformed response (or an unterminated
    /// redirect chain).
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// The client went away. No response is deliverable.
    #[error("client disconnected")]
    ClientAborted,

    /// Unexpected internal fault.
    #[error("internal error")]
    Internal(String),
}

impl ProxyError {
    /// The HTTP status this fault maps to.
    ///
    /// `ClientAborted` has no meaningful status; the connection is already
    /// gone and any response synthesized for it is never written.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InboundDenied(_) | Self::OutboundDenied(_) => StatusCode::FORBIDDEN,
            Self::BadTarget(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnreachable(_) | Self::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            Self::ClientAborted | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error document sent to the client when a body can still be sent.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
    pub timestamp: String,
}

impl ErrorBody {
    fn new(message: String, status: StatusCode) -> Self {
        Self {
            error: message,
            code: status.as_u16(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ProxyError::Internal(cause) => {
                tracing::error!(error = %cause, "internal proxy error");
            }
            ProxyError::UpstreamUnreachable(_)
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::UpstreamTimeout(_) => {
                tracing::warn!(error = %self, "upstream failure");
            }
            ProxyError::ClientAborted => {
                tracing::debug!("client disconnected before response");
                return status.into_response();
            }
            _ => {
                tracing::debug!(error = %self, "request rejected");
            }
        }
        let body = ErrorBody::new(self.to_string(), status);
        (status, Json(body)).into_response()
    }
}
