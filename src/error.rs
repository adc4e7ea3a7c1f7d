//! Request-path error taxonomy and HTTP mapping
//!
//! Client-visible responses carry a generic JSON body and never leak
//! upstream URLs, file paths, or internal error chains. Full detail is
//! emitted through `tracing` and the audit trail.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures that can occur while servicing a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed caller input (bad IP literal, bad query parameter, ...)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Credential rejected by the auth gate
    #[error("authentication failed")]
    Unauthorized,

    /// Admission limiter rejected the request; retry after the given seconds
    #[error("rate limited for {0}s")]
    RateLimited(u64),

    /// No route prefix matched the request path
    #[error("no matching route")]
    NoRoute,

    /// Declared or streamed body exceeded the configured cap
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(u64),

    /// Upstream DNS or connect failure
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    /// Upstream did not answer within the request deadline
    #[error("upstream timed out after {0}s")]
    UpstreamTimeout(u64),

    /// Anything else; the detail stays server-side
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Status code this error maps to on the proxy surface.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NoRoute => StatusCode::NOT_FOUND,
            Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing reason. Validation failures name the bad input;
    /// everything else is deliberately coarse.
    fn public_reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid request",
            Self::Unauthorized => "invalid credentials",
            Self::RateLimited(_) => "rate limit exceeded",
            Self::NoRoute => "no matching route found",
            Self::BodyTooLarge(_) => "request body too large",
            Self::UpstreamConnect(_) => "bad gateway",
            Self::UpstreamTimeout(_) => "gateway timeout",
            Self::Internal(_) => "internal server error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let reason = match &self {
            // Caller input problems carry their minimal reason
            Self::Validation(msg) => msg.clone(),
            _ => self.public_reason().to_string(),
        };
        let mut response = (status, Json(json!({ "error": reason }))).into_response();

        if let Self::RateLimited(secs) = &self {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        if let Self::BodyTooLarge(max) = &self {
            if let Ok(v) = HeaderValue::from_str(&max.to_string()) {
                response.headers_mut().insert("x-max-body-bytes", v);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::NoRoute.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyError::RateLimited(30).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::UpstreamTimeout(30).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::UpstreamConnect("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::BodyTooLarge(1024).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_public_reason_hides_detail() {
        let err = ProxyError::UpstreamConnect("10.1.2.3:8080 refused".into());
        assert!(!err.public_reason().contains("10.1.2.3"));
    }
}
