//! Gateway-wide error type. Library-level failure modes use this typed enum
//! (mirroring `tether_protocol::framing::FramingError`'s one-variant-per-
//! failure-mode shape); application plumbing (command spawns, file I/O)
//! uses `anyhow::Result` with `.context(...)` instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bad parameter: {0}")]
    BadParam(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed")]
    PeerClosed,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),
}

impl GatewayError {
    /// The WebSocket close code this error maps to, per spec §7.
    pub fn close_code(&self) -> u16 {
        match self {
            GatewayError::BadParam(_) => 4003,
            GatewayError::NotFound(_) => 1000,
            GatewayError::InvalidState(_) => 4003,
            GatewayError::Timeout(_) => 4010,
            GatewayError::Upstream(_) => 4011,
            GatewayError::Io(_) => 4011,
            GatewayError::PeerClosed => 1000,
            GatewayError::ProtocolViolation(_) => 4003,
            GatewayError::CapacityExhausted(_) => 4005,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadParam(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidState(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::PeerClosed => StatusCode::OK,
            GatewayError::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            GatewayError::CapacityExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({ "success": false, "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_match_spec_table() {
        assert_eq!(GatewayError::BadParam("x".into()).close_code(), 4003);
        assert_eq!(GatewayError::Timeout("x".into()).close_code(), 4010);
        assert_eq!(GatewayError::Upstream("x".into()).close_code(), 4011);
        assert_eq!(
            GatewayError::CapacityExhausted("x".into()).close_code(),
            4005
        );
        assert_eq!(GatewayError::PeerClosed.close_code(), 1000);
    }
}
