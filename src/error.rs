//! Errors surfaced to clients of the proxy, and errors starting or
//! reconfiguring it.

use axum::http::uri::InvalidUri;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::filter::FilterError;

/// Failure building or (re)configuring the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid filter settings: {0}")]
    Filter(#[from] FilterError),

    #[error("invalid upstream address: {0}")]
    Upstream(#[from] InvalidUri),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure forwarding a request upstream.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream is unhealthy")]
    UpstreamUnavailable,

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not respond within {0}s")]
    Timeout(u64),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("cannot build upstream uri: {0}")]
    Uri(#[from] axum::http::Error),

    #[error("websocket handshake with upstream failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) | ProxyError::WebSocket(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Uri(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = match &self {
            ProxyError::UpstreamUnavailable => "No healthy upstream",
            ProxyError::Upstream(_) | ProxyError::WebSocket(_) => "Upstream request failed",
            ProxyError::Timeout(_) => "Upstream timed out",
            ProxyError::BodyTooLarge(_) => "Request body too large",
            ProxyError::Uri(_) => "Invalid upstream request",
        };
        (self.status(), body).into_response()
    }
}
