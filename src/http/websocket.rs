//! WebSocket proxying.
//!
//! # Responsibilities
//! - Detect upgrade requests
//! - Open the upstream WebSocket with the client's (already filtered) headers
//! - Complete the client upgrade and pump frames both ways until either side closes
//!
//! # Data Flow
//! ```text
//! Client ──upgrade──▶ filter ──▶ proxy() ──connect_async──▶ Upstream
//!   ▲                                                          │
//!   └───────────────────── pump() ◀──────── frames ────────────┘
//! ```
//!
//! The upstream handshake runs before the client's upgrade completes, so
//! an upstream rejection is reported to the client as a plain HTTP status.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::http::header::{self, HeaderMap};
use axum::http::{Request, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, protocol::CloseFrame};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ProxyError;
use crate::http::headers;
use crate::observability::metrics;
use crate::upstream::Upstream;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake headers the upstream connector generates itself.
const HANDSHAKE_HEADERS: [header::HeaderName; 3] = [
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
];

/// True when the client asks to switch to the WebSocket protocol.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
}

/// Connect to the upstream and hand the client connection to [`pump`].
pub async fn proxy(
    ws: WebSocketUpgrade,
    request: Request<Body>,
    upstream: &Upstream,
    peer: SocketAddr,
    tls: bool,
    timeout: Duration,
) -> Result<Response, ProxyError> {
    let (mut parts, _body) = request.into_parts();
    headers::prepare_forwarded(&mut parts.headers, &parts.uri, peer, tls);

    let uri = upstream.websocket_uri_for(&parts.uri)?;
    let mut upstream_request = uri.clone().into_client_request()?;
    let target = upstream_request.headers_mut();
    for (name, value) in &parts.headers {
        if HANDSHAKE_HEADERS.contains(name) {
            continue;
        }
        if name == header::HOST {
            target.insert(name, value.clone());
        } else {
            target.append(name, value.clone());
        }
    }

    let (socket, response) = match time::timeout(timeout, connect_async(upstream_request)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(tungstenite::Error::Http(rejected))) => {
            tracing::warn!(uri = %uri, status = %rejected.status(), "Upstream rejected WebSocket handshake");
            metrics::record_websocket("rejected");
            return Ok(rejected.status().into_response());
        }
        Ok(Err(e)) => {
            metrics::record_websocket("failed");
            return Err(e.into());
        }
        Err(_) => {
            metrics::record_websocket("failed");
            return Err(ProxyError::Timeout(timeout.as_secs()));
        }
    };

    let protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let ws = match protocol {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    tracing::debug!(uri = %uri, "Upstream WebSocket connected");
    metrics::record_websocket("opened");
    Ok(ws.on_upgrade(move |client| pump(client, socket, uri)))
}

/// Relay messages until one side closes or errors.
async fn pump(client: WebSocket, upstream: UpstreamSocket, uri: Uri) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, ws::Message::Close(_));
            if upstream_tx.send(to_upstream(msg)).await.is_err() || closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = to_client(msg) else {
                continue;
            };
            let closing = matches!(msg, ws::Message::Close(_));
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    metrics::record_websocket("closed");
    tracing::debug!(uri = %uri, "WebSocket session ended");
}

fn to_upstream(msg: ws::Message) -> tungstenite::Message {
    match msg {
        ws::Message::Text(text) => tungstenite::Message::Text(text.as_str().to_owned().into()),
        ws::Message::Binary(data) => tungstenite::Message::Binary(data),
        ws::Message::Ping(data) => tungstenite::Message::Ping(data),
        ws::Message::Pong(data) => tungstenite::Message::Pong(data),
        ws::Message::Close(frame) => tungstenite::Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().to_owned().into(),
        })),
    }
}

fn to_client(msg: tungstenite::Message) -> Option<ws::Message> {
    Some(match msg {
        tungstenite::Message::Text(text) => ws::Message::Text(text.as_str().to_owned().into()),
        tungstenite::Message::Binary(data) => ws::Message::Binary(data),
        tungstenite::Message::Ping(data) => ws::Message::Ping(data),
        tungstenite::Message::Pong(data) => ws::Message::Pong(data),
        tungstenite::Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().to_owned().into(),
        })),
        // Raw frames only surface when reading with a custom codec.
        tungstenite::Message::Frame(_) => return None,
    })
}
