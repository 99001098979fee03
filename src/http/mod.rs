//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, middleware stack)
//!     → request.rs (request id)
//!     → filter (identity + XSRF headers)
//!     → headers.rs (hop-by-hop, X-Forwarded-*)
//!     → upstream, plain HTTP or websocket.rs
//! ```

pub mod headers;
pub mod request;
pub mod server;
pub mod websocket;

pub use request::X_REQUEST_ID;
pub use server::{AppState, HttpServer, InnerState};
