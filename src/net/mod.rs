//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → tls.rs (optional TLS handshake, rustls via axum-server)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Inside a mesh the sidecar usually speaks plaintext; TLS is opt-in
//! - Backpressure is a request concurrency limit in the HTTP layer

pub mod tls;
