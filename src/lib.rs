//! Identity and XSRF header propagation proxy for Kubeflow notebook servers.

pub mod admin;
pub mod config;
pub mod error;
pub mod filter;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod upstream;

pub use config::schema::ProxyConfig;
pub use filter::HeaderPropagation;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
