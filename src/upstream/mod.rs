//! Upstream subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (health.rs):
//!     Periodic timer
//!     → Probe the upstream
//!     → Update backend.rs state
//!
//! Passive health checks (http/server.rs):
//!     Connection failure observed
//!     → Increment failure count
//!     → Update backend.rs state if threshold exceeded
//!
//! State machine (backend.rs):
//!     Healthy ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - One upstream per sidecar; no load balancing
//! - Unknown counts as healthy so traffic flows before the first probe
//! - Fail fast on Unhealthy only when active checks can bring it back

pub mod backend;
pub mod health;

pub use backend::{HealthState, Upstream};
pub use health::HealthMonitor;
