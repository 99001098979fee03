//! Header propagation filter.
//!
//! # Data Flow
//! ```text
//! Inbound request headers
//!     → propagation.rs (set identity header, overwrite)
//!     → cookie.rs (look up the CSRF cookie)
//!     → propagation.rs (copy cookie value into the token header)
//!     → layer.rs forwards to the inner service, unconditionally
//! ```
//!
//! # Design Decisions
//! - Stateless per request; no locking on the request path
//! - Settings compiled once, swapped atomically on reload
//! - Never rejects: "no match" and "no cookie" are the same outcome

pub mod cookie;
pub mod layer;
pub mod propagation;

pub use layer::{FilterStats, PropagateHeaders, PropagationLayer, SharedPropagation};
pub use propagation::{FilterError, HeaderPropagation, Propagated};
