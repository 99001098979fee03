//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → every subscribed task stops accepting → drain → exit
//! ```
//!
//! # Design Decisions
//! - One broadcast coordinator shared by all long-running tasks
//! - Config reloads come from the file watcher, not SIGHUP

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
