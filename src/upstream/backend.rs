//! Upstream abstraction.
//!
//! # Responsibilities
//! - Represent the single upstream server behind the sidecar
//! - Build forwarding URIs for HTTP and WebSocket requests
//! - Track health state (Healthy/Unhealthy) with hysteresis

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use axum::http::uri::{Authority, InvalidUri, Uri};
use serde::Serialize;

use crate::config::UpstreamConfig;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// The upstream server requests are forwarded to.
#[derive(Debug)]
pub struct Upstream {
    authority: Authority,
    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
}

impl Upstream {
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, InvalidUri> {
        Ok(Self::new(config.address.parse()?))
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Rewrite `original` to target the upstream over plain HTTP.
    pub fn uri_for(&self, original: &Uri) -> Result<Uri, axum::http::Error> {
        self.uri_with_scheme("http", original)
    }

    /// Rewrite `original` to target the upstream's WebSocket endpoint.
    pub fn websocket_uri_for(&self, original: &Uri) -> Result<Uri, axum::http::Error> {
        self.uri_with_scheme("ws", original)
    }

    fn uri_with_scheme(&self, scheme: &str, original: &Uri) -> Result<Uri, axum::http::Error> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Uri::builder()
            .scheme(scheme)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }

    // --- Health Logic ---

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// Return true if upstream is considered healthy (Healthy or Unknown).
    pub fn is_healthy(&self) -> bool {
        self.health() != HealthState::Unhealthy
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> usize {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    /// Report a successful request/check.
    pub fn mark_success(&self, healthy_threshold: usize) {
        self.consecutive_failures.store(0, Ordering::Relaxed);

        if self.health() == HealthState::Healthy {
            return;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= healthy_threshold {
            self.transition(HealthState::Healthy);
        }
    }

    /// Report a failed request/check.
    pub fn mark_failure(&self, unhealthy_threshold: usize) {
        self.consecutive_successes.store(0, Ordering::Relaxed);

        if self.health() == HealthState::Unhealthy {
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold {
            self.transition(HealthState::Unhealthy);
        }
    }

    fn transition(&self, to: HealthState) {
        let from = HealthState::from(self.state.swap(to as u8, Ordering::Relaxed));
        if from != to {
            tracing::info!(upstream = %self.authority, from = ?from, to = ?to, "Upstream health changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream() -> Upstream {
        Upstream::new("127.0.0.1:8888".parse().unwrap())
    }

    #[test]
    fn rewrites_uri_keeping_path_and_query() {
        let u = upstream();
        let original: Uri = "/notebook/ns/nb/api/contents?type=file".parse().unwrap();

        assert_eq!(
            u.uri_for(&original).unwrap().to_string(),
            "http://127.0.0.1:8888/notebook/ns/nb/api/contents?type=file"
        );
        assert_eq!(
            u.websocket_uri_for(&"/api/kernels/1/channels".parse().unwrap())
                .unwrap()
                .to_string(),
            "ws://127.0.0.1:8888/api/kernels/1/channels"
        );
    }

    #[test]
    fn absolute_form_is_retargeted() {
        let original: Uri = "http://public.example.com/lab".parse().unwrap();
        assert_eq!(
            upstream().uri_for(&original).unwrap().to_string(),
            "http://127.0.0.1:8888/lab"
        );
    }

    #[test]
    fn health_hysteresis() {
        let u = upstream();
        assert_eq!(u.health(), HealthState::Unknown);
        assert!(u.is_healthy());

        u.mark_failure(2);
        assert!(u.is_healthy());
        u.mark_failure(2);
        assert_eq!(u.health(), HealthState::Unhealthy);

        u.mark_success(2);
        assert_eq!(u.health(), HealthState::Unhealthy);
        u.mark_failure(2);
        u.mark_success(2);
        u.mark_success(2);
        assert_eq!(u.health(), HealthState::Healthy);
        assert_eq!(u.consecutive_failures(), 0);
    }

    #[test]
    fn rejects_bad_address() {
        let config = UpstreamConfig {
            address: "not an authority".into(),
        };
        assert!(Upstream::from_config(&config).is_err());
    }
}
