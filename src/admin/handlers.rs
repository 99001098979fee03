use axum::{extract::State, Json};
use serde::Serialize;

use crate::http::AppState;
use crate::upstream::HealthState;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub upstream: String,
    pub upstream_health: HealthState,
    pub requests: u64,
    pub tokens_propagated: u64,
}

#[derive(Debug, Serialize)]
pub struct FilterStatus {
    pub user_id_header: String,
    pub user_id: String,
    pub csrf_cookie: Option<String>,
    pub csrf_header: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamStatus {
    pub address: String,
    pub health: HealthState,
    pub health_checks_enabled: bool,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let inner = state.inner.load();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
        upstream: inner.upstream.authority().to_string(),
        upstream_health: inner.upstream.health(),
        requests: state.filter_stats.requests(),
        tokens_propagated: state.filter_stats.tokens_propagated(),
    })
}

pub async fn get_filter(State(state): State<AppState>) -> Json<FilterStatus> {
    let filter = state.filter.load();

    Json(FilterStatus {
        user_id_header: filter.user_id_header().to_string(),
        user_id: filter.user_id().to_owned(),
        csrf_cookie: filter.csrf_cookie().map(str::to_owned),
        csrf_header: filter.csrf_header().map(ToString::to_string),
    })
}

pub async fn get_upstream(State(state): State<AppState>) -> Json<UpstreamStatus> {
    let inner = state.inner.load();
    let upstream = &inner.upstream;

    Json(UpstreamStatus {
        address: upstream.authority().to_string(),
        health: upstream.health(),
        health_checks_enabled: inner.config.health_check.enabled,
        consecutive_failures: upstream.consecutive_failures(),
        consecutive_successes: upstream.consecutive_successes(),
    })
}
