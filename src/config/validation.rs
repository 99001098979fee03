//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports valid)
//! - Check that the filter settings compile into valid headers
//! - Check TLS material exists before the listener needs it
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use std::path::Path;

use axum::http::uri::Authority;

use crate::config::schema::ProxyConfig;
use crate::filter::{FilterError, HeaderPropagation};

/// A single semantic problem with a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: `{value}` is not a valid socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("upstream.address: `{0}` is not a valid host:port authority")]
    InvalidUpstream(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("retries.budget_ratio must be within [0, 1], got {0}")]
    BudgetRatio(f32),

    #[error("health_check.path must start with '/', got `{0}`")]
    HealthPath(String),

    #[error("filter: {0}")]
    Filter(#[from] FilterError),

    #[error("listener.tls: {0} not found")]
    MissingTlsFile(String),

    #[error("admin.api_key must not be empty when the admin API is enabled")]
    EmptyApiKey,
}

/// Check every semantic constraint, collecting all failures.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_concurrent_requests == 0 {
        errors.push(ValidationError::Zero("listener.max_concurrent_requests"));
    }
    if let Some(tls) = &config.listener.tls {
        for path in [&tls.cert_path, &tls.key_path] {
            if !Path::new(path).exists() {
                errors.push(ValidationError::MissingTlsFile(path.clone()));
            }
        }
    }

    let upstream_ok = config
        .upstream
        .address
        .parse::<Authority>()
        .map(|a| a.port_u16().is_some())
        .unwrap_or(false);
    if !upstream_ok {
        errors.push(ValidationError::InvalidUpstream(config.upstream.address.clone()));
    }

    if let Err(e) = HeaderPropagation::from_config(&config.filter) {
        errors.push(e.into());
    }

    let health = &config.health_check;
    if health.enabled {
        if health.interval_secs == 0 {
            errors.push(ValidationError::Zero("health_check.interval_secs"));
        }
        if health.timeout_secs == 0 {
            errors.push(ValidationError::Zero("health_check.timeout_secs"));
        }
        if health.unhealthy_threshold == 0 {
            errors.push(ValidationError::Zero("health_check.unhealthy_threshold"));
        }
        if health.healthy_threshold == 0 {
            errors.push(ValidationError::Zero("health_check.healthy_threshold"));
        }
        if !health.path.starts_with('/') {
            errors.push(ValidationError::HealthPath(health.path.clone()));
        }
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.connect_secs"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.request_secs"));
    }

    if config.retries.enabled && config.retries.max_attempts == 0 {
        errors.push(ValidationError::Zero("retries.max_attempts"));
    }
    if !(0.0..=1.0).contains(&config.retries.budget_ratio) {
        errors.push(ValidationError::BudgetRatio(config.retries.budget_ratio));
    }

    if config.observability.metrics_enabled {
        check_socket_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if config.admin.enabled {
        check_socket_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::EmptyApiKey);
        }
    }

    if config.security.max_body_size == 0 {
        errors.push(ValidationError::Zero("security.max_body_size"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
