//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe the upstream
//! - Update upstream health state based on results

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, Uri};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::observability::metrics;
use crate::upstream::Upstream;

pub struct HealthMonitor {
    upstream: Arc<Upstream>,
    config: HealthCheckConfig,
    client: Client<HttpConnector, Body>,
}

impl HealthMonitor {
    pub fn new(upstream: Arc<Upstream>, config: HealthCheckConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            upstream,
            config,
            client,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            upstream = %self.upstream.authority(),
            interval = self.config.interval_secs,
            path = %self.config.path,
            "Health monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe once and record the result.
    pub async fn check(&self) {
        let healthy = self.probe().await;

        if healthy {
            self.upstream.mark_success(self.config.healthy_threshold as usize);
        } else {
            self.upstream.mark_failure(self.config.unhealthy_threshold as usize);
        }

        metrics::record_upstream_health(
            &self.upstream.authority().to_string(),
            self.upstream.is_healthy(),
        );
    }

    async fn probe(&self) -> bool {
        let addr = self.upstream.authority();

        let uri = match self.config.path.parse::<Uri>() {
            Ok(path) => self.upstream.uri_for(&path),
            Err(e) => {
                tracing::error!(path = %self.config.path, error = %e, "Invalid health check path");
                return false;
            }
        };
        let uri = match uri {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(path = %self.config.path, error = %e, "Failed to build health check URI");
                return false;
            }
        };

        let request = match Request::get(uri)
            .header(header::USER_AGENT, "kf-header-proxy-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build health check request");
                return false;
            }
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let success = response.status().is_success();
                if !success {
                    tracing::warn!(addr = %addr, status = %response.status(), "Health check failed: non-success status");
                }
                success
            }
            Ok(Err(e)) => {
                tracing::warn!(addr = %addr, error = %e, "Health check failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(addr = %addr, "Health check failed: timeout");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::HealthState;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn serve_status() -> std::net::SocketAddr {
        let app = Router::new().route("/api/status", get(|| async { "ok" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            timeout_secs: 1,
            path: "/api/status".into(),
            unhealthy_threshold: 1,
            healthy_threshold: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn recovers_unhealthy_upstream_after_threshold() {
        let addr = serve_status().await;
        let upstream = Arc::new(Upstream::new(addr.to_string().parse().unwrap()));
        upstream.mark_failure(1);
        assert_eq!(upstream.health(), HealthState::Unhealthy);

        let monitor = HealthMonitor::new(upstream.clone(), config());

        monitor.check().await;
        assert_eq!(upstream.health(), HealthState::Unhealthy);
        assert_eq!(upstream.consecutive_successes(), 1);

        monitor.check().await;
        assert_eq!(upstream.health(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn missing_path_marks_unhealthy() {
        let addr = serve_status().await;
        let upstream = Arc::new(Upstream::new(addr.to_string().parse().unwrap()));
        let monitor = HealthMonitor::new(
            upstream.clone(),
            HealthCheckConfig {
                path: "/missing".into(),
                ..config()
            },
        );

        monitor.check().await;
        assert_eq!(upstream.health(), HealthState::Unhealthy);
    }
}
