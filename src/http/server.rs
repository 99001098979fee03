//! HTTP server setup and request forwarding.
//!
//! # Responsibilities
//! - Build the Axum router and the middleware stack around it
//! - Forward every request to the single upstream (HTTP and WebSocket)
//! - Retry idempotent requests on transient upstream failures
//! - Apply configuration updates while serving
//! - Terminate TLS when configured
//!
//! # Data Flow
//! ```text
//! Client
//!   → TraceLayer / request id
//!   → ConcurrencyLimit → RequestBodyLimit
//!   → PropagationLayer (identity + XSRF headers)
//!   → proxy_handler ──▶ forward() ──▶ Upstream
//!                   └──▶ websocket::proxy() ──▶ Upstream
//! ```
//!
//! # Design Decisions
//! - Request bodies are buffered only when the request may be retried
//! - The request timeout covers each attempt up to the response head
//! - Fail fast with 503 only when active health checks are on; otherwise
//!   the upstream is always tried

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{Request, Version},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ServerError};
use crate::filter::{FilterStats, HeaderPropagation, PropagationLayer, SharedPropagation};
use crate::http::headers;
use crate::http::request::{request_id, MakeRequestUuid};
use crate::http::websocket;
use crate::lifecycle::{shutdown, Shutdown};
use crate::net::tls::load_tls_config;
use crate::observability::metrics;
use crate::resilience::{calculate_backoff, is_retryable, RetryBudget};
use crate::upstream::{HealthMonitor, Upstream};

/// Requests the retry budget always allows retries for.
const MIN_RETRIES: u64 = 100;

/// How long in-flight TLS connections get to finish on shutdown.
const TLS_DRAIN: Duration = Duration::from_secs(30);

/// Settings and upstream that change together on reload.
#[derive(Debug)]
pub struct InnerState {
    pub config: ProxyConfig,
    pub upstream: Arc<Upstream>,
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<ArcSwap<InnerState>>,
    pub filter: SharedPropagation,
    pub filter_stats: Arc<FilterStats>,
    pub client: Client<HttpConnector, Body>,
    pub retry_budget: Arc<RetryBudget>,
    pub started: Instant,
}

impl AppState {
    /// Swap in a new configuration.
    ///
    /// The filter is rebuilt first; if it does not compile nothing changes.
    /// The upstream (and its health history) is kept when its address is
    /// unchanged.
    pub fn apply_config(&self, config: ProxyConfig) -> Result<(), ServerError> {
        let filter = HeaderPropagation::from_config(&config.filter)?;
        let current = self.inner.load_full();

        let upstream = if config.upstream == current.config.upstream {
            current.upstream.clone()
        } else {
            Arc::new(Upstream::from_config(&config.upstream)?)
        };

        if config.listener != current.config.listener
            || config.security != current.config.security
            || config.timeouts.connect_secs != current.config.timeouts.connect_secs
            || config.retries.budget_ratio != current.config.retries.budget_ratio
        {
            tracing::warn!("Listener, security, connect timeout and retry budget changes apply after restart");
        }

        tracing::info!(
            upstream = %upstream.authority(),
            user_id_header = %filter.user_id_header(),
            csrf_enabled = filter.csrf_cookie().is_some(),
            "Configuration applied"
        );

        self.filter.store(Arc::new(filter));
        self.inner.store(Arc::new(InnerState { config, upstream }));
        Ok(())
    }
}

/// HTTP server for the header-propagating proxy.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let filter = HeaderPropagation::from_config(&config.filter)?;
        let upstream = Arc::new(Upstream::from_config(&config.upstream)?);

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.timeouts.connect_secs)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let propagation = PropagationLayer::new(Arc::new(ArcSwap::from_pointee(filter)));

        let state = AppState {
            inner: Arc::new(ArcSwap::from_pointee(InnerState {
                config: config.clone(),
                upstream,
            })),
            filter: propagation.shared(),
            filter_stats: propagation.stats(),
            client,
            retry_budget: Arc::new(RetryBudget::new(config.retries.budget_ratio, MIN_RETRIES)),
            started: Instant::now(),
        };

        let router = Self::build_router(&config, state.clone(), propagation);
        Ok(Self { router, state })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState, propagation: PropagationLayer) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id(request),
                )
            }))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(GlobalConcurrencyLimitLayer::new(config.listener.max_concurrent_requests))
            .layer(RequestBodyLimitLayer::new(config.security.max_body_size))
            .layer(propagation);

        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(middleware)
    }

    /// Shared state, for the admin API.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> ProxyConfig {
        self.state.inner.load().config.clone()
    }

    /// Serve on `listener` until `shutdown` fires.
    ///
    /// Configurations received on `config_updates` are applied while
    /// serving; the channel closing only stops reloads.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let tls = self.state.inner.load().config.listener.tls.clone();

        tracing::info!(
            address = %addr,
            upstream = %self.state.inner.load().upstream.authority(),
            tls = tls.is_some(),
            "HTTP server starting"
        );

        let (stop_supervisor, supervisor_stop) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(self.state.clone(), config_updates, supervisor_stop));

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        let served = match tls {
            None => axum::serve(listener, app)
                .with_graceful_shutdown(shutdown::wait(shutdown))
                .await,
            Some(tls) => {
                let rustls = load_tls_config(&tls).await?;
                let handle = axum_server::Handle::new();

                let drain = handle.clone();
                tokio::spawn(async move {
                    shutdown::wait(shutdown).await;
                    drain.graceful_shutdown(Some(TLS_DRAIN));
                });

                axum_server::from_tcp_rustls(listener.into_std()?, rustls)
                    .handle(handle)
                    .serve(app)
                    .await
            }
        };

        let _ = stop_supervisor.send(());
        let _ = supervisor.await;

        served?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Apply configuration updates and keep the health monitor in step.
async fn supervise(
    state: AppState,
    mut updates: mpsc::UnboundedReceiver<ProxyConfig>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut monitor = spawn_monitor(&state.inner.load());
    let mut updates_open = true;

    loop {
        tokio::select! {
            update = updates.recv(), if updates_open => match update {
                Some(config) => {
                    let previous = state.inner.load_full();
                    match state.apply_config(config) {
                        Ok(()) => {
                            let current = state.inner.load_full();
                            if !Arc::ptr_eq(&current.upstream, &previous.upstream)
                                || current.config.health_check != previous.config.health_check
                            {
                                monitor.trigger();
                                monitor = spawn_monitor(&current);
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Rejected configuration update, keeping current settings");
                        }
                    }
                }
                None => {
                    tracing::debug!("Configuration update channel closed");
                    updates_open = false;
                }
            },
            _ = &mut stop => break,
        }
    }

    monitor.trigger();
}

/// Start a health monitor for the current upstream; trigger the returned
/// handle to stop it.
fn spawn_monitor(inner: &InnerState) -> Shutdown {
    let stop = Shutdown::new();
    if inner.config.health_check.enabled {
        let monitor = HealthMonitor::new(inner.upstream.clone(), inner.config.health_check.clone());
        tokio::spawn(monitor.run(stop.subscribe()));
    }
    stop
}

/// Main proxy handler.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let request_id = request_id(&request).to_owned();

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %request.uri().path(),
        "Proxying request"
    );

    let result = if websocket::is_upgrade_request(request.headers()) {
        match ws {
            Ok(ws) => proxy_websocket(&state, ws, request, peer).await,
            Err(rejection) => Ok(rejection.into_response()),
        }
    } else {
        forward(&state, request, peer).await
    };

    let response = result.unwrap_or_else(|e| {
        tracing::warn!(request_id = %request_id, error = %e, "Proxy request failed");
        e.into_response()
    });

    metrics::record_request(method.as_str(), response.status().as_u16(), start);
    response
}

/// Current settings, or 503 when health checks mark the upstream down.
fn available_upstream(state: &AppState) -> Result<Arc<InnerState>, ProxyError> {
    let inner = state.inner.load_full();
    if inner.config.health_check.enabled && !inner.upstream.is_healthy() {
        return Err(ProxyError::UpstreamUnavailable);
    }
    Ok(inner)
}

async fn proxy_websocket(
    state: &AppState,
    ws: WebSocketUpgrade,
    request: Request<Body>,
    peer: SocketAddr,
) -> Result<Response, ProxyError> {
    let inner = available_upstream(state)?;
    websocket::proxy(
        ws,
        request,
        &inner.upstream,
        peer,
        inner.config.listener.tls.is_some(),
        Duration::from_secs(inner.config.timeouts.request_secs),
    )
    .await
}

/// Request body as sent on each attempt.
enum Payload {
    Buffered(Bytes),
    Streaming(Option<Body>),
}

impl Payload {
    fn take(&mut self) -> Body {
        match self {
            Payload::Buffered(bytes) => Body::from(bytes.clone()),
            Payload::Streaming(body) => body.take().unwrap_or_else(Body::empty),
        }
    }
}

/// Forward a plain HTTP request, retrying where allowed.
async fn forward(state: &AppState, request: Request<Body>, peer: SocketAddr) -> Result<Response, ProxyError> {
    let inner = available_upstream(state)?;
    let config = &inner.config;
    let upstream = &inner.upstream;
    let request_id = request_id(&request).to_owned();

    let (mut parts, body) = request.into_parts();
    headers::prepare_forwarded(&mut parts.headers, &parts.uri, peer, config.listener.tls.is_some());
    let uri = upstream.uri_for(&parts.uri)?;

    let retriable = config.retries.enabled && config.retries.max_attempts > 1 && parts.method.is_idempotent();
    let mut payload = if retriable {
        let limit = config.security.max_body_size;
        let bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
            tracing::debug!(request_id = %request_id, error = %e, "Failed to buffer request body");
            ProxyError::BodyTooLarge(limit)
        })?;
        Payload::Buffered(bytes)
    } else {
        Payload::Streaming(Some(body))
    };
    let max_attempts = if retriable { config.retries.max_attempts } else { 1 };

    let timeout = Duration::from_secs(config.timeouts.request_secs);
    let healthy_threshold = config.health_check.healthy_threshold as usize;
    let unhealthy_threshold = config.health_check.unhealthy_threshold as usize;

    state.retry_budget.record_request();

    let mut attempt = 0;
    loop {
        attempt += 1;

        let mut req = Request::new(payload.take());
        *req.method_mut() = parts.method.clone();
        *req.uri_mut() = uri.clone();
        *req.version_mut() = Version::HTTP_11;
        *req.headers_mut() = parts.headers.clone();

        let outcome = match tokio::time::timeout(timeout, state.client.request(req)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(request_id = %request_id, attempt, "Upstream request timed out");
                return Err(ProxyError::Timeout(config.timeouts.request_secs));
            }
        };

        match outcome {
            Ok(response) => {
                upstream.mark_success(healthy_threshold);
                let status = response.status();

                if attempt < max_attempts
                    && is_retryable(&parts.method, Some(status), false)
                    && state.retry_budget.can_retry()
                {
                    let delay = calculate_backoff(attempt, config.retries.base_delay_ms, config.retries.max_delay_ms);
                    tracing::info!(request_id = %request_id, attempt, delay = ?delay, status = %status, "Retrying request");
                    metrics::record_retry("status");
                    tokio::time::sleep(delay).await;
                    continue;
                }

                let (mut head, body) = response.into_parts();
                headers::strip_hop_by_hop(&mut head.headers);
                return Ok(Response::from_parts(head, Body::new(body)));
            }
            Err(e) => {
                let connect_error = e.is_connect();
                tracing::error!(request_id = %request_id, attempt, error = %e, "Upstream error");
                if connect_error {
                    upstream.mark_failure(unhealthy_threshold);
                }

                if attempt < max_attempts
                    && is_retryable(&parts.method, None, connect_error)
                    && state.retry_budget.can_retry()
                {
                    let delay = calculate_backoff(attempt, config.retries.base_delay_ms, config.retries.max_delay_ms);
                    tracing::info!(request_id = %request_id, attempt, delay = ?delay, "Retrying after network error");
                    metrics::record_retry("connect");
                    tokio::time::sleep(delay).await;
                    continue;
                }

                return Err(e.into());
            }
        }
    }
}
