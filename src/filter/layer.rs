//! Tower middleware applying [`HeaderPropagation`] to every request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use axum::http::Request;
use tower::{Layer, Service};

use crate::filter::HeaderPropagation;
use crate::observability::metrics;

/// Live filter settings, swapped on configuration reload.
pub type SharedPropagation = Arc<ArcSwap<HeaderPropagation>>;

/// Request counters kept by the filter.
#[derive(Debug, Default)]
pub struct FilterStats {
    requests: AtomicU64,
    tokens_propagated: AtomicU64,
}

impl FilterStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn tokens_propagated(&self) -> u64 {
        self.tokens_propagated.load(Ordering::Relaxed)
    }
}

/// Layer that wraps services in [`PropagateHeaders`].
#[derive(Debug, Clone)]
pub struct PropagationLayer {
    filter: SharedPropagation,
    stats: Arc<FilterStats>,
}

impl PropagationLayer {
    pub fn new(filter: SharedPropagation) -> Self {
        Self {
            filter,
            stats: Arc::new(FilterStats::default()),
        }
    }

    /// A layer whose settings never change.
    pub fn fixed(filter: HeaderPropagation) -> Self {
        Self::new(Arc::new(ArcSwap::from_pointee(filter)))
    }

    /// Handle for swapping the settings this layer applies.
    pub fn shared(&self) -> SharedPropagation {
        self.filter.clone()
    }

    pub fn stats(&self) -> Arc<FilterStats> {
        self.stats.clone()
    }
}

impl<S> Layer<S> for PropagationLayer {
    type Service = PropagateHeaders<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PropagateHeaders {
            inner,
            filter: self.filter.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// Rewrites request headers, then always calls the inner service.
#[derive(Debug, Clone)]
pub struct PropagateHeaders<S> {
    inner: S,
    filter: SharedPropagation,
    stats: Arc<FilterStats>,
}

impl<S, B> Service<Request<B>> for PropagateHeaders<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let outcome = self.filter.load().apply(req.headers_mut());

        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        if outcome.token_propagated {
            self.stats.tokens_propagated.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_filter(outcome.token_propagated);

        tracing::trace!(
            path = %req.uri().path(),
            token_propagated = outcome.token_propagated,
            "Propagated request headers"
        );

        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;

    use axum::http::HeaderMap;
    use tower::{service_fn, ServiceExt};

    async fn echo(req: Request<()>) -> Result<HeaderMap, Infallible> {
        Ok(req.headers().clone())
    }

    #[tokio::test]
    async fn rewrites_before_inner_service() {
        let layer = PropagationLayer::fixed(HeaderPropagation::with_user_id("a@b.c").unwrap());
        let stats = layer.stats();
        let svc = layer.layer(service_fn(echo));

        let req = Request::builder()
            .header("cookie", "x=1; _xsrf=tok")
            .body(())
            .unwrap();
        let seen = svc.oneshot(req).await.unwrap();

        assert_eq!(seen["kubeflow-userid"], "a@b.c");
        assert_eq!(seen["x-xsrftoken"], "tok");
        assert_eq!(stats.requests(), 1);
        assert_eq!(stats.tokens_propagated(), 1);
    }

    #[tokio::test]
    async fn swapped_settings_apply_to_next_request() {
        let shared: SharedPropagation = Arc::new(ArcSwap::from_pointee(
            HeaderPropagation::with_user_id("old@example.com").unwrap(),
        ));
        let layer = PropagationLayer::new(shared.clone());
        let stats = layer.stats();

        let req = || Request::builder().body(()).unwrap();

        let seen = layer.layer(service_fn(echo)).oneshot(req()).await.unwrap();
        assert_eq!(seen["kubeflow-userid"], "old@example.com");

        shared.store(Arc::new(
            HeaderPropagation::with_user_id("new@example.com").unwrap(),
        ));

        let seen = layer.layer(service_fn(echo)).oneshot(req()).await.unwrap();
        assert_eq!(seen["kubeflow-userid"], "new@example.com");
        assert_eq!(stats.requests(), 2);
        assert_eq!(stats.tokens_propagated(), 0);
    }
}
