use crate::error::GuardError;
use crate::rate_limit::{BucketKey, Decision, RateLimiter};
use crate::tenant;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

/// A layer that admits requests for one feature through a [`RateLimiter`].
///
/// The bucket key is built from the request's active tenant context, so this
/// layer must sit inside a [`TenantContextLayer`](crate::tenant::TenantContextLayer).
#[derive(Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    feature: Arc<str>,
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), feature: self.feature.clone() }
    }
}

impl<L> RateLimitLayer<L> {
    /// Create a new rate limit layer for `feature`.
    pub fn new(limiter: Arc<L>, feature: impl Into<Arc<str>>) -> Self {
        Self { limiter, feature: feature.into() }
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            feature: self.feature.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    feature: Arc<str>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: self.limiter.clone(), feature: self.feature.clone() }
    }
}

impl<S, L, Req> Service<Req> for RateLimitService<S, L>
where
    S: Service<Req>,
    L: RateLimiter + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = RateLimitFuture<S::Future, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let ctx = match tenant::require_current() {
            Ok(ctx) => ctx,
            Err(err) => return RateLimitFuture::rejected(GuardError::Context(err)),
        };
        let key = BucketKey::new(ctx.tenant_id().clone(), ctx.branch_id().clone(), self.feature.clone());

        match self.limiter.try_acquire_key(&key) {
            Decision::Allowed { .. } => RateLimitFuture::Admitted { inner: self.inner.call(req) },
            Decision::Denied { retry_after } => {
                debug!(target: "tenantguard::rate_limit", key = %key, ?retry_after, "request rate limited");
                RateLimitFuture::rejected(GuardError::RateLimited {
                    feature: self.feature.to_string(),
                    retry_after,
                })
            }
        }
    }
}

/// Response future for [`RateLimitService`].
#[pin_project(project = RateLimitFutureProj)]
#[derive(Debug)]
pub enum RateLimitFuture<F, E> {
    /// Admitted; driving the inner service.
    Admitted {
        #[pin]
        inner: F,
    },
    /// Rejected before reaching the inner service.
    Rejected { error: Option<GuardError<E>> },
}

impl<F, E> RateLimitFuture<F, E> {
    fn rejected(error: GuardError<E>) -> Self {
        RateLimitFuture::Rejected { error: Some(error) }
    }
}

impl<F, T, E> Future for RateLimitFuture<F, E>
where
    F: Future<Output = Result<T, E>>,
{
    type Output = Result<T, GuardError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            RateLimitFutureProj::Admitted { inner } => inner.poll(cx).map_err(GuardError::Inner),
            RateLimitFutureProj::Rejected { error } => {
                Poll::Ready(Err(error.take().expect("RateLimitFuture polled after completion")))
            }
        }
    }
}
