use super::identity::TenantContext;
use super::scope::{bind, bind_sync, current};
use crate::error::{ContextError, GuardError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::error;

/// Pulls the authenticated identity out of a request.
///
/// Implementations must read verified metadata only: token claims, session
/// state, headers set by a trusted proxy. Never the request body.
pub trait IdentityExtractor<Req>: Send + Sync {
    fn extract(&self, req: &Req) -> Result<TenantContext, ContextError>;
}

impl<Req, F> IdentityExtractor<Req> for F
where
    F: Fn(&Req) -> Result<TenantContext, ContextError> + Send + Sync,
{
    fn extract(&self, req: &Req) -> Result<TenantContext, ContextError> {
        self(req)
    }
}

/// Installs the request's [`TenantContext`] around the inner service.
///
/// The context is visible both inside the inner `call` and for the whole
/// lifetime of the returned future, and is removed on every exit path.
#[derive(Debug)]
pub struct TenantContextLayer<X> {
    extractor: Arc<X>,
}

impl<X> Clone for TenantContextLayer<X> {
    fn clone(&self) -> Self {
        Self { extractor: self.extractor.clone() }
    }
}

impl<X> TenantContextLayer<X> {
    pub fn new(extractor: X) -> Self {
        Self { extractor: Arc::new(extractor) }
    }
}

impl<S, X> Layer<S> for TenantContextLayer<X> {
    type Service = TenantContextService<S, X>;

    fn layer(&self, service: S) -> Self::Service {
        TenantContextService { inner: service, extractor: self.extractor.clone() }
    }
}

/// Middleware service produced by [`TenantContextLayer`].
#[derive(Debug)]
pub struct TenantContextService<S, X> {
    inner: S,
    extractor: Arc<X>,
}

impl<S: Clone, X> Clone for TenantContextService<S, X> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), extractor: self.extractor.clone() }
    }
}

impl<S, X, Req> Service<Req> for TenantContextService<S, X>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    S::Response: Send + 'static,
    X: IdentityExtractor<Req>,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        if let Some(active) = current() {
            // The caller is already inside another request's scope.
            error!(target: "tenantguard::tenant", active = %active, "request entered with a tenant context already set");
            let err = ContextError::AlreadyInitialized { tenant_id: active.tenant_id().to_string() };
            return Box::pin(async move { Err(GuardError::Context(err)) });
        }

        let ctx = match self.extractor.extract(&req) {
            Ok(ctx) => ctx,
            Err(err) => return Box::pin(async move { Err(GuardError::Context(err)) }),
        };

        let inner = &mut self.inner;
        let fut = bind_sync(ctx.clone(), move || inner.call(req));
        Box::pin(async move { bind(ctx, fut).await.map_err(GuardError::Inner) })
    }
}
