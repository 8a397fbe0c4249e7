use super::identity::{ActorId, BranchId, TenantContext, TenantId};
use crate::error::ContextError;
use futures::future::Either;
use std::cell::RefCell;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::error;

// One slot per scoped future (or `sync_scope` call). The `RefCell` lets
// `clear` empty the slot before the scope itself ends.
tokio::task_local! {
    static TASK_CONTEXT: RefCell<Option<TenantContext>>;
}

impl TenantContext {
    /// Run `fut` with this context installed. See [`scope`].
    pub async fn scope<F: Future>(self, fut: F) -> Result<F::Output, ContextError> {
        scope(self, fut).await
    }

    /// Run `f` with this context installed. See [`sync_scope`].
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> Result<R, ContextError> {
        sync_scope(self, f)
    }
}

/// Run `fut` with `ctx` installed as the tenant context of that future.
///
/// The binding belongs to `fut` alone: other tasks polled on the same thread
/// never see it, and it is removed when `fut` completes, errors or is dropped.
/// Fails with [`ContextError::AlreadyInitialized`] inside another scope, so
/// each request sets its identity exactly once.
pub async fn scope<F: Future>(ctx: TenantContext, fut: F) -> Result<F::Output, ContextError> {
    ensure_vacant()?;
    Ok(bind(ctx, fut).await)
}

/// Synchronous counterpart of [`scope`], for code that never awaits.
///
/// The binding is removed when `f` returns or unwinds.
pub fn sync_scope<R>(ctx: TenantContext, f: impl FnOnce() -> R) -> Result<R, ContextError> {
    ensure_vacant()?;
    Ok(bind_sync(ctx, f))
}

/// Unchecked binding for crate internals that own the request boundary.
pub(crate) fn bind<F: Future>(ctx: TenantContext, fut: F) -> impl Future<Output = F::Output> {
    TASK_CONTEXT.scope(RefCell::new(Some(ctx)), fut)
}

pub(crate) fn bind_sync<R>(ctx: TenantContext, f: impl FnOnce() -> R) -> R {
    TASK_CONTEXT.sync_scope(RefCell::new(Some(ctx)), f)
}

/// Carry the caller's context into `fut`.
///
/// The context is captured now, not when `fut` is first polled. Without an
/// active context the future is returned unchanged.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    match current() {
        Some(ctx) => Either::Left(bind(ctx, fut)),
        None => Either::Right(fut),
    }
}

/// `tokio::spawn` that carries the caller's context into the new task.
pub fn spawn_scoped<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(propagate(fut))
}

fn with_current<R>(f: impl FnOnce(&TenantContext) -> R) -> Option<R> {
    TASK_CONTEXT
        .try_with(|slot| slot.try_borrow().ok().and_then(|ctx| ctx.as_ref().map(f)))
        .ok()
        .flatten()
}

fn ensure_vacant() -> Result<(), ContextError> {
    match with_current(|active| active.tenant_id().to_string()) {
        Some(tenant_id) => {
            error!(target: "tenantguard::tenant", tenant_id = %tenant_id, "tenant context installed twice in one request");
            Err(ContextError::AlreadyInitialized { tenant_id })
        }
        None => Ok(()),
    }
}

fn not_initialized() -> ContextError {
    error!(target: "tenantguard::tenant", "tenant-scoped access outside of a request context");
    ContextError::NotInitialized
}

/// The context of the enclosing scope, if any.
pub fn current() -> Option<TenantContext> {
    with_current(TenantContext::clone)
}

pub fn tenant_id() -> Option<TenantId> {
    with_current(|ctx| ctx.tenant_id().clone())
}

pub fn branch_id() -> Option<BranchId> {
    with_current(|ctx| ctx.branch_id().clone())
}

pub fn actor() -> Option<ActorId> {
    with_current(|ctx| ctx.actor().cloned()).flatten()
}

/// Like [`current`], but a missing context is an error (and is logged).
pub fn require_current() -> Result<TenantContext, ContextError> {
    current().ok_or_else(not_initialized)
}

pub fn require_tenant_id() -> Result<TenantId, ContextError> {
    tenant_id().ok_or_else(not_initialized)
}

pub fn require_branch_id() -> Result<BranchId, ContextError> {
    branch_id().ok_or_else(not_initialized)
}

/// Remove the enclosing scope's tenant and branch for the rest of that scope.
///
/// Only the calling scope is affected; other requests keep their own values.
/// Outside any scope this does nothing. Never fails.
pub fn clear() {
    let _ = TASK_CONTEXT.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            slot.take();
        }
    });
}
