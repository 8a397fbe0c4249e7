//! Audit trail around handler invocations.
//!
//! [`AuditLayer`] wraps a service and records one [`AuditRecord`] when a call
//! starts and another when it finishes, each tagged with the action name and
//! the tenant, branch and actor of the active request. [`audited`] does the
//! same for a plain future.
//!
//! Sink failures are logged and swallowed: auditing never changes the outcome
//! of the wrapped call.

use crate::tenant::{self, ActorId, BranchId, TenantContext, TenantId};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{info, warn};

/// Which point of the call an [`AuditRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditPhase {
    Started,
    Succeeded,
    Failed,
}

impl fmt::Display for AuditPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuditPhase::Started => "started",
            AuditPhase::Succeeded => "succeeded",
            AuditPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One audit trail entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Action name, e.g. `prescription.create`.
    pub action: String,
    pub phase: AuditPhase,
    pub tenant_id: Option<TenantId>,
    pub branch_id: Option<BranchId>,
    pub actor: Option<ActorId>,
    /// Run time; absent on `Started`.
    pub elapsed: Option<Duration>,
    /// Error text; present on `Failed` only.
    pub error: Option<String>,
}

impl AuditRecord {
    fn new(action: &str, phase: AuditPhase, ctx: Option<&TenantContext>) -> Self {
        Self {
            action: action.to_owned(),
            phase,
            tenant_id: ctx.map(|c| c.tenant_id().clone()),
            branch_id: ctx.map(|c| c.branch_id().clone()),
            actor: ctx.and_then(|c| c.actor().cloned()),
            elapsed: None,
            error: None,
        }
    }
}

/// Audit recording failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("audit sink failed: {0}")]
pub struct AuditError(pub String);

/// Audit sink interface.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Audit sink that logs via tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        fn show<T: fmt::Display>(value: &Option<T>) -> String {
            value.as_ref().map_or_else(|| "-".to_owned(), ToString::to_string)
        }
        info!(
            target: "tenantguard::audit",
            action = %record.action,
            phase = %record.phase,
            tenant_id = %show(&record.tenant_id),
            branch_id = %show(&record.branch_id),
            actor = %show(&record.actor),
            elapsed = ?record.elapsed,
            error = record.error.as_deref().unwrap_or(""),
            "audit"
        );
        Ok(())
    }
}

/// In-memory audit sink keeping the most recent `capacity` records.
#[derive(Debug, Clone)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<VecDeque<AuditRecord>>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self { records: Arc::new(Mutex::new(VecDeque::new())), capacity: capacity.max(1) }
    }

    /// Retrieve recorded audit records, oldest first.
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.iter().cloned().collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut guard = self.records.lock().await;
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(record);
        Ok(())
    }
}

async fn record_best_effort(sink: &dyn AuditSink, record: AuditRecord) {
    let action = record.action.clone();
    if let Err(err) = sink.record(record).await {
        warn!(target: "tenantguard::audit", action = %action, error = %err, "audit record dropped");
    }
}

/// Run `fut` between a `Started` and a `Succeeded`/`Failed` record.
///
/// The tenant context is read once, when this function is called.
pub async fn audited<T, E, F>(action: &str, sink: &dyn AuditSink, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let ctx = tenant::current();
    run_audited(action, sink, ctx, fut).await
}

async fn run_audited<T, E, F>(
    action: &str,
    sink: &dyn AuditSink,
    ctx: Option<TenantContext>,
    fut: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    record_best_effort(sink, AuditRecord::new(action, AuditPhase::Started, ctx.as_ref())).await;
    let start = Instant::now();
    let result = fut.await;
    let mut done = match &result {
        Ok(_) => AuditRecord::new(action, AuditPhase::Succeeded, ctx.as_ref()),
        Err(err) => {
            let mut record = AuditRecord::new(action, AuditPhase::Failed, ctx.as_ref());
            record.error = Some(err.to_string());
            record
        }
    };
    done.elapsed = Some(start.elapsed());
    record_best_effort(sink, done).await;
    result
}

/// Wraps a service with audit records for `action`.
#[derive(Clone)]
pub struct AuditLayer {
    action: Arc<str>,
    sink: Arc<dyn AuditSink>,
}

impl fmt::Debug for AuditLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLayer").field("action", &self.action).finish_non_exhaustive()
    }
}

impl AuditLayer {
    pub fn new(action: impl Into<Arc<str>>, sink: Arc<dyn AuditSink>) -> Self {
        Self { action: action.into(), sink }
    }
}

impl<S> Layer<S> for AuditLayer {
    type Service = AuditService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AuditService { inner: service, action: self.action.clone(), sink: self.sink.clone() }
    }
}

/// Middleware service produced by [`AuditLayer`].
#[derive(Clone)]
pub struct AuditService<S> {
    inner: S,
    action: Arc<str>,
    sink: Arc<dyn AuditSink>,
}

impl<S> fmt::Debug for AuditService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditService").field("action", &self.action).finish_non_exhaustive()
    }
}

impl<S, Req> Service<Req> for AuditService<S>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let ctx = tenant::current();
        let fut = self.inner.call(req);
        let action = self.action.clone();
        let sink = self.sink.clone();
        Box::pin(async move { run_audited(&action, sink.as_ref(), ctx, fut).await })
    }
}
