use super::{BucketKey, Decision, RateLimiter};
use crate::error::ContextError;
use crate::telemetry::{emit_best_effort, GuardEvent, NullSink, RateLimitEvent, TelemetrySink};
use crate::tenant::{self, TenantContext};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Message shown to end users when a guarded feature is saturated.
pub const BUSY_MESSAGE: &str = "The system is busy, please try again shortly.";

/// Outcome of a gated call.
#[derive(Debug, Clone, PartialEq)]
pub enum Gated<T> {
    /// The operation ran and produced a value.
    Done(T),
    /// The bucket was empty; the operation was not started.
    Busy {
        /// Time until the next whole token.
        retry_after: Duration,
    },
}

impl<T> Gated<T> {
    pub fn is_busy(&self) -> bool {
        matches!(self, Gated::Busy { .. })
    }

    /// The fixed user-facing text for a busy outcome.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Gated::Busy { .. } => Some(BUSY_MESSAGE),
            Gated::Done(_) => None,
        }
    }

    pub fn done(self) -> Option<T> {
        match self {
            Gated::Done(value) => Some(value),
            Gated::Busy { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Gated<U> {
        match self {
            Gated::Done(value) => Gated::Done(f(value)),
            Gated::Busy { retry_after } => Gated::Busy { retry_after },
        }
    }

    /// Collapse to the value, or [`BUSY_MESSAGE`] when busy.
    pub fn or_busy_message(self) -> Result<T, &'static str> {
        match self {
            Gated::Done(value) => Ok(value),
            Gated::Busy { .. } => Err(BUSY_MESSAGE),
        }
    }
}

/// Guards one expensive feature (for example AI note generation) with a
/// rate limiter.
///
/// Rejection is reported as [`Gated::Busy`] rather than an error so callers
/// can answer with [`BUSY_MESSAGE`] without treating saturation as a fault.
#[derive(Debug)]
pub struct FeatureGate<L, S = NullSink> {
    limiter: Arc<L>,
    feature: Arc<str>,
    sink: S,
}

impl<L, S: Clone> Clone for FeatureGate<L, S> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), feature: self.feature.clone(), sink: self.sink.clone() }
    }
}

impl<L: RateLimiter> FeatureGate<L> {
    pub fn new(limiter: Arc<L>, feature: impl Into<Arc<str>>) -> Self {
        Self { limiter, feature: feature.into(), sink: NullSink }
    }
}

impl<L, S> FeatureGate<L, S>
where
    L: RateLimiter,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Attach a telemetry sink for admission events.
    pub fn with_sink<T>(self, sink: T) -> FeatureGate<L, T> {
        FeatureGate { limiter: self.limiter, feature: self.feature, sink }
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Take a permit for `ctx` without running anything.
    pub fn check_for(&self, ctx: &TenantContext) -> Decision {
        let key = BucketKey::new(ctx.tenant_id().clone(), ctx.branch_id().clone(), self.feature.clone());
        self.limiter.try_acquire_key(&key)
    }

    /// Run `op` for the active request's tenant and branch, if admitted.
    pub async fn run<T, Fut, Op>(&self, op: Op) -> Result<Gated<T>, ContextError>
    where
        Fut: Future<Output = T>,
        Op: FnOnce() -> Fut,
    {
        let ctx = tenant::require_current()?;
        Ok(self.run_for(&ctx, op).await)
    }

    /// Run `op` for an explicitly supplied context, if admitted.
    pub async fn run_for<T, Fut, Op>(&self, ctx: &TenantContext, op: Op) -> Gated<T>
    where
        Fut: Future<Output = T>,
        Op: FnOnce() -> Fut,
    {
        match self.check_for(ctx) {
            Decision::Allowed { remaining } => {
                let event = RateLimitEvent::Admitted { feature: self.feature.to_string(), remaining };
                emit_best_effort(self.sink.clone(), GuardEvent::RateLimit(event)).await;
                Gated::Done(op().await)
            }
            Decision::Denied { retry_after } => {
                debug!(target: "tenantguard::rate_limit", tenant = %ctx, feature = %self.feature, ?retry_after, "feature busy");
                let event = RateLimitEvent::Rejected { feature: self.feature.to_string(), retry_after };
                emit_best_effort(self.sink.clone(), GuardEvent::RateLimit(event)).await;
                Gated::Busy { retry_after }
            }
        }
    }
}
