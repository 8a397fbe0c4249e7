//! Convenient re-exports for common tenantguard types.
pub use crate::{
    audit::{AuditLayer, AuditPhase, AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink},
    clock::{Clock, ManualClock, MonotonicClock},
    dispatch::{
        DispatchConfig, DispatchStats, Dispatcher, HandlerResult, Notification, NotificationChannel,
        NotificationHandler,
    },
    error::{ConfigError, ContextError, DispatchError, GuardError},
    rate_limit::{
        BucketConfig, BucketKey, Decision, FeatureGate, Gated, KeyedRateLimiter, LimitPolicy,
        LimiterOptions, RateLimitLayer, RateLimiter, BUSY_MESSAGE,
    },
    tenant::{self, ActorId, BranchId, TenantContext, TenantContextLayer, TenantId},
};
