#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tenantguard
//!
//! Request-scoped tenant identity and per-tenant admission control for
//! multi-tenant async services.
//!
//! ## Features
//!
//! - **Tenant context** carried by task-local scopes, with strict
//!   "no context means failure" accessors and explicit
//!   propagation into spawned tasks
//! - **Token-bucket rate limiting** keyed by tenant, branch and feature, with
//!   lazy bucket creation, live policy swaps and bounded memory
//! - **Feature gates** that turn saturation into a user-facing busy notice
//! - **Tower layers** for identity extraction, auditing and rate limiting
//! - **Background dispatch** of notifications on a bounded worker pool
//!
//! ## Quick Start
//!
//! ```rust
//! use tenantguard::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = Arc::new(KeyedRateLimiter::default());
//!     let gate = FeatureGate::new(limiter, "ai_clinical_note");
//!     let ctx = TenantContext::parse("clinic-42", "downtown").unwrap();
//!
//!     let outcome = tenant::scope(ctx, gate.run(|| async { "draft note" }))
//!         .await
//!         .unwrap()
//!         .unwrap();
//!     assert_eq!(outcome.or_busy_message(), Ok("draft note"));
//! }
//! ```

pub mod audit;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;
pub mod tenant;

// Re-exports
pub use audit::{AuditLayer, AuditPhase, AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use dispatch::{DispatchConfig, DispatchStats, Dispatcher, NotificationHandler};
pub use error::{ConfigError, ContextError, DispatchError, GuardError};
pub use rate_limit::{
    BucketConfig, BucketKey, Decision, FeatureGate, Gated, KeyedRateLimiter, LimitPolicy,
    LimiterOptions, RateLimitLayer, RateLimiter, BUSY_MESSAGE,
};
pub use tenant::{ActorId, BranchId, TenantContext, TenantContextLayer, TenantId};
