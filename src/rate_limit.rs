//! Rate limiting primitives.
//!
//! This module provides the building blocks for per-tenant admission control:
//! - [`RateLimiter`]: The core trait for admission decisions.
//! - [`KeyedRateLimiter`]: Token buckets keyed by (tenant, branch, feature).
//! - [`RateLimitLayer`]: Tower middleware that enforces the limit.
//! - [`FeatureGate`]: Wraps an expensive operation and turns rejection into a
//!   "system busy" outcome instead of an error.
//! - [`Decision`]: The result of a rate limit check (Allowed/Denied).
//!
//! # Architecture
//!
//! - **Math**: [`TokenBucket`] is a plain state machine (refill, then take one
//!   whole token). It has no locking and no clock of its own.
//! - **Sharing**: [`KeyedRateLimiter`] owns one mutex-guarded bucket per key in
//!   a sharded map, so unrelated keys never contend on a common lock.
//! - **Policy**: [`LimitPolicy`] maps keys to [`BucketConfig`]s and can be
//!   swapped at runtime.

use crate::tenant::{BranchId, TenantId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod bucket;
pub mod config;
pub mod gate;
pub mod keyed;
pub mod middleware;

pub use bucket::TokenBucket;
pub use config::{BucketConfig, LimitPolicy, LimiterOptions};
pub use gate::{FeatureGate, Gated, BUSY_MESSAGE};
pub use keyed::KeyedRateLimiter;
pub use middleware::{RateLimitFuture, RateLimitLayer, RateLimitService};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Whole tokens remaining after this acquisition.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The request is denied.
    Denied {
        /// How long until one whole token is available.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn is_denied(&self) -> bool {
        !self.is_allowed()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Denied { retry_after } => Some(*retry_after),
            Decision::Allowed { .. } => None,
        }
    }
}

/// Identifies one bucket: a feature as used by one branch of one tenant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketKey {
    tenant_id: TenantId,
    branch_id: BranchId,
    feature: Arc<str>,
}

impl BucketKey {
    pub fn new(tenant_id: TenantId, branch_id: BranchId, feature: impl Into<Arc<str>>) -> Self {
        Self { tenant_id, branch_id, feature: feature.into() }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.branch_id, self.feature)
    }
}

/// Core interface for admission decisions.
///
/// Implementations must return immediately: no waiting for tokens, no I/O.
/// A rejection is a normal [`Decision::Denied`], never an error.
pub trait RateLimiter: Send + Sync {
    /// Attempt to take one permit from the bucket for `key`.
    fn try_acquire_key(&self, key: &BucketKey) -> Decision;
}

impl<L: RateLimiter + ?Sized> RateLimiter for Arc<L> {
    fn try_acquire_key(&self, key: &BucketKey) -> Decision {
        (**self).try_acquire_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_helpers() {
        let allowed = Decision::Allowed { remaining: 3 };
        assert!(allowed.is_allowed());
        assert!(allowed.retry_after().is_none());

        let denied = Decision::Denied { retry_after: Duration::from_secs(6) };
        assert!(denied.is_denied());
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(6)));
    }

    #[test]
    fn bucket_key_display() {
        let key = BucketKey::new(
            TenantId::new("t1").unwrap(),
            BranchId::new("b1").unwrap(),
            "ai_clinical_note",
        );
        assert_eq!(key.to_string(), "t1/b1/ai_clinical_note");
        assert_eq!(key.feature(), "ai_clinical_note");
    }
}
