//! Error types for tenant scoping, limiter configuration and middleware.
use std::fmt;
use std::time::Duration;

/// Faults raised by tenant context access.
///
/// Every variant indicates an integration bug (missing auth layer, double
/// setup, bad identifier) rather than a business condition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// A tenant-scoped accessor ran outside any request context.
    #[error("tenant context not initialized")]
    NotInitialized,
    /// A context was installed while another one was already active.
    #[error("tenant context already initialized for tenant '{tenant_id}'")]
    AlreadyInitialized {
        /// Tenant of the context that was already active.
        tenant_id: String,
    },
    /// An identifier was empty or contained only whitespace.
    #[error("invalid {kind} identifier")]
    InvalidIdentifier {
        /// Which identifier failed validation (`tenant`, `branch`, `actor`).
        kind: &'static str,
    },
}

/// Rejected rate limiter configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Bucket capacity must be at least one whole token.
    #[error("capacity must be > 0 (got {provided})")]
    ZeroCapacity {
        /// Value provided by caller.
        provided: u32,
    },
    /// Refill amount must be finite and > 0.
    #[error("refill tokens must be finite and > 0 (got {provided})")]
    InvalidRefillTokens {
        /// Value provided by caller.
        provided: f64,
    },
    /// Refill interval must be > 0.
    #[error("refill interval must be > 0 (got {0:?})")]
    InvalidRefillInterval(Duration),
    /// The bucket table needs room for at least one key.
    #[error("max_buckets must be > 0")]
    ZeroMaxBuckets,
    /// Idle buckets need a non-zero time-to-live.
    #[error("idle_ttl must be > 0")]
    ZeroIdleTtl,
    /// Dispatcher needs at least one worker and one queue slot.
    #[error("dispatcher {field} must be > 0")]
    InvalidDispatch {
        /// Offending field name.
        field: &'static str,
    },
    /// A serialized policy could not be parsed.
    #[error("invalid limit policy document: {0}")]
    Parse(String),
}

/// Errors returned by the notification dispatcher.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The queue is at capacity; the caller should shed or retry later.
    #[error("notification queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },
    /// The dispatcher has been shut down.
    #[error("notification dispatcher closed")]
    Closed,
}

/// Error surfaced by the tower middleware in this crate.
#[derive(Debug, Clone)]
pub enum GuardError<E> {
    /// Tenant context was missing or could not be established.
    Context(ContextError),
    /// The rate limiter rejected the request.
    RateLimited {
        /// Feature whose bucket was empty.
        feature: String,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Context(e) => write!(f, "{}", e),
            Self::RateLimited { feature, retry_after } => {
                write!(f, "rate limited on '{}' (retry after {:?})", feature, retry_after)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Context(e) => Some(e),
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> From<ContextError> for GuardError<E> {
    fn from(err: ContextError) -> Self {
        Self::Context(err)
    }
}

impl<E> GuardError<E> {
    /// Check if this error is a rate limit rejection
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
    /// Check if this error is a tenant context fault
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Context(_))
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Suggested retry delay for rate limit rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> GuardError<GuardError<E>> {
    /// Collapse the nesting produced by stacking several of this crate's layers.
    pub fn flatten(self) -> GuardError<E> {
        match self {
            Self::Inner(inner) => inner,
            Self::Context(e) => GuardError::Context(e),
            Self::RateLimited { feature, retry_after } => GuardError::RateLimited { feature, retry_after },
        }
    }
}
