//! Structured events for admission and dispatch.
//!
//! Components emit [`GuardEvent`]s into a [`TelemetrySink`], which is a
//! `tower::Service<GuardEvent>` so sinks compose with ordinary tower
//! combinators.
//!
//! - **Rate limiting**: `RateLimitEvent::Admitted`, `RateLimitEvent::Rejected`
//! - **Dispatch**: `DispatchEvent::Delivered`, `DispatchEvent::Failed`
//!
//! Events carry feature names and counts only, never tenant identifiers or
//! notification content, to keep label cardinality bounded.
//!
//! ```rust
//! use tenantguard::telemetry::{GuardEvent, RateLimitEvent};
//! use std::time::Duration;
//!
//! let event = GuardEvent::RateLimit(RateLimitEvent::Rejected {
//!     feature: "ai_clinical_note".into(),
//!     retry_after: Duration::from_secs(6),
//! });
//! assert!(event.to_string().contains("ai_clinical_note"));
//! ```

pub mod events;
pub mod sinks;

pub use events::{DispatchEvent, GuardEvent, RateLimitEvent};
pub use sinks::{LogSink, MemorySink, NullSink};

/// A telemetry sink that consumes guard events.
///
/// Every component that emits events is bounded on this trait, so a custom
/// sink needs this impl alongside its `Service` impl.
pub trait TelemetrySink:
    tower::Service<GuardEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry must not slow down or fail the hot path: if a sink is not ready
/// or returns an error, the event is dropped.
pub async fn emit_best_effort<S>(sink: S, event: GuardEvent)
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}
