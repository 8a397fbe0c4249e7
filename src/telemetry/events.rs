use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Events emitted by the guard components.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardEvent {
    /// Admission decisions
    RateLimit(RateLimitEvent),
    /// Background notification delivery
    Dispatch(DispatchEvent),
}

/// Events emitted by feature gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A call was admitted.
    Admitted {
        /// Feature the bucket guards
        feature: String,
        /// Whole tokens left afterwards
        remaining: u32,
    },
    /// A call was turned away because the bucket was empty.
    Rejected {
        /// Feature the bucket guards
        feature: String,
        /// Time until one whole token is available
        retry_after: Duration,
    },
}

/// Events emitted by dispatcher workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    /// The handler completed the job.
    Delivered {
        /// Handler run time
        duration: Duration,
    },
    /// The handler returned an error or panicked.
    Failed {
        /// Handler run time
        duration: Duration,
    },
}

impl fmt::Display for GuardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardEvent::RateLimit(e) => write!(f, "RateLimit::{}", e),
            GuardEvent::Dispatch(e) => write!(f, "Dispatch::{}", e),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Admitted { feature, remaining } => {
                write!(f, "Admitted({}, {} left)", feature, remaining)
            }
            RateLimitEvent::Rejected { feature, retry_after } => {
                write!(f, "Rejected({}, retry in {:?})", feature, retry_after)
            }
        }
    }
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::Delivered { duration } => write!(f, "Delivered({:?})", duration),
            DispatchEvent::Failed { duration } => write!(f, "Failed({:?})", duration),
        }
    }
}

#[cfg(feature = "telemetry-json")]
fn clamp_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// JSON rendering for log shippers.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &GuardEvent) -> serde_json::Value {
    match event {
        GuardEvent::RateLimit(RateLimitEvent::Admitted { feature, remaining }) => json!({
            "kind": "rate_limit_admitted",
            "feature": feature,
            "remaining": *remaining,
        }),
        GuardEvent::RateLimit(RateLimitEvent::Rejected { feature, retry_after }) => json!({
            "kind": "rate_limit_rejected",
            "feature": feature,
            "retry_after_ms": clamp_u64(retry_after.as_millis()),
        }),
        GuardEvent::Dispatch(DispatchEvent::Delivered { duration }) => json!({
            "kind": "dispatch_delivered",
            "duration_ms": clamp_u64(duration.as_millis()),
        }),
        GuardEvent::Dispatch(DispatchEvent::Failed { duration }) => json!({
            "kind": "dispatch_failed",
            "duration_ms": clamp_u64(duration.as_millis()),
        }),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_event_display() {
        let event = RateLimitEvent::Admitted { feature: "ai_note".into(), remaining: 19 };
        assert_eq!(event.to_string(), "Admitted(ai_note, 19 left)");
    }

    #[test]
    fn guard_event_display_prefixes_component() {
        let event = GuardEvent::Dispatch(DispatchEvent::Delivered {
            duration: Duration::from_millis(3),
        });
        assert_eq!(event.to_string(), "Dispatch::Delivered(3ms)");
    }
}
