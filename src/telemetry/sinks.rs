use super::events::GuardEvent;
use super::TelemetrySink;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

type ReadyFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<GuardEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GuardEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<GuardEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        tracing::info!(target: "tenantguard::telemetry", event = %event, "guard_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that keeps the most recent events in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<GuardEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<GuardEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<GuardEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GuardEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{emit_best_effort, DispatchEvent, RateLimitEvent};
    use std::time::Duration;

    fn admitted(n: u32) -> GuardEvent {
        GuardEvent::RateLimit(RateLimitEvent::Admitted { feature: "f".into(), remaining: n })
    }

    #[tokio::test]
    async fn memory_sink_keeps_most_recent() {
        let sink = MemorySink::with_capacity(2);
        for n in 0..3 {
            emit_best_effort(sink.clone(), admitted(n)).await;
        }
        assert_eq!(sink.events(), vec![admitted(1), admitted(2)]);
        assert_eq!(sink.evicted(), 1);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_events() {
        let event = GuardEvent::Dispatch(DispatchEvent::Failed { duration: Duration::ZERO });
        emit_best_effort(NullSink, event.clone()).await;
        emit_best_effort(LogSink, event).await;
    }

    #[derive(Debug)]
    struct Unreachable;

    impl std::fmt::Display for Unreachable {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("collector unreachable")
        }
    }

    impl std::error::Error for Unreachable {}

    #[derive(Clone, Default)]
    struct FailingSink {
        calls: Arc<AtomicU64>,
    }

    impl Service<GuardEvent> for FailingSink {
        type Response = ();
        type Error = Unreachable;
        type Future = Pin<Box<dyn Future<Output = Result<(), Unreachable>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _event: GuardEvent) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(Unreachable) })
        }
    }

    impl TelemetrySink for FailingSink {
        type SinkError = Unreachable;
    }

    #[tokio::test]
    async fn sink_errors_are_swallowed() {
        let sink = FailingSink::default();
        emit_best_effort(sink.clone(), admitted(0)).await;
        emit_best_effort(sink.clone(), admitted(1)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}
