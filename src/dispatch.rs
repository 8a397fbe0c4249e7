//! Background notification dispatch.
//!
//! A [`Dispatcher`] owns a bounded queue and a fixed pool of worker tasks.
//! Callers enqueue jobs and return immediately; workers hand each job to a
//! [`NotificationHandler`]. The tenant context active at enqueue time travels
//! with the job and is re-established while the handler runs, so handlers can
//! call [`tenant::require_current`] as if they were still inside the request.
//!
//! ```rust
//! use tenantguard::dispatch::{DispatchConfig, Dispatcher, HandlerResult, NotificationHandler};
//! use async_trait::async_trait;
//!
//! struct Print;
//!
//! #[async_trait]
//! impl NotificationHandler<String> for Print {
//!     async fn handle(&self, job: String) -> HandlerResult {
//!         println!("{job}");
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = Dispatcher::start(DispatchConfig::default(), Print).unwrap();
//! dispatcher.try_dispatch("appointment reminder".to_string()).unwrap();
//! dispatcher.shutdown().await;
//! assert_eq!(dispatcher.stats().processed, 1);
//! # }
//! ```

use crate::error::{ConfigError, DispatchError};
use crate::telemetry::{emit_best_effort, DispatchEvent, GuardEvent, NullSink, TelemetrySink};
use crate::tenant::{self, TenantContext};
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Error type returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of handling one job.
pub type HandlerResult = Result<(), BoxError>;

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl DispatchConfig {
    pub fn new(workers: usize, queue_capacity: usize) -> Result<Self, ConfigError> {
        let config = Self { workers, queue_capacity };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidDispatch { field: "workers" });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidDispatch { field: "queue_capacity" });
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: 4, queue_capacity: 256 }
    }
}

/// Delivers one job. Implementations are shared by every worker.
#[async_trait]
pub trait NotificationHandler<N>: Send + Sync + 'static {
    async fn handle(&self, job: N) -> HandlerResult;
}

/// Delivery channel for a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationChannel {
    Email,
    Push,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationChannel::Email => f.write_str("email"),
            NotificationChannel::Push => f.write_str("push"),
        }
    }
}

/// A ready-made job type for email and push messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: NotificationChannel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn email(recipient: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel: NotificationChannel::Email,
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn push(recipient: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel: NotificationChannel::Push,
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Counters for a [`Dispatcher`].
///
/// `processed` counts every job a worker finished, `failed` the subset whose
/// handler returned an error or panicked. `rejected` counts `try_dispatch`
/// calls refused because the queue was full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

struct Envelope<N> {
    job: N,
    ctx: Option<TenantContext>,
}

type SharedReceiver<N> = Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope<N>>>>;

/// Bounded queue plus worker pool.
pub struct Dispatcher<N> {
    tx: Mutex<Option<mpsc::Sender<Envelope<N>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    config: DispatchConfig,
}

impl<N> fmt::Debug for Dispatcher<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<N> Dispatcher<N> {
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> DispatchConfig {
        self.config
    }
}

impl<N: Send + 'static> Dispatcher<N> {
    /// Spawn `config.workers` workers on the current tokio runtime.
    pub fn start<H>(config: DispatchConfig, handler: H) -> Result<Self, ConfigError>
    where
        H: NotificationHandler<N>,
    {
        Self::start_with_sink(config, handler, NullSink)
    }

    /// Like [`start`](Self::start), emitting a [`DispatchEvent`] per job.
    pub fn start_with_sink<H, S>(config: DispatchConfig, handler: H, sink: S) -> Result<Self, ConfigError>
    where
        H: NotificationHandler<N>,
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rx: SharedReceiver<N> = Arc::new(tokio::sync::Mutex::new(rx));
        let handler = Arc::new(handler);
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers)
            .map(|id| {
                tokio::spawn(worker_loop(id, rx.clone(), handler.clone(), sink.clone(), counters.clone()))
            })
            .collect();

        debug!(target: "tenantguard::dispatch", workers = config.workers, capacity = config.queue_capacity, "dispatcher started");
        Ok(Self { tx: Mutex::new(Some(tx)), workers: Mutex::new(workers), counters, config })
    }

    /// Enqueue without waiting. Fails with `QueueFull` when at capacity.
    pub fn try_dispatch(&self, job: N) -> Result<(), DispatchError> {
        let tx = self.sender()?;
        match tx.try_send(Envelope { job, ctx: tenant::current() }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(target: "tenantguard::dispatch", capacity = self.config.queue_capacity, "notification queue full");
                Err(DispatchError::QueueFull { capacity: self.config.queue_capacity })
            }
            Err(TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Enqueue, waiting for a free slot.
    pub async fn dispatch(&self, job: N) -> Result<(), DispatchError> {
        let tx = self.sender()?;
        tx.send(Envelope { job, ctx: tenant::current() }).await.map_err(|_| DispatchError::Closed)
    }

    /// Close the queue, let workers drain what was accepted, and join them.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(err) = worker.await {
                error!(target: "tenantguard::dispatch", error = %err, "dispatch worker aborted");
            }
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Envelope<N>>, DispatchError> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone().ok_or(DispatchError::Closed)
    }
}

async fn worker_loop<N, H, S>(
    id: usize,
    rx: SharedReceiver<N>,
    handler: Arc<H>,
    sink: S,
    counters: Arc<Counters>,
) where
    N: Send + 'static,
    H: NotificationHandler<N>,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    loop {
        let next = rx.lock().await.recv().await;
        let Some(Envelope { job, ctx }) = next else { break };

        let start = Instant::now();
        let run = AssertUnwindSafe(handler.handle(job)).catch_unwind();
        let outcome = match ctx.clone() {
            Some(ctx) => tenant::bind(ctx, run).await,
            None => run.await,
        };
        let duration = start.elapsed();
        counters.processed.fetch_add(1, Ordering::Relaxed);

        let tenant = ctx.as_ref().map_or_else(|| "-".to_owned(), ToString::to_string);
        let event = match outcome {
            Ok(Ok(())) => DispatchEvent::Delivered { duration },
            Ok(Err(err)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(target: "tenantguard::dispatch", worker = id, tenant = %tenant, error = %err, "notification handler failed");
                DispatchEvent::Failed { duration }
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(target: "tenantguard::dispatch", worker = id, tenant = %tenant, "notification handler panicked");
                DispatchEvent::Failed { duration }
            }
        };
        emit_best_effort(sink.clone(), GuardEvent::Dispatch(event)).await;
    }
    debug!(target: "tenantguard::dispatch", worker = id, "dispatch worker stopped");
}
