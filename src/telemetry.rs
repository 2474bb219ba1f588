//! Throttling events and the sinks that consume them.
//!
//! The checker emits one [`ThrottleEvent`] per state change (failure counted, record cleared,
//! stale record evicted, attempt denied). Events flow through a [`TelemetrySink`], which is a
//! `tower::Service<ThrottleEvent>` so sinks compose with ordinary tower plumbing.
//!
//! Emission is best-effort: a sink that is not ready or that errors never affects the verdict.
//!
//! ```rust
//! use connguard::telemetry::{MemorySink, ThrottleEvent};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(ThrottleEvent::FailureRecorded { identity: "alice".into(), failure_count: 1 })
//!     .await
//!     .unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use crate::policy::EvictionReason;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// Consumer of throttling events.
pub trait TelemetrySink:
    tower::Service<ThrottleEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: ThrottleEvent)
where
    S: tower::Service<ThrottleEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// State changes observed while checking attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ThrottleEvent {
    /// The identity is over its threshold inside the window.
    Denied { identity: String, failure_count: u32, retry_after_minutes: u32 },
    /// A failed attempt was counted.
    FailureRecorded { identity: String, failure_count: u32 },
    /// A successful attempt dropped the identity's record.
    Cleared { identity: String, previous_count: u32 },
    /// The enforcement pass dropped a record whose window had lapsed.
    Evicted { identity: String, failure_count: u32, reason: EvictionReason },
    /// The outcome carries no bookkeeping; the store was not consulted.
    Skipped { identity: String },
    /// The decision stands but the lock could not be released cleanly.
    LockReleaseFailed { reason: String },
}

impl ThrottleEvent {
    pub fn identity(&self) -> Option<&str> {
        match self {
            ThrottleEvent::Denied { identity, .. }
            | ThrottleEvent::FailureRecorded { identity, .. }
            | ThrottleEvent::Cleared { identity, .. }
            | ThrottleEvent::Evicted { identity, .. }
            | ThrottleEvent::Skipped { identity } => Some(identity),
            ThrottleEvent::LockReleaseFailed { .. } => None,
        }
    }
}

impl fmt::Display for ThrottleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleEvent::Denied { identity, failure_count, retry_after_minutes } => write!(
                f,
                "Denied({}, failures={}, retry_after={}m)",
                identity, failure_count, retry_after_minutes
            ),
            ThrottleEvent::FailureRecorded { identity, failure_count } => {
                write!(f, "FailureRecorded({}, failures={})", identity, failure_count)
            }
            ThrottleEvent::Cleared { identity, previous_count } => {
                write!(f, "Cleared({}, previous={})", identity, previous_count)
            }
            ThrottleEvent::Evicted { identity, failure_count, reason } => {
                write!(f, "Evicted({}, failures={}, reason={})", identity, failure_count, reason)
            }
            ThrottleEvent::Skipped { identity } => write!(f, "Skipped({})", identity),
            ThrottleEvent::LockReleaseFailed { reason } => {
                write!(f, "LockReleaseFailed({})", reason)
            }
        }
    }
}

type SinkFuture<E> = Pin<Box<dyn std::future::Future<Output = Result<(), E>> + Send>>;

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ThrottleEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: ThrottleEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing`; denials at WARN, everything else at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<ThrottleEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ThrottleEvent) -> Self::Future {
        match event {
            ThrottleEvent::Denied { .. } | ThrottleEvent::LockReleaseFailed { .. } => {
                tracing::warn!(event = %event, "throttle_event")
            }
            _ => tracing::info!(event = %event, "throttle_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory. Bounded; the oldest events are evicted past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ThrottleEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<ThrottleEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<ThrottleEvent> {
        self.buffer().clone()
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ThrottleEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ThrottleEvent) -> Self::Future {
        let mut guard = self.buffer();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Error type for composed sinks.
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telemetry sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Sends every event to two sinks concurrently. Either failure is propagated.
///
/// ```rust
/// use connguard::telemetry::{LogSink, MemorySink, MulticastSink};
///
/// let memory = MemorySink::new();
/// let _combined = MulticastSink::new(LogSink, memory.clone());
/// ```
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<ThrottleEvent> for MulticastSink<A, B>
where
    A: tower::Service<ThrottleEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<ThrottleEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<ComposedSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ThrottleEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_clone = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = futures::join!(sink_a.call(event), sink_b.call(event_clone));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<ThrottleEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<ThrottleEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
