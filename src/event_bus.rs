//! # EventBus
//!
//! The dispatch engine. Owns the request, response and error queues, the
//! worker-pool admission gate and the batch buffer, and runs two background
//! loops once started:
//!
//! 1. The **dispatch loop** multiplexes the shutdown signal and the three
//!    queues: requests accumulate into a batch that is flushed to the broker
//!    (or looped back in-process when no broker is configured), responses
//!    are dispatched to their registered handlers, and drained errors are
//!    logged and counted. With a broker configured, a poll interval arm
//!    pulls externally published envelopes back into the pipeline.
//! 2. The **sampler loop** records queue occupancy gauges on a fixed
//!    interval.
//!
//! Backpressure has exactly two faces: `publish` never blocks (it fails
//! fast with [`BusError::QueueFull`] when the request queue is saturated),
//! and handler execution is throttled by a counting semaphore sized to the
//! worker pool: pool exhaustion delays handler starts, never the dispatch
//! loop or the publish path.
//!
//! One faulty handler must never take down the engine: handler panics are
//! caught at the task boundary and surface on the error channel as
//! [`BusError::PanicRecovered`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::broker::{EventBroker, EVENT_TOPIC};
use crate::config::EventBusConfig;
use crate::error::Error;
use crate::event::{Event, EventPayload, Value};
use crate::event_registry::{EventRegistry, RegistryError};
use crate::telemetry::{self, MetricsSink, NoopMetrics};

#[derive(Error, Debug)]
pub enum BusError {
    /// Admission control at the publish boundary: the request queue is
    /// saturated and the caller should back off.
    #[error("request queue full")]
    QueueFull,

    #[error("handler for event {name} failed: {message}")]
    Handler { name: String, message: String },

    #[error("handler for event {name} timed out after {timeout_ms}ms")]
    HandlerTimeout { name: String, timeout_ms: u64 },

    #[error("recovered from panic in handler for event {name}: {message}")]
    PanicRecovered { name: String, message: String },

    #[error("{queue} queue send failed: {message}")]
    SendFailed {
        queue: &'static str,
        message: String,
    },
}

/// Registry plus the per-name handler cache, behind one mutex. The lock is
/// held only for lookup and cache population, never across handler
/// execution.
struct RegistryState {
    registry: EventRegistry,
    handler_cache: HashMap<String, Vec<Arc<Event>>>,
}

/// Receiving ends of the three queues, parked until `start` takes them.
struct DispatchQueues {
    request_rx: mpsc::Receiver<EventPayload>,
    response_rx: mpsc::Receiver<EventPayload>,
    error_rx: mpsc::Receiver<Error>,
}

/// Cheap cloneable handle to the engine; clones share the same queues,
/// registry and lifecycle.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    state: Mutex<RegistryState>,
    request_tx: mpsc::Sender<EventPayload>,
    response_tx: mpsc::Sender<EventPayload>,
    error_tx: mpsc::Sender<Error>,
    queues: Mutex<Option<DispatchQueues>>,
    broker: Option<Arc<dyn EventBroker>>,
    metrics: Arc<dyn MetricsSink>,
    worker_pool: Arc<Semaphore>,
    config: EventBusConfig,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventBus {
    pub fn new(
        broker: Option<Arc<dyn EventBroker>>,
        metrics: Arc<dyn MetricsSink>,
        config: EventBusConfig,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(config.request_queue_size.max(1));
        let (response_tx, response_rx) = mpsc::channel(config.response_queue_size.max(1));
        let (error_tx, error_rx) = mpsc::channel(config.error_queue_size.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(RegistryState {
                    registry: EventRegistry::new(),
                    handler_cache: HashMap::new(),
                }),
                request_tx,
                response_tx,
                error_tx,
                queues: Mutex::new(Some(DispatchQueues {
                    request_rx,
                    response_rx,
                    error_rx,
                })),
                broker,
                metrics,
                worker_pool: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
                config,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Pure in-process pub/sub: no broker, no metrics.
    pub fn in_process(config: EventBusConfig) -> Self {
        Self::new(None, Arc::new(NoopMetrics), config)
    }

    /// Appends `events` to the registry. Validation failures are returned
    /// synchronously and leave the registry untouched.
    pub fn register(&self, events: &[Arc<Event>]) -> Result<(), RegistryError> {
        let mut state = self.inner.lock_state();
        state.registry.register(events)?;
        for event in events {
            state.handler_cache.remove(event.name());
        }
        Ok(())
    }

    /// Bulk-appends every entry of `other` into this bus's registry.
    pub fn import(&self, other: &EventRegistry) {
        let mut state = self.inner.lock_state();
        let names: Vec<String> = other.names().map(str::to_string).collect();
        for name in &names {
            state.handler_cache.remove(name);
        }
        state.registry.import(other);
    }

    /// Non-blocking enqueue onto the request queue. This is the sole
    /// admission-control point: a saturated queue rejects immediately.
    pub fn publish(&self, name: &str, payload: Value) -> crate::error::Result<()> {
        let envelope = EventPayload::new(name, payload);
        debug!(event = name, "publishing event");
        match self.inner.request_tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner
                    .metrics
                    .incr_counter(telemetry::ERROR_COUNT, &[("type", "queue_full")]);
                Err(BusError::QueueFull.into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::SendFailed {
                queue: "request",
                message: "request queue closed".to_string(),
            }
            .into()),
        }
    }

    /// Launches the dispatch and sampler loops. Idempotent: repeated calls
    /// after the first are no-ops, as is starting an already-stopped bus.
    pub fn start(&self) -> &Self {
        if self.inner.stopped.load(Ordering::SeqCst)
            || self.inner.started.swap(true, Ordering::SeqCst)
        {
            return self;
        }
        let queues = self
            .inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(queues) = queues {
            let inner = self.inner.clone();
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move { inner.dispatch_loop(queues, shutdown_rx).await });

            let inner = self.inner.clone();
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move { inner.sample_loop(shutdown_rx).await });
        }
        self
    }

    /// Signals both loops to exit. Idempotent; does not wait for in-flight
    /// handlers.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping event bus");
        let _ = self.inner.shutdown_tx.send(());
    }
}

impl BusInner {
    async fn dispatch_loop(
        &self,
        mut queues: DispatchQueues,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut batch: Vec<EventPayload> = Vec::with_capacity(self.config.batch_size.max(1));
        let mut poll = interval(self.config.broker_poll_interval.max(Duration::from_millis(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("dispatch loop started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("dispatch loop stopping");
                    break;
                }
                Some(envelope) = queues.request_rx.recv() => {
                    batch.push(envelope);
                    if batch.len() >= self.config.batch_size {
                        self.flush_batch(&mut batch).await;
                    }
                }
                Some(envelope) = queues.response_rx.recv() => {
                    let EventPayload { name, payload } = envelope;
                    self.process_event(&name, payload);
                }
                Some(err) = queues.error_rx.recv() => {
                    error!(error = %err, "error processing event");
                    self.metrics
                        .incr_counter(telemetry::ERROR_COUNT, &[("type", "callback")]);
                }
                _ = poll.tick(), if self.broker.is_some() => {
                    if let Some(broker) = &self.broker {
                        if let Err(err) = broker.consume(&self.response_tx, &self.error_tx).await {
                            self.forward_error(err.into());
                        }
                    }
                }
            }
        }
    }

    /// Hands the buffered events off: to the broker when one is configured,
    /// straight onto the response queue otherwise. One failed event does
    /// not block its batch siblings.
    async fn flush_batch(&self, batch: &mut Vec<EventPayload>) {
        if batch.is_empty() {
            return;
        }
        debug!(batch_size = batch.len(), "flushing batch");
        let start = Instant::now();

        match &self.broker {
            Some(broker) => {
                for envelope in batch.drain(..) {
                    match broker.publish(&envelope, EVENT_TOPIC).await {
                        Ok(()) => {
                            self.metrics.incr_counter(telemetry::PUBLISH_COUNT, &[]);
                        }
                        Err(err) => {
                            self.metrics
                                .incr_counter(telemetry::ERROR_COUNT, &[("type", "publish")]);
                            self.forward_error(err.into());
                        }
                    }
                }
            }
            None => {
                // The dispatch loop owns the receiving end, so a blocking
                // send here could deadlock; overflow surfaces as an error.
                for envelope in batch.drain(..) {
                    match self.response_tx.try_send(envelope) {
                        Ok(()) => {
                            self.metrics.incr_counter(telemetry::PUBLISH_COUNT, &[]);
                        }
                        Err(err) => {
                            self.metrics
                                .incr_counter(telemetry::ERROR_COUNT, &[("type", "loopback")]);
                            self.forward_error(
                                BusError::SendFailed {
                                    queue: "response",
                                    message: err.to_string(),
                                }
                                .into(),
                            );
                        }
                    }
                }
            }
        }

        self.metrics.record_histogram(
            telemetry::PUBLISH_LATENCY,
            start.elapsed().as_secs_f64(),
            &[],
        );
    }

    /// Looks up (and memoizes) the handlers registered under `name` and
    /// schedules one worker task per handler. An unknown name is reported
    /// on the error channel; it never fails the loop.
    fn process_event(&self, name: &str, payload: Value) {
        debug!(event = name, "processing event");
        let events = {
            let mut state = self.lock_state();
            match state.handler_cache.get(name).cloned() {
                Some(events) => events,
                None => match state.registry.get(name) {
                    Ok(events) => {
                        let events = events.to_vec();
                        state.handler_cache.insert(name.to_string(), events.clone());
                        events
                    }
                    Err(err) => {
                        drop(state);
                        self.forward_error(err.into());
                        return;
                    }
                },
            }
        };

        for event in events {
            self.spawn_handler(event, payload.clone());
        }
    }

    /// Runs one handler on the worker pool. The spawned task acquires a
    /// pool permit before executing, so pool exhaustion queues handler
    /// starts without stalling dispatch.
    ///
    /// The handler itself runs in a detached task that owns the permit:
    /// on timeout the watcher walks away and discards whatever the
    /// handler eventually produces, but the handler keeps running to
    /// completion and keeps its pool slot until it does.
    fn spawn_handler(&self, event: Arc<Event>, payload: Value) {
        let worker_pool = self.worker_pool.clone();
        let request_tx = self.request_tx.clone();
        let error_tx = self.error_tx.clone();
        let metrics = self.metrics.clone();
        let handler_timeout = self.config.handler_timeout;

        tokio::spawn(async move {
            let permit = match worker_pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let start = Instant::now();
            let handler_task = tokio::spawn({
                let event = event.clone();
                async move {
                    let _permit = permit;
                    event.invoke(payload).await
                }
            });
            let outcome = timeout(handler_timeout, handler_task).await;

            metrics.record_histogram(
                telemetry::PROCESS_LATENCY,
                start.elapsed().as_secs_f64(),
                &[],
            );
            metrics.incr_counter(telemetry::PROCESS_COUNT, &[]);

            match outcome {
                // Timed out: the handler task is abandoned and its
                // result, whenever it arrives, discarded.
                Err(_elapsed) => {
                    metrics.incr_counter(telemetry::ERROR_COUNT, &[("type", "timeout")]);
                    let err = BusError::HandlerTimeout {
                        name: event.name().to_string(),
                        timeout_ms: handler_timeout.as_millis() as u64,
                    };
                    send_error(&error_tx, err.into()).await;
                }
                Ok(Err(join_err)) if join_err.is_panic() => {
                    metrics.incr_counter(telemetry::ERROR_COUNT, &[("type", "panic")]);
                    let err = BusError::PanicRecovered {
                        name: event.name().to_string(),
                        message: panic_message(join_err.into_panic()),
                    };
                    send_error(&error_tx, err.into()).await;
                }
                // Only abort produces a non-panic join error and nothing
                // aborts handler tasks.
                Ok(Err(_)) => {}
                Ok(Ok(Ok(output))) => {
                    if let Some(next) = event.next() {
                        forward(
                            &request_tx,
                            EventPayload::new(next.name(), output),
                            &error_tx,
                        )
                        .await;
                    }
                }
                Ok(Ok(Err(failure))) => {
                    metrics.incr_counter(telemetry::ERROR_COUNT, &[("type", "handler")]);
                    match event.saga() {
                        Some(saga) => {
                            forward(
                                &request_tx,
                                EventPayload::new(saga, failure.output),
                                &error_tx,
                            )
                            .await;
                        }
                        None => {
                            let err = BusError::Handler {
                                name: event.name().to_string(),
                                message: failure.message,
                            };
                            send_error(&error_tx, err.into()).await;
                        }
                    }
                }
            }
        });
    }

    async fn sample_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.metrics_interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    self.record_queue_depth("request", &self.request_tx);
                    self.record_queue_depth("response", &self.response_tx);
                    self.record_queue_depth("error", &self.error_tx);
                }
            }
        }
    }

    fn record_queue_depth<T>(&self, queue: &str, tx: &mpsc::Sender<T>) {
        let depth = tx.max_capacity().saturating_sub(tx.capacity());
        self.metrics
            .record_gauge(telemetry::QUEUE_SIZE, depth as i64, &[("queue", queue)]);
    }

    /// Non-blocking push onto the error channel, used from within the
    /// dispatch loop, which also drains it; a blocking send could
    /// deadlock against ourselves.
    fn forward_error(&self, err: Error) {
        if let Err(e) = self.error_tx.try_send(err) {
            warn!(error = %e.into_inner(), "error queue saturated, dropping error");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Re-enqueues a follow-up request from a worker task. Worker tasks may
/// block here; the dispatch loop drains the queue independently.
async fn forward(
    request_tx: &mpsc::Sender<EventPayload>,
    envelope: EventPayload,
    error_tx: &mpsc::Sender<Error>,
) {
    let name = envelope.name.clone();
    if request_tx.send(envelope).await.is_err() {
        let err = BusError::SendFailed {
            queue: "request",
            message: format!("request queue closed while forwarding {}", name),
        };
        send_error(error_tx, err.into()).await;
    }
}

async fn send_error(error_tx: &mpsc::Sender<Error>, err: Error) {
    if let Err(e) = error_tx.send(err).await {
        warn!(error = %e.0, "error queue closed, dropping error");
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
