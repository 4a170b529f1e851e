//! # flowbus
//!
//! An in-process event orchestration engine: a named-event pub/sub core
//! that fans each published event out to its registered handlers, chains
//! follow-up events on success (`next`), chains compensating events on
//! failure (`saga`), batches outgoing events to an optional external
//! broker, and bounds concurrent handler execution with a worker pool.
//!
//! ## Components
//!
//! - [`EventBus`]: the dispatch engine, owning the queues, batching,
//!   worker pool and background loops
//! - [`EventRegistry`]: the mapping from event name to its ordered handler
//!   set
//! - [`EventFlow`]: the fluent builder producing chain-and-saga graphs
//! - [`EventBroker`]: the optional transport seam; `None` means pure
//!   in-process pub/sub
//!
//! ## Event Flow
//!
//! ```text
//! publish()                 batch
//! ────────▶ request queue ────────▶ broker (or loopback)
//!                                       │
//!                                       ▼
//!              worker pool ◀──── response queue
//!                   │
//!          handler(payload)
//!            │           │
//!         ok ▼           ▼ err
//!       next event    saga event ── or error channel
//! ```
//!
//! Handler outcomes feed back into the request queue: a successful run
//! triggers the event's `next` link with the handler's output, a failed
//! run triggers its `saga` compensation with whatever partial output the
//! handler produced. Errors without a compensation path drain through the
//! error channel into logs and counters.
//!
//! ## Example
//!
//! ```rust,no_run
//! use flowbus::{Event, EventBus, EventBusConfig, EventFlow, Value};
//!
//! # async fn example() -> flowbus::Result<()> {
//! let created = Event::new("order.created", |_payload: Value| async move {
//!     Ok(Value::from("reserved"))
//! });
//! let reserved = Event::new("order.reserved", |payload: Value| async move {
//!     println!("reserved with {:?}", payload);
//!     Ok(Value::Null)
//! });
//!
//! let flow = EventFlow::new().next(created).next(reserved);
//!
//! let bus = EventBus::in_process(EventBusConfig::default());
//! bus.register(&flow.flat())?;
//! bus.start();
//! bus.publish("order.created", Value::Integer(1))?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod event_flow;
pub mod event_registry;
pub mod telemetry;

pub use broker::{BrokerError, EventBroker, InMemoryBroker, EVENT_TOPIC};
pub use config::{ConfigError, EventBusConfig};
pub use error::{Error, Result};
pub use event::{Event, EventPayload, HandlerFailure, HandlerFn, HandlerResult, Value};
pub use event_bus::{BusError, EventBus};
pub use event_flow::EventFlow;
pub use event_registry::{EventRegistry, RegistryError};
pub use telemetry::{InMemoryMetrics, MetricsSink, NoopMetrics};
