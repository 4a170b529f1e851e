//! Core event types: the payload [`Value`], the queue envelope
//! [`EventPayload`], and the [`Event`] unit of work.
//!
//! An [`Event`] couples a routing name with an async handler and up to three
//! wiring cells set during application setup:
//!
//! - `next`: the event to trigger, carrying the handler's output, after a
//!   successful run (the forward execution chain),
//! - `saga`: the name of the compensating event to trigger when the handler
//!   fails,
//! - `saga_prev`: the previously attached compensation, linking the saga
//!   chain in reverse registration order.
//!
//! The links live behind interior mutability so that [`EventFlow`] can wire
//! events after construction; once registered on a bus they are read-only by
//! convention.
//!
//! [`EventFlow`]: crate::event_flow::EventFlow

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Self-describing payload value carried by every event.
///
/// The envelope must survive a round trip through a broker, so the variants
/// are restricted to what serializes cleanly as JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// The unit transported on every queue and across the broker boundary:
/// a routing name plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: String,
    pub payload: Value,
}

impl EventPayload {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// A failed handler run.
///
/// The failure still carries an output value: when the event has a saga
/// attached, that output becomes the compensation's payload. Handlers that
/// have nothing useful to hand over leave it at [`Value::Null`].
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HandlerFailure {
    pub message: String,
    pub output: Value,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: Value::Null,
        }
    }

    pub fn with_output(message: impl Into<String>, output: Value) -> Self {
        Self {
            message: message.into(),
            output,
        }
    }
}

pub type HandlerResult = Result<Value, HandlerFailure>;

/// Boxed async handler, payload in, output (or failure) out.
pub type HandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A named unit of work.
///
/// Created once during application wiring, registered into the registry,
/// then lives for the rest of the process.
pub struct Event {
    name: String,
    handler: HandlerFn,
    saga: RwLock<Option<String>>,
    next: RwLock<Option<Arc<Event>>>,
    saga_prev: RwLock<Option<Arc<Event>>>,
}

impl Event {
    /// Creates an event from an async closure.
    ///
    /// ```rust,no_run
    /// use flowbus::{Event, Value};
    ///
    /// let event = Event::new("order.created", |_payload: Value| async move {
    ///     Ok(Value::from("reserved"))
    /// });
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Arc<Self>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::with_handler_fn(name, Arc::new(move |payload| handler(payload).boxed()))
    }

    /// Creates an event from an already-boxed handler.
    pub fn with_handler_fn(name: impl Into<String>, handler: HandlerFn) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            handler,
            saga: RwLock::new(None),
            next: RwLock::new(None),
            saga_prev: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the handler against `payload`.
    pub fn invoke(&self, payload: Value) -> BoxFuture<'static, HandlerResult> {
        (self.handler)(payload)
    }

    /// The event triggered after a successful run, if any.
    pub fn next(&self) -> Option<Arc<Event>> {
        self.next
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_next(&self, next: &Arc<Event>) {
        *self.next.write().unwrap_or_else(PoisonError::into_inner) = Some(next.clone());
    }

    /// Name of the compensating event triggered when the handler fails.
    pub fn saga(&self) -> Option<String> {
        self.saga
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_saga(&self, name: &str) {
        *self.saga.write().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
    }

    /// The compensation attached before this one, in reverse registration
    /// order. Only set on events threaded through [`EventFlow::saga`].
    ///
    /// [`EventFlow::saga`]: crate::event_flow::EventFlow::saga
    pub fn saga_prev(&self) -> Option<Arc<Event>> {
        self.saga_prev
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_saga_prev(&self, prev: &Arc<Event>) {
        *self
            .saga_prev
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(prev.clone());
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("saga", &self.saga())
            .field("next", &self.next().map(|e| e.name.clone()))
            .field("saga_prev", &self.saga_prev().map(|e| e.name.clone()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_invoke_returns_handler_output() {
        let event = Event::new("test", |payload: Value| async move { Ok(payload) });
        let output = event.invoke(Value::from("hello")).await.unwrap();
        assert_eq!(output, Value::String("hello".to_string()));
    }

    #[tokio::test]
    async fn test_failure_carries_partial_output() {
        let event = Event::new("test", |_payload: Value| async move {
            Err(HandlerFailure::with_output("boom", Value::from(42)))
        });
        let failure = event.invoke(Value::Null).await.unwrap_err();
        assert_eq!(failure.message, "boom");
        assert_eq!(failure.output, Value::Integer(42));
    }

    #[test]
    fn test_envelope_round_trips_through_json() {
        let mut map = HashMap::new();
        map.insert("id".to_string(), Value::Integer(1));
        let envelope = EventPayload::new("order.created", Value::Map(map));

        let body = serde_json::to_vec(&envelope).unwrap();
        let decoded: EventPayload = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_links_default_to_none() {
        let event = Event::new("test", |_payload: Value| async move { Ok(Value::Null) });
        assert!(event.next().is_none());
        assert!(event.saga().is_none());
        assert!(event.saga_prev().is_none());
    }
}
