//! Fluent builder for event chains.
//!
//! [`EventFlow`] produces two logically independent graphs over the same
//! nodes: the forward execution chain (linked through `next`, walked on
//! success) and the compensation chain (linked through `saga_prev`, in
//! reverse registration order). The builder is consumed once at wiring
//! time; [`EventFlow::flat`] hands the reachable node set to the registry.
//!
//! ```rust,no_run
//! use flowbus::{Event, EventFlow, Value};
//!
//! let charge = Event::new("payment.charge", |_p: Value| async move { Ok(Value::Null) });
//! let ship = Event::new("order.ship", |_p: Value| async move { Ok(Value::Null) });
//! let refund = Event::new("payment.refund", |_p: Value| async move { Ok(Value::Null) });
//!
//! let flow = EventFlow::new().next(charge).saga(refund).next(ship);
//! let events = flow.flat();
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use crate::event::Event;

#[derive(Default)]
pub struct EventFlow {
    base_event: Option<Arc<Event>>,
    last_event: Option<Arc<Event>>,
    last_saga: Option<Arc<Event>>,
}

impl EventFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event` to the tail of the primary chain. An empty chain
    /// makes `event` both head and tail.
    pub fn next(mut self, event: Arc<Event>) -> Self {
        match &self.last_event {
            None => {
                self.base_event = Some(event.clone());
            }
            Some(last) => {
                last.set_next(&event);
            }
        }
        self.last_event = Some(event);
        self
    }

    /// Attaches `saga` as the compensation for the current primary-chain
    /// tail and threads it onto the saga chain.
    ///
    /// The compensation target is recorded on the tail, not on `saga`
    /// itself; the saga chain links backwards, so the most recently
    /// attached compensation is its head.
    pub fn saga(mut self, saga: Arc<Event>) -> Self {
        if let Some(last) = &self.last_event {
            last.set_saga(saga.name());
        }
        if let Some(prev) = &self.last_saga {
            saga.set_saga_prev(prev);
        }
        self.last_saga = Some(saga);
        self
    }

    /// The set of all reachable events across both chains, each at most
    /// once: primary chain first (from the base event through `next`),
    /// then the saga chain (from the last saga through `saga_prev`).
    ///
    /// Traversal stops at the first already-visited node, so hand-wired
    /// cycles terminate instead of looping.
    pub fn flat(&self) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();

        let mut cursor = self.base_event.clone();
        while let Some(event) = cursor {
            if !visited.insert(Arc::as_ptr(&event) as usize) {
                break;
            }
            cursor = event.next();
            events.push(event);
        }

        let mut cursor = self.last_saga.clone();
        while let Some(event) = cursor {
            if !visited.insert(Arc::as_ptr(&event) as usize) {
                break;
            }
            cursor = event.saga_prev();
            events.push(event);
        }

        events
    }

    pub fn base_event(&self) -> Option<Arc<Event>> {
        self.base_event.clone()
    }

    pub fn last_event(&self) -> Option<Arc<Event>> {
        self.last_event.clone()
    }

    pub fn last_saga(&self) -> Option<Arc<Event>> {
        self.last_saga.clone()
    }
}
