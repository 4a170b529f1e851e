//! Mapping from event name to its ordered handler set.
//!
//! The registry is a plain data structure: no locking of its own, callers
//! (the bus) serialize access. One name may carry many handlers; repeated
//! registration appends rather than replaces, and there is no removal.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::event::Event;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("no events to register")]
    EmptyRegistration,

    #[error("cannot register an event with an empty name")]
    UnnamedEvent,

    #[error("events not found: {0}")]
    NotFound(String),
}

#[derive(Default)]
pub struct EventRegistry {
    events: HashMap<String, Vec<Arc<Event>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends each event under its name, preserving insertion order.
    ///
    /// The whole batch is validated before anything is inserted, so a
    /// rejected call leaves the registry untouched.
    pub fn register(&mut self, events: &[Arc<Event>]) -> Result<(), RegistryError> {
        if events.is_empty() {
            return Err(RegistryError::EmptyRegistration);
        }
        if events.iter().any(|event| event.name().is_empty()) {
            return Err(RegistryError::UnnamedEvent);
        }
        for event in events {
            self.events
                .entry(event.name().to_string())
                .or_default()
                .push(event.clone());
        }
        Ok(())
    }

    /// Appends every (name, sequence) pair from `other`, merging sequences
    /// under shared names.
    pub fn import(&mut self, other: &EventRegistry) {
        for (name, events) in &other.events {
            self.events
                .entry(name.clone())
                .or_default()
                .extend(events.iter().cloned());
        }
    }

    /// The handler sequence for `name`. Absence and emptiness are the same
    /// failure: a successful lookup never yields an empty slice.
    pub fn get(&self, name: &str) -> Result<&[Arc<Event>], RegistryError> {
        match self.events.get(name) {
            Some(events) if !events.is_empty() => Ok(events),
            _ => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
