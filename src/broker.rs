//! Broker boundary.
//!
//! The engine treats brokers as fully interchangeable: anything that can
//! publish an envelope to a topic and pull externally available envelopes
//! back into the response queue. Broker absence is a valid configuration
//! meaning "loop back in-process". Concrete adapters own their connection
//! lifecycle, (de)serialization and redelivery semantics; the engine never
//! sees any of that.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Error;
use crate::event::EventPayload;

/// Topic every batch flush publishes to.
pub const EVENT_TOPIC: &str = "event_topic";

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker publish failed: {message}")]
    Publish { message: String },

    #[error("broker consume failed: {message}")]
    Consume { message: String },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Hands one envelope to the broker under `topic`.
    async fn publish(&self, payload: &EventPayload, topic: &str) -> Result<(), BrokerError>;

    /// Pulls zero or more externally available envelopes into `responses`,
    /// reporting transport-level failures on `errors`. Must not block the
    /// caller when nothing is available.
    async fn consume(
        &self,
        responses: &mpsc::Sender<EventPayload>,
        errors: &mpsc::Sender<Error>,
    ) -> Result<(), BrokerError>;
}

/// Loopback broker holding JSON envelopes on per-topic in-memory queues.
///
/// This is the reference adapter: `publish` serializes the envelope the
/// way a wire adapter would, `consume` drains and deserializes. Used by
/// the integration tests and useful wherever a broker-shaped seam is
/// needed without a real transport.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a raw body, bypassing serialization. Lets tests exercise
    /// the malformed-envelope path.
    pub fn push_raw(&self, topic: &str, body: Vec<u8>) {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push_back(body);
    }

    /// Number of undelivered envelopes on `topic`.
    pub fn depth(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn pop(&self) -> Option<(String, Vec<u8>)> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .iter_mut()
            .find_map(|(topic, queue)| queue.pop_front().map(|body| (topic.clone(), body)))
    }

    fn push_front(&self, topic: &str, body: Vec<u8>) {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push_front(body);
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn publish(&self, payload: &EventPayload, topic: &str) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(payload)?;
        debug!(event = %payload.name, topic, "broker publish");
        self.push_raw(topic, body);
        Ok(())
    }

    async fn consume(
        &self,
        responses: &mpsc::Sender<EventPayload>,
        errors: &mpsc::Sender<Error>,
    ) -> Result<(), BrokerError> {
        while let Some((topic, body)) = self.pop() {
            match serde_json::from_slice::<EventPayload>(&body) {
                Ok(payload) => {
                    if let Err(mpsc::error::TrySendError::Full(payload)) =
                        responses.try_send(payload)
                    {
                        // Response queue saturated: keep the envelope on
                        // its topic for the next poll instead of
                        // dropping it.
                        match serde_json::to_vec(&payload) {
                            Ok(body) => self.push_front(&topic, body),
                            Err(e) => return Err(BrokerError::Serialization(e)),
                        }
                        break;
                    }
                }
                Err(e) => {
                    let _ = errors.try_send(Error::Broker(BrokerError::Serialization(e)));
                }
            }
        }
        Ok(())
    }
}
