//! Broker transport abstractions
//!
//! Publisher, consumer and drain only talk to the broker through these traits,
//! so the AMQP transport and the in-memory broker are interchangeable.

use crate::messaging::error::MessagingResult;
use async_trait::async_trait;
use std::fmt;

/// Broker-assigned handle for one in-flight delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to this client, pending ack or reject
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// Properties attached to a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    /// Ask the broker to store the message on disk
    pub persistent: bool,
    pub content_type: String,
}

impl PublishProperties {
    /// Persistent JSON message
    pub fn persistent_json() -> Self {
        Self {
            persistent: true,
            content_type: crate::messaging::envelope::CONTENT_TYPE_JSON.to_string(),
        }
    }
}

/// Opens sessions to the broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Establish a new session, fails with `MessagingError::Connection`
    async fn connect(&self) -> MessagingResult<Box<dyn BrokerSession>>;

    /// Broker location with credentials removed, for logs
    fn endpoint(&self) -> String;
}

/// One transport-level session (connection + channel)
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a queue if absent; redeclaring with the same durability is a no-op
    async fn declare_queue(&self, queue: &str, durable: bool) -> MessagingResult<()>;

    /// Limit unacknowledged deliveries for consumers on this session
    async fn set_prefetch(&self, count: u16) -> MessagingResult<()>;

    /// Publish to a queue through the default exchange
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()>;

    /// Single non-blocking fetch, `None` when the queue is empty
    async fn fetch(&self, queue: &str) -> MessagingResult<Option<Delivery>>;

    /// Register a consumer and return its delivery stream
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> MessagingResult<Box<dyn DeliveryStream>>;

    /// Acknowledge a delivery
    async fn ack(&self, tag: DeliveryTag) -> MessagingResult<()>;

    /// Reject a delivery, optionally returning it to the queue
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> MessagingResult<()>;

    /// Close the session; unacknowledged deliveries return to the queue
    async fn close(&self) -> MessagingResult<()>;
}

/// Deliveries pushed to a registered consumer
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery, `None` once the broker ends the stream
    async fn next_delivery(&mut self) -> MessagingResult<Option<Delivery>>;
}
