//! Durable mail queue on an AMQP broker
//!
//! Mail envelopes are published to a single durable queue and taken off it
//! either by the long-lived consumer loop or by a filtered, non-blocking drain.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │  QueuePublisher  │  │  QueueConsumer   │  │  FilteredDrain   │
//! ├──────────────────┤  ├──────────────────┤  ├──────────────────┤
//! │ - publish()      │  │ - run()          │  │ - drain_matching │
//! │ session per call │  │ reconnect loop   │  │ session per call │
//! └──────────────────┘  └──────────────────┘  └──────────────────┘
//!           │                    │                     │
//!           ▼                    ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   BrokerConnector → BrokerSession → DeliveryStream          │
//! └─────────────────────────────────────────────────────────────┘
//!           │                                          │
//!           ▼                                          ▼
//! ┌──────────────────────┐                ┌──────────────────────┐
//! │  AMQP 0-9-1 (lapin)  │                │  In-memory broker    │
//! ├──────────────────────┤                ├──────────────────────┤
//! │ - amqp:// / amqps:// │                │ - tests, local runs  │
//! │ - publisher confirms │                │ - fault injection    │
//! └──────────────────────┘                └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mail_relay::messaging::{connector_from_config, BrokerConfig, FilteredDrain};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default();
//!     let connector = connector_from_config(&config)?;
//!
//!     let drain = FilteredDrain::new(connector, config.queue.clone());
//!     for envelope in drain.drain_for_receiver(2).await? {
//!         println!("{}: {}", envelope.sender_email, envelope.subject);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod amqp;
mod config;
mod consumer;
mod drain;
mod envelope;
mod error;
mod memory;
mod metrics;
mod publisher;
mod traits;

use std::sync::Arc;

pub use amqp::{AmqpConnector, AmqpDeliveryStream, AmqpSession};
pub use config::{
    redact_url, BrokerBackend, BrokerConfig, TransportSecurity, CONSUMER_PREFETCH, DEFAULT_BROKER_URL,
    MAIL_QUEUE,
};
pub use consumer::{
    ConsumerSettings, ConsumerState, ConsumerSummary, LoggingHandler, MessageHandler,
    QueueConsumer,
};
pub use drain::FilteredDrain;
pub use envelope::{
    format_timestamp, parse_timestamp, timestamp_now, MailEnvelope, CONTENT_TYPE_JSON,
    TIMESTAMP_FORMAT,
};
pub use error::{MessagingError, MessagingResult};
pub use memory::{
    BrokerEvent, InMemoryBroker, InMemoryDeliveryStream, InMemorySession, QueuedMessage,
    EVENT_LOG_CAPACITY,
};
pub use metrics::{MessagingMetrics, MESSAGING_METRICS};
pub use publisher::QueuePublisher;
pub use traits::{
    BrokerConnector, BrokerSession, Delivery, DeliveryStream, DeliveryTag, PublishProperties,
};

/// Build the connector selected by `config.backend`.
///
/// The in-memory backend gets a fresh broker, so it is only useful inside a
/// single process.
pub fn connector_from_config(config: &BrokerConfig) -> MessagingResult<Arc<dyn BrokerConnector>> {
    config.validate()?;
    match config.backend {
        BrokerBackend::Amqp => Ok(Arc::new(AmqpConnector::new(config.clone())?)),
        BrokerBackend::InMemory => Ok(Arc::new(InMemoryBroker::new())),
    }
}
