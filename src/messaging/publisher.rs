//! Queue publisher

use crate::messaging::envelope::MailEnvelope;
use crate::messaging::error::MessagingResult;
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::traits::{BrokerConnector, BrokerSession, PublishProperties};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Publishes envelopes to the durable mail queue.
///
/// Each call opens its own session and closes it before returning, so a
/// publisher can be shared between request handlers.
#[derive(Clone)]
pub struct QueuePublisher {
    connector: Arc<dyn BrokerConnector>,
    queue: String,
}

impl QueuePublisher {
    pub fn new(connector: Arc<dyn BrokerConnector>, queue: impl Into<String>) -> Self {
        Self {
            connector,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publish one envelope as a persistent JSON message.
    ///
    /// Fails with `Connection` when the broker is unreachable and `Publish`
    /// when the broker refuses the declare or the message.
    #[instrument(level = "info", skip(self, envelope), fields(queue = %self.queue, receiver_id = envelope.receiver_id))]
    pub async fn publish(&self, envelope: &MailEnvelope) -> MessagingResult<()> {
        let start = Instant::now();
        let result = self.publish_in_session(envelope).await;

        match &result {
            Ok(()) => {
                MESSAGING_METRICS
                    .messages_published
                    .with_label_values(&[self.queue.as_str()])
                    .inc();
                MESSAGING_METRICS
                    .publish_latency
                    .with_label_values(&[self.queue.as_str()])
                    .observe(start.elapsed().as_secs_f64());
                info!("Envelope published");
            }
            Err(e) => {
                MESSAGING_METRICS
                    .publish_failures
                    .with_label_values(&[self.queue.as_str(), e.kind()])
                    .inc();
                warn!(
                    error_kind = e.kind(),
                    error = %e,
                    endpoint = %self.connector.endpoint(),
                    "Publish failed"
                );
            }
        }
        result
    }

    async fn publish_in_session(&self, envelope: &MailEnvelope) -> MessagingResult<()> {
        let payload = envelope.encode()?;
        let session = self.connector.connect().await?;

        let result = self.publish_on(session.as_ref(), &payload).await;

        if let Err(e) = session.close().await {
            debug!(error = %e, "Failed to close publisher session");
        }
        result
    }

    async fn publish_on(&self, session: &dyn BrokerSession, payload: &[u8]) -> MessagingResult<()> {
        session
            .declare_queue(&self.queue, true)
            .await
            .map_err(|e| e.into_publish_failure())?;
        session
            .publish(&self.queue, payload, &PublishProperties::persistent_json())
            .await
            .map_err(|e| e.into_publish_failure())
    }
}
