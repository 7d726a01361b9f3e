//! Filtered drain
//!
//! Scans the whole queue with single non-blocking fetches and takes only the
//! envelopes that match a predicate. Everything else goes back to the queue.
//!
//! Non-matching deliveries stay unacknowledged on the drain's session until a
//! fetch reports the queue empty, and only then are they rejected with requeue.
//! A broker requeues to the original position, so rejecting them straight away
//! would hand the same message back on the next fetch.
//!
//! Known limit: every call walks the full queue depth, and a head-of-line entry
//! nobody matches is revisited on every drain.

use crate::messaging::envelope::MailEnvelope;
use crate::messaging::error::MessagingResult;
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::traits::{BrokerConnector, BrokerSession, DeliveryTag};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Filtered, non-blocking reader of the mail queue
#[derive(Clone)]
pub struct FilteredDrain {
    connector: Arc<dyn BrokerConnector>,
    queue: String,
}

#[derive(Debug, Default)]
struct Scan {
    matched: Vec<(DeliveryTag, MailEnvelope)>,
    held: Vec<DeliveryTag>,
    poisoned: usize,
}

impl FilteredDrain {
    pub fn new(connector: Arc<dyn BrokerConnector>, queue: impl Into<String>) -> Self {
        Self {
            connector,
            queue: queue.into(),
        }
    }

    /// Take every queued envelope addressed to `receiver_id`
    pub async fn drain_for_receiver(&self, receiver_id: i64) -> MessagingResult<Vec<MailEnvelope>> {
        self.drain_matching(|envelope| envelope.receiver_id == receiver_id)
            .await
    }

    /// Take every queued envelope for which `predicate` holds, in queue order.
    ///
    /// Opens its own session and closes it before returning. A transport
    /// failure part way through leaves every unsettled delivery on the queue.
    #[instrument(level = "info", skip(self, predicate), fields(queue = %self.queue))]
    pub async fn drain_matching<P>(&self, predicate: P) -> MessagingResult<Vec<MailEnvelope>>
    where
        P: Fn(&MailEnvelope) -> bool + Send + Sync,
    {
        let result = self.drain_in_session(&predicate).await;

        match &result {
            Ok(envelopes) => {
                MESSAGING_METRICS
                    .messages_drained
                    .with_label_values(&[self.queue.as_str()])
                    .inc_by(envelopes.len() as f64);
                info!(drained = envelopes.len(), "Drain complete");
            }
            Err(e) => {
                warn!(
                    error_kind = e.kind(),
                    error = %e,
                    endpoint = %self.connector.endpoint(),
                    "Drain failed"
                );
            }
        }
        result
    }

    async fn drain_in_session<P>(&self, predicate: &P) -> MessagingResult<Vec<MailEnvelope>>
    where
        P: Fn(&MailEnvelope) -> bool + Send + Sync,
    {
        let session = self.connector.connect().await?;

        let result = self.drain_on(session.as_ref(), predicate).await;

        if let Err(e) = session.close().await {
            debug!(error = %e, "Failed to close drain session");
        }
        result
    }

    async fn drain_on<P>(
        &self,
        session: &dyn BrokerSession,
        predicate: &P,
    ) -> MessagingResult<Vec<MailEnvelope>>
    where
        P: Fn(&MailEnvelope) -> bool + Send + Sync,
    {
        session.declare_queue(&self.queue, true).await?;

        let mut scan = Scan::default();
        while let Some(delivery) = session.fetch(&self.queue).await? {
            match MailEnvelope::decode(&delivery.payload) {
                Ok(envelope) if predicate(&envelope) => scan.matched.push((delivery.tag, envelope)),
                Ok(_) => scan.held.push(delivery.tag),
                Err(e) => {
                    session.reject(delivery.tag, false).await?;
                    scan.poisoned += 1;
                    MESSAGING_METRICS
                        .messages_rejected
                        .with_label_values(&[self.queue.as_str(), e.kind(), "false"])
                        .inc();
                    warn!(
                        delivery_tag = %delivery.tag,
                        error_kind = e.kind(),
                        error = %e,
                        "Undecodable delivery rejected without requeue"
                    );
                }
            }
        }

        debug!(
            matched = scan.matched.len(),
            requeued = scan.held.len(),
            poisoned = scan.poisoned,
            "Queue scan reached empty"
        );

        // Requeue first: if an ack fails below, the remaining matches are
        // still unacknowledged and return to the queue when the session closes.
        for tag in scan.held {
            session.reject(tag, true).await?;
        }

        let mut envelopes = Vec::with_capacity(scan.matched.len());
        for (tag, envelope) in scan.matched {
            session.ack(tag).await?;
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }
}
