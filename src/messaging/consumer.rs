//! Queue consumer loop
//!
//! ```text
//!   DISCONNECTED ──connect, declare, qos──▶ CONNECTED ──consume──▶ CONSUMING
//!        ▲                                                            │
//!        └────────────── transport error, sleep backoff ◀─────────────┘
//!
//!   any state ──shutdown token──▶ STOPPED
//! ```
//!
//! One consumer per process, one unacknowledged delivery at a time. Deliveries
//! that fail to decode or whose hook fails are rejected without requeue so a
//! poison message is never retried.

use crate::messaging::config::{BrokerConfig, CONSUMER_PREFETCH};
use crate::messaging::envelope::MailEnvelope;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::traits::{BrokerConnector, BrokerSession, Delivery};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connected,
    Consuming,
    Stopped,
}

impl ConsumerState {
    /// Numeric value for the Prometheus gauge
    pub fn to_metric_value(&self) -> f64 {
        match self {
            ConsumerState::Disconnected => 0.0,
            ConsumerState::Connected => 1.0,
            ConsumerState::Consuming => 2.0,
            ConsumerState::Stopped => 3.0,
        }
    }
}

/// Processing hook invoked once per decoded envelope
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// An error (or panic) rejects the delivery without requeue
    async fn handle(&self, envelope: &MailEnvelope) -> anyhow::Result<()>;
}

/// Hook that writes the human-readable envelope fields to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, envelope: &MailEnvelope) -> anyhow::Result<()> {
        info!(
            sender = %envelope.sender_email,
            receiver = %envelope.receiver_email,
            subject = %envelope.subject,
            content = %envelope.content,
            "Mail received"
        );
        Ok(())
    }
}

/// Consumer settings taken from the broker configuration.
///
/// The prefetch is always [`CONSUMER_PREFETCH`]; `BrokerConfig::validate`
/// refuses any other configured value.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub prefetch: u16,
    pub reconnect_delay: Duration,
    pub consumer_tag: String,
}

impl From<&BrokerConfig> for ConsumerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            prefetch: CONSUMER_PREFETCH,
            reconnect_delay: config.reconnect_delay(),
            consumer_tag: format!("{}-{}", config.connection_name, uuid::Uuid::new_v4()),
        }
    }
}

/// Totals reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub sessions_opened: u64,
    pub acknowledged: u64,
    pub rejected: u64,
}

/// Long-lived consumer of the mail queue
pub struct QueueConsumer<H: MessageHandler> {
    connector: Arc<dyn BrokerConnector>,
    handler: H,
    settings: ConsumerSettings,
    state: watch::Sender<ConsumerState>,
}

impl<H: MessageHandler> QueueConsumer<H> {
    pub fn new(connector: Arc<dyn BrokerConnector>, handler: H, settings: ConsumerSettings) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            connector,
            handler,
            settings,
            state,
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Run until `shutdown` is cancelled, reconnecting after every transport
    /// failure.
    pub async fn run(&self, shutdown: CancellationToken) -> ConsumerSummary {
        let mut summary = ConsumerSummary::default();
        info!(
            queue = %self.settings.queue,
            endpoint = %self.connector.endpoint(),
            "Consumer starting"
        );

        while !shutdown.is_cancelled() {
            self.transition(ConsumerState::Disconnected);

            match self.run_session(&shutdown, &mut summary).await {
                Ok(()) => break,
                Err(e) => {
                    self.transition(ConsumerState::Disconnected);
                    MESSAGING_METRICS
                        .consumer_reconnects
                        .with_label_values(&[self.settings.queue.as_str()])
                        .inc();
                    warn!(
                        error_kind = e.kind(),
                        error = %e,
                        retry_in_secs = self.settings.reconnect_delay.as_secs_f64(),
                        "Consumer session lost, reconnecting"
                    );

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                    }
                }
            }
        }

        self.transition(ConsumerState::Stopped);
        info!(
            sessions = summary.sessions_opened,
            acknowledged = summary.acknowledged,
            rejected = summary.rejected,
            "Consumer stopped"
        );
        summary
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Consumer state changed");
        }
        MESSAGING_METRICS
            .consumer_state
            .with_label_values(&[self.settings.queue.as_str()])
            .set(next.to_metric_value());
    }

    /// One connect-consume cycle. `Ok` only when shutdown was requested.
    async fn run_session(
        &self,
        shutdown: &CancellationToken,
        summary: &mut ConsumerSummary,
    ) -> MessagingResult<()> {
        let session = self.connector.connect().await?;
        summary.sessions_opened += 1;

        let result = self.consume_on(session.as_ref(), shutdown, summary).await;

        if let Err(e) = session.close().await {
            debug!(error = %e, "Failed to close consumer session");
        }
        result
    }

    async fn consume_on(
        &self,
        session: &dyn BrokerSession,
        shutdown: &CancellationToken,
        summary: &mut ConsumerSummary,
    ) -> MessagingResult<()> {
        session.declare_queue(&self.settings.queue, true).await?;
        session.set_prefetch(self.settings.prefetch).await?;
        self.transition(ConsumerState::Connected);

        let mut deliveries = session
            .consume(&self.settings.queue, &self.settings.consumer_tag)
            .await?;
        self.transition(ConsumerState::Consuming);
        info!(queue = %self.settings.queue, "Waiting for messages");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                next = deliveries.next_delivery() => next?,
            };

            let Some(delivery) = next else {
                return Err(MessagingError::Connection(
                    "delivery stream closed by broker".to_string(),
                ));
            };

            // Cancelling mid-delivery leaves it unacknowledged; the broker
            // redelivers it once the session is closed.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                settled = self.settle(session, delivery, summary) => settled?,
            }
        }
    }

    /// Decode, run the hook, then ack or reject. Errors returned here are
    /// transport failures on the ack/reject itself.
    async fn settle(
        &self,
        session: &dyn BrokerSession,
        delivery: Delivery,
        summary: &mut ConsumerSummary,
    ) -> MessagingResult<()> {
        let outcome = match MailEnvelope::decode(&delivery.payload) {
            Ok(envelope) => self.invoke_handler(&envelope).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                session.ack(delivery.tag).await?;
                summary.acknowledged += 1;
                MESSAGING_METRICS
                    .messages_acknowledged
                    .with_label_values(&[self.settings.queue.as_str()])
                    .inc();
                debug!(delivery_tag = %delivery.tag, "Delivery acknowledged");
            }
            Err(e) => {
                session.reject(delivery.tag, false).await?;
                summary.rejected += 1;
                MESSAGING_METRICS
                    .messages_rejected
                    .with_label_values(&[self.settings.queue.as_str(), e.kind(), "false"])
                    .inc();
                error!(
                    delivery_tag = %delivery.tag,
                    redelivered = delivery.redelivered,
                    error_kind = e.kind(),
                    error = %e,
                    "Delivery rejected without requeue"
                );
            }
        }
        Ok(())
    }

    async fn invoke_handler(&self, envelope: &MailEnvelope) -> MessagingResult<()> {
        match AssertUnwindSafe(self.handler.handle(envelope))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MessagingError::Processing(format!("{:#}", e))),
            Err(panic) => Err(MessagingError::Processing(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
