//! AMQP 0-9-1 transport (RabbitMQ) backed by lapin

use crate::messaging::config::BrokerConfig;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::traits::{
    BrokerConnector, BrokerSession, Delivery, DeliveryStream, DeliveryTag, PublishProperties,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, protocol::AMQPErrorKind, types::FieldTable, BasicProperties, Channel,
    ChannelState, Connection, ConnectionProperties,
};
use tracing::{debug, instrument};

const REPLY_SUCCESS: u16 = 200;

/// AMQP delivery-mode value that asks the broker to persist the message
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// Opens AMQP sessions to the configured broker URL.
///
/// `amqp://` URLs use plaintext TCP, `amqps://` URLs use TLS.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    /// Create a connector, rejecting unsupported URL schemes up front
    pub fn new(config: BrokerConfig) -> MessagingResult<Self> {
        config.transport()?;
        Ok(Self { config })
    }

    async fn open_channel(&self, connection: &Connection) -> MessagingResult<Channel> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| classify("amqp channel", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify("amqp confirm select", e))?;
        Ok(channel)
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    #[instrument(level = "debug", skip(self), fields(endpoint = %self.config.redacted_url()))]
    async fn connect(&self) -> MessagingResult<Box<dyn BrokerSession>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.config.connection_name.clone().into());

        let connection = Connection::connect(&self.config.url, properties)
            .await
            .map_err(|e| {
                MessagingError::Connection(format!(
                    "amqp connect to {}: {}",
                    self.config.redacted_url(),
                    e
                ))
            })?;

        match self.open_channel(&connection).await {
            Ok(channel) => {
                debug!("AMQP session opened");
                Ok(Box::new(AmqpSession { connection, channel }))
            }
            Err(e) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "channel setup failed").await {
                    debug!(error = %close_err, "Failed to close connection after channel setup error");
                }
                Err(e)
            }
        }
    }

    fn endpoint(&self) -> String {
        self.config.redacted_url()
    }
}

/// One AMQP connection with a single channel
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_queue(&self, queue: &str, durable: bool) -> MessagingResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify("amqp declare", e))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> MessagingResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| classify("amqp qos", e))
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()> {
        let delivery_mode = if properties.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };
        let amqp_properties = BasicProperties::default()
            .with_delivery_mode(delivery_mode)
            .with_content_type(properties.content_type.clone().into());

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                amqp_properties,
            )
            .await
            .map_err(|e| classify("amqp publish", e))?;

        let confirmation = confirm
            .await
            .map_err(|e| classify("amqp publish confirm", e))?;
        if confirmation.is_nack() {
            return Err(MessagingError::Publish(format!(
                "broker refused message for queue '{}'",
                queue
            )));
        }
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> MessagingResult<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions::default())
            .await
            .map_err(|e| classify("amqp get", e))?;

        Ok(message.map(|m| Delivery {
            tag: DeliveryTag(m.delivery.delivery_tag),
            payload: m.delivery.data,
            redelivered: m.delivery.redelivered,
        }))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> MessagingResult<Box<dyn DeliveryStream>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify("amqp consume", e))?;
        Ok(Box::new(AmqpDeliveryStream { consumer }))
    }

    async fn ack(&self, tag: DeliveryTag) -> MessagingResult<()> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions::default())
            .await
            .map_err(|e| classify("amqp ack", e))
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> MessagingResult<()> {
        self.channel
            .basic_nack(
                tag.0,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify("amqp nack", e))
    }

    async fn close(&self) -> MessagingResult<()> {
        let channel_result = self
            .channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| classify("amqp channel close", e));
        let connection_result = self
            .connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| classify("amqp connection close", e));
        channel_result.and(connection_result)
    }
}

/// Push deliveries from a lapin consumer
pub struct AmqpDeliveryStream {
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> MessagingResult<Option<Delivery>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                tag: DeliveryTag(delivery.delivery_tag),
                payload: delivery.data,
                redelivered: delivery.redelivered,
            })),
            Some(Err(e)) => Err(classify("amqp delivery", e)),
            None => Ok(None),
        }
    }
}

/// Split lapin errors into transport loss and channel-level refusals.
///
/// A channel that is closing, closed or errored because its connection went
/// away, a hard (connection-level) protocol close and a missed heartbeat all
/// count as transport loss.
fn classify(context: &str, err: lapin::Error) -> MessagingError {
    let transport_lost = match &err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError => true,
        lapin::Error::InvalidChannelState(state) => matches!(
            state,
            ChannelState::Closing | ChannelState::Closed | ChannelState::Error
        ),
        lapin::Error::ProtocolError(amqp) => matches!(amqp.kind(), AMQPErrorKind::Hard(_)),
        _ => false,
    };

    if transport_lost {
        MessagingError::Connection(format!("{}: {}", context, err))
    } else {
        MessagingError::Channel(format!("{}: {}", context, err))
    }
}
