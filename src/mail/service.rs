use crate::config::Config;
use crate::error::{AppError, Result};
use crate::messaging::{
    connector_from_config, parse_timestamp, BrokerConnector, FilteredDrain, MailEnvelope,
    QueuePublisher,
};
use crate::models::{InboxEntry, MessageRecord, StoredMessage, User};
use crate::state::{InMemoryMessageStore, InMemoryUserDirectory, MessageStore, UserDirectory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A mail submitted on the request path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub sender_email: String,
    pub receiver_email: String,
    pub subject: String,
    pub content: String,
    /// `YYYY-MM-DD HH:MM:SS`, defaults to local now
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Outcome of a send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// The persisted history row
    pub message: StoredMessage,
    /// Whether the envelope also reached the queue
    pub queued: bool,
}

/// Request-path boundary: persistence first, then the queue
pub struct MailService {
    users: Arc<dyn UserDirectory>,
    store: Arc<dyn MessageStore>,
    publisher: QueuePublisher,
    drain: FilteredDrain,
}

impl MailService {
    /// Create a new mail service
    pub fn new(
        users: Arc<dyn UserDirectory>,
        store: Arc<dyn MessageStore>,
        connector: Arc<dyn BrokerConnector>,
        queue: &str,
    ) -> Self {
        Self {
            users,
            store,
            publisher: QueuePublisher::new(Arc::clone(&connector), queue),
            drain: FilteredDrain::new(connector, queue),
        }
    }

    /// Build a service from configuration: users from `storage.users_file`,
    /// a fresh in-memory message store and the configured broker backend.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let users = InMemoryUserDirectory::load_json(&config.storage.users_file).await?;
        let connector = connector_from_config(&config.broker)?;
        Ok(Self::new(
            Arc::new(users),
            Arc::new(InMemoryMessageStore::new()),
            connector,
            &config.broker.queue,
        ))
    }

    /// Persist a mail and publish it to the queue.
    ///
    /// A storage failure is returned and nothing is published. A publish
    /// failure is logged and reported through [`SendReceipt::queued`] only.
    pub async fn send(&self, mail: OutgoingMail) -> Result<SendReceipt> {
        let sender = self.resolve(&mail.sender_email).await?;
        let receiver = self.resolve(&mail.receiver_email).await?;

        let sent_at = match mail.timestamp.as_deref() {
            Some(value) => {
                parse_timestamp(value).map_err(|e| AppError::Validation(e.to_string()))?
            }
            None => chrono::Local::now().naive_local(),
        };

        let envelope = MailEnvelope::new(&sender, &receiver, mail.subject, mail.content, sent_at);
        let message = self
            .store
            .persist_message(&MessageRecord::from(&envelope))
            .await?;

        let queued = match self.publisher.publish(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    message_id = message.id,
                    error_kind = e.kind(),
                    error = %e,
                    "Mail saved but not queued"
                );
                false
            }
        };

        info!(
            message_id = message.id,
            sender_id = sender.id,
            receiver_id = receiver.id,
            queued,
            "Mail sent"
        );
        Ok(SendReceipt { message, queued })
    }

    /// History for a user from the message store, newest first
    pub async fn inbox(&self, email: &str) -> Result<Vec<InboxEntry>> {
        let user = self.resolve(email).await?;
        let messages = self.store.messages_for_receiver(user.id).await?;

        let mut entries = Vec::with_capacity(messages.len());
        for message in messages {
            let record = message.record;
            match self.users.user_by_id(record.sender_id).await? {
                Some(sender) => entries.push(InboxEntry {
                    sender_name: sender.name,
                    subject: record.subject,
                    content: record.content,
                    timestamp: record.timestamp,
                }),
                None => debug!(
                    message_id = message.id,
                    sender_id = record.sender_id,
                    "Skipping message from unknown sender"
                ),
            }
        }
        Ok(entries)
    }

    /// Pull the queued envelopes addressed to a user without waiting
    pub async fn drain_pending(&self, email: &str) -> Result<Vec<MailEnvelope>> {
        let user = self.resolve(email).await?;
        Ok(self.drain.drain_for_receiver(user.id).await?)
    }

    async fn resolve(&self, email: &str) -> Result<User> {
        self.users
            .user_by_email(email)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", email)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{InMemoryBroker, MAIL_QUEUE};

    fn service(broker: &InMemoryBroker, store: &InMemoryMessageStore) -> MailService {
        let users = InMemoryUserDirectory::from_users([
            User::new(1, "Ayşe", "ayse@example.com"),
            User::new(2, "Mehmet", "mehmet@example.com"),
        ]);
        MailService::new(
            Arc::new(users),
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            MAIL_QUEUE,
        )
    }

    fn mail(timestamp: Option<&str>) -> OutgoingMail {
        OutgoingMail {
            sender_email: "ayse@example.com".to_string(),
            receiver_email: "mehmet@example.com".to_string(),
            subject: "Hi".to_string(),
            content: "Test".to_string(),
            timestamp: timestamp.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_send_defaults_timestamp() {
        let broker = InMemoryBroker::new();
        let store = InMemoryMessageStore::new();
        let receipt = service(&broker, &store).send(mail(None)).await.unwrap();

        assert!(receipt.queued);
        assert!(parse_timestamp(&receipt.message.record.timestamp).is_ok());
        assert_eq!(broker.ready_count(MAIL_QUEUE), 1);
    }

    #[tokio::test]
    async fn test_send_rejects_malformed_timestamp() {
        let broker = InMemoryBroker::new();
        let store = InMemoryMessageStore::new();
        let err = service(&broker, &store)
            .send(mail(Some("2024-01-01T10:00:00Z")))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(store.is_empty());
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let broker = InMemoryBroker::new();
        let store = InMemoryMessageStore::new();
        let mut outgoing = mail(None);
        outgoing.receiver_email = "nobody@example.com".to_string();

        let err = service(&broker, &store).send(outgoing).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
