use crate::messaging::MailEnvelope;
use serde::{Deserialize, Serialize};

/// Message history row handed to the relational store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub subject: String,
    pub content: String,
    pub timestamp: String,
}

impl From<&MailEnvelope> for MessageRecord {
    fn from(envelope: &MailEnvelope) -> Self {
        Self {
            sender_id: envelope.sender_id,
            receiver_id: envelope.receiver_id,
            subject: envelope.subject.clone(),
            content: envelope.content.clone(),
            timestamp: envelope.timestamp.clone(),
        }
    }
}

/// A persisted message with its store-assigned id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    #[serde(flatten)]
    pub record: MessageRecord,
}

/// History entry enriched with the sender's display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub sender_name: String,
    pub subject: String,
    pub content: String,
    pub timestamp: String,
}
