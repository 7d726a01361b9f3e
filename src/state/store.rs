use crate::error::{AppError, Result};
use crate::models::{MessageRecord, StoredMessage};
use crate::state::MessageStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// In-memory message store (for local runs and testing)
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    messages: Arc<DashMap<i64, StoredMessage>>,
    next_id: Arc<AtomicI64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating a database outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist_message(&self, record: &MessageRecord) -> Result<StoredMessage> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Storage("message store is unavailable".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = StoredMessage {
            id,
            record: record.clone(),
        };
        self.messages.insert(id, stored.clone());

        tracing::debug!(message_id = id, receiver_id = record.receiver_id, "Message saved");
        Ok(stored)
    }

    async fn messages_for_receiver(&self, receiver_id: i64) -> Result<Vec<StoredMessage>> {
        let mut messages: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|entry| entry.record.receiver_id == receiver_id)
            .map(|entry| entry.value().clone())
            .collect();

        // Fixed-width timestamps sort lexically; id breaks ties.
        messages.sort_by(|a, b| {
            b.record
                .timestamp
                .cmp(&a.record.timestamp)
                .then(b.id.cmp(&a.id))
        });
        Ok(messages)
    }
}
