pub mod store;
pub mod users;

pub use store::InMemoryMessageStore;
pub use users::InMemoryUserDirectory;

use crate::error::Result;
use crate::models::{MessageRecord, StoredMessage, User};
use async_trait::async_trait;

/// Read access to registered users
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a user by email address
    async fn user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Look up a user by id
    async fn user_by_id(&self, id: i64) -> Result<Option<User>>;
}

/// Durable message history, the system of record for sent mail
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, failing with `AppError::Storage`
    async fn persist_message(&self, record: &MessageRecord) -> Result<StoredMessage>;

    /// All messages addressed to a receiver, newest first
    async fn messages_for_receiver(&self, receiver_id: i64) -> Result<Vec<StoredMessage>>;
}
