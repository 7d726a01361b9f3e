//! Mail envelope carried through the queue

use crate::messaging::error::{MessagingError, MessagingResult};
use crate::models::User;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Wire and display format of envelope timestamps
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Content type sent with every publish
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The structured message record transported through the queue.
///
/// Decoding is strict: every field must be present with the right type and
/// the timestamp must match [`TIMESTAMP_FORMAT`]. Unknown extra fields are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailEnvelope {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub sender_email: String,
    pub receiver_email: String,
    pub subject: String,
    pub content: String,
    pub timestamp: String,
}

impl MailEnvelope {
    /// Build an envelope between two resolved users
    pub fn new(
        sender: &User,
        receiver: &User,
        subject: impl Into<String>,
        content: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            sender_id: sender.id,
            receiver_id: receiver.id,
            sender_email: sender.email.clone(),
            receiver_email: receiver.email.clone(),
            subject: subject.into(),
            content: content.into(),
            timestamp: format_timestamp(&timestamp),
        }
    }

    /// Serialize to the JSON wire format
    pub fn encode(&self) -> MessagingResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MessagingError::Publish(format!("encode envelope: {}", e)))
    }

    /// Parse a wire payload, rejecting anything that is not a complete envelope
    pub fn decode(payload: &[u8]) -> MessagingResult<Self> {
        let envelope: MailEnvelope = serde_json::from_slice(payload)?;
        parse_timestamp(&envelope.timestamp)?;
        Ok(envelope)
    }

    /// Parsed form of the timestamp field
    pub fn sent_at(&self) -> MessagingResult<NaiveDateTime> {
        parse_timestamp(&self.timestamp)
    }
}

/// Render a timestamp in the envelope format
pub fn format_timestamp(timestamp: &NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Current local time in the envelope format
pub fn timestamp_now() -> String {
    format_timestamp(&chrono::Local::now().naive_local())
}

/// Parse a `YYYY-MM-DD HH:MM:SS` timestamp
pub fn parse_timestamp(value: &str) -> MessagingResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).map_err(|e| {
        MessagingError::Decode(format!("timestamp '{}' is not {}: {}", value, TIMESTAMP_FORMAT, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MailEnvelope {
        MailEnvelope {
            sender_id: 1,
            receiver_id: 2,
            sender_email: "ayse@example.com".to_string(),
            receiver_email: "mehmet@example.com".to_string(),
            subject: "Hi".to_string(),
            content: "Test".to_string(),
            timestamp: "2024-01-01 10:00:00".to_string(),
        }
    }

    #[test]
    fn test_wire_field_names() {
        let value: serde_json::Value = serde_json::from_slice(&sample().encode().unwrap()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "content",
                "receiver_email",
                "receiver_id",
                "sender_email",
                "sender_id",
                "subject",
                "timestamp"
            ]
        );
        assert_eq!(value["sender_id"], json!(1));
    }

    #[test]
    fn test_decode_from_foreign_producer() {
        let payload = br#"{"sender_id": 1, "receiver_id": 2, "sender_email": "ayse@example.com",
            "receiver_email": "mehmet@example.com", "subject": "Hi", "content": "Test",
            "timestamp": "2024-01-01 10:00:00"}"#;
        assert_eq!(MailEnvelope::decode(payload).unwrap(), sample());
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let payload = br#"{"sender_id": 1, "receiver_id": 2, "subject": "Hi", "content": "Test",
            "timestamp": "2024-01-01 10:00:00"}"#;
        let err = MailEnvelope::decode(payload).unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_decode_rejects_wrong_types_and_garbage() {
        let payload = br#"{"sender_id": "1", "receiver_id": 2, "sender_email": "a", "receiver_email": "b",
            "subject": "Hi", "content": "Test", "timestamp": "2024-01-01 10:00:00"}"#;
        assert!(MailEnvelope::decode(payload).is_err());
        assert!(MailEnvelope::decode(b"not json").is_err());
        assert!(MailEnvelope::decode(b"").is_err());
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        let mut envelope = sample();
        envelope.timestamp = "2024-01-01T10:00:00Z".to_string();
        let payload = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(
            MailEnvelope::decode(&payload),
            Err(MessagingError::Decode(_))
        ));
    }

    #[test]
    fn test_new_formats_timestamp() {
        let sender = User::new(1, "Ayşe", "ayse@example.com");
        let receiver = User::new(2, "Mehmet", "mehmet@example.com");
        let at = parse_timestamp("2024-01-01 10:00:00").unwrap();
        let envelope = MailEnvelope::new(&sender, &receiver, "Hi", "Test", at);
        assert_eq!(envelope, sample());
        assert_eq!(envelope.sent_at().unwrap(), at);
    }

    #[test]
    fn test_timestamp_now_round_trips_format() {
        assert!(parse_timestamp(&timestamp_now()).is_ok());
    }
}
