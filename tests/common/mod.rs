//! Common test utilities for the queue integration tests
//!
//! Envelope builders, a recording processing hook and polling helpers shared
//! by the consumer, drain and mail service tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mail_relay::messaging::{
    BrokerEvent, ConsumerSettings, InMemoryBroker, MailEnvelope, MessageHandler, MAIL_QUEUE,
};
use mail_relay::models::User;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub fn ayse() -> User {
    User::new(1, "Ayşe", "ayse@example.com")
}

pub fn mehmet() -> User {
    User::new(2, "Mehmet", "mehmet@example.com")
}

pub fn zeynep() -> User {
    User::new(3, "Zeynep", "zeynep@example.com")
}

/// Envelope from user 1 to `receiver_id`
pub fn envelope(receiver_id: i64, subject: &str) -> MailEnvelope {
    MailEnvelope {
        sender_id: 1,
        receiver_id,
        sender_email: "ayse@example.com".to_string(),
        receiver_email: format!("user{}@example.com", receiver_id),
        subject: subject.to_string(),
        content: "Test".to_string(),
        timestamp: "2024-01-01 10:00:00".to_string(),
    }
}

pub fn settings(reconnect_delay: Duration) -> ConsumerSettings {
    ConsumerSettings {
        queue: MAIL_QUEUE.to_string(),
        prefetch: 1,
        reconnect_delay,
        consumer_tag: "mail-relay-test".to_string(),
    }
}

/// Processing hook that records every envelope it sees.
///
/// Fails on subject `"fail"` and panics on subject `"panic"`.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<MailEnvelope>>>,
}

impl RecordingHandler {
    pub fn subjects(&self) -> Vec<String> {
        self.seen.lock().iter().map(|e| e.subject.clone()).collect()
    }

    pub fn envelopes(&self) -> Vec<MailEnvelope> {
        self.seen.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, envelope: &MailEnvelope) -> anyhow::Result<()> {
        self.seen.lock().push(envelope.clone());
        match envelope.subject.as_str() {
            "fail" => anyhow::bail!("cannot process '{}'", envelope.subject),
            "panic" => panic!("hook blew up"),
            _ => Ok(()),
        }
    }
}

/// Hook that never finishes, for cancelling mid-delivery
#[derive(Clone, Default)]
pub struct StuckHandler;

#[async_trait]
impl MessageHandler for StuckHandler {
    async fn handle(&self, _envelope: &MailEnvelope) -> anyhow::Result<()> {
        futures::future::pending::<()>().await;
        Ok(())
    }
}

/// Poll `condition` every few milliseconds, failing the test after 10 s
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

pub fn count_events(broker: &InMemoryBroker, matches: impl Fn(&BrokerEvent) -> bool) -> usize {
    broker.events().iter().filter(|e| matches(e)).count()
}

pub fn acked(broker: &InMemoryBroker) -> usize {
    count_events(broker, |e| matches!(e, BrokerEvent::Acked { .. }))
}

pub fn rejected(broker: &InMemoryBroker, requeue: bool) -> usize {
    count_events(broker, |e| matches!(e, BrokerEvent::Rejected { requeue: r, .. } if *r == requeue))
}
