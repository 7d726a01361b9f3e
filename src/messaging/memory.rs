//! In-process broker
//!
//! Mirrors the AMQP behaviour the queue layer relies on: declare-if-absent
//! durable queues, per-session prefetch limits, requeue at the original
//! position, and redelivery of everything a session left unacknowledged when it
//! closes or drops. Fault hooks (`refuse_connections`, `sever_all_sessions`)
//! let tests drive the reconnect path.
//!
//! Closed sessions are forgotten and the event log keeps only the most recent
//! [`EVENT_LOG_CAPACITY`] entries, so a long-running local consumer does not
//! grow without bound.

use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::traits::{
    BrokerConnector, BrokerSession, Delivery, DeliveryStream, DeliveryTag, PublishProperties,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Number of broker events retained, oldest dropped first
pub const EVENT_LOG_CAPACITY: usize = 4096;

/// Observable broker-side event, recorded in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Published { queue: String, persistent: bool },
    Unroutable { queue: String },
    Delivered { queue: String, tag: DeliveryTag, redelivered: bool },
    Acked { tag: DeliveryTag },
    Rejected { tag: DeliveryTag, requeue: bool },
    SessionClosed { session: u64 },
    SessionSevered { session: u64 },
}

/// A message waiting in a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Open,
    ChannelClosed,
    Severed,
    Closed,
}

#[derive(Debug)]
struct SessionState {
    prefetch: u16,
    status: SessionStatus,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    message: QueuedMessage,
}

#[derive(Debug)]
struct InFlight {
    session: u64,
    via_consumer: bool,
    stored: StoredMessage,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<DeliveryTag, InFlight>,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
        }
    }

    /// Put a message back where it was, ahead of anything published after it
    fn requeue(&mut self, mut stored: StoredMessage) {
        stored.message.redelivered = true;
        let position = self
            .ready
            .iter()
            .position(|m| m.seq > stored.seq)
            .unwrap_or(self.ready.len());
        self.ready.insert(position, stored);
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    sessions: HashMap<u64, SessionState>,
    tag_owner: HashMap<DeliveryTag, String>,
    next_session: u64,
    next_tag: u64,
    next_seq: u64,
    refused_connects: usize,
    connect_attempts: u64,
    events: VecDeque<BrokerEvent>,
}

impl BrokerState {
    fn record(&mut self, event: BrokerEvent) {
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Release a session and drop its bookkeeping
    fn forget(&mut self, session: u64) {
        self.release(session, SessionStatus::Closed);
        self.sessions.remove(&session);
    }

    fn ensure_open(&self, session: u64) -> MessagingResult<()> {
        match self.sessions.get(&session).map(|s| s.status) {
            Some(SessionStatus::Open) => Ok(()),
            Some(SessionStatus::ChannelClosed) => {
                Err(MessagingError::Channel("channel already closed".to_string()))
            }
            Some(SessionStatus::Severed) => Err(MessagingError::Connection(
                "connection reset by broker".to_string(),
            )),
            Some(SessionStatus::Closed) | None => {
                Err(MessagingError::Connection("session is closed".to_string()))
            }
        }
    }

    /// End a session and return its unacknowledged deliveries to their queues
    fn release(&mut self, session: u64, status: SessionStatus) {
        let Some(state) = self.sessions.get_mut(&session) else {
            return;
        };
        if state.status != SessionStatus::Open {
            return;
        }
        state.status = status;

        for queue in self.queues.values_mut() {
            let owned: Vec<DeliveryTag> = queue
                .unacked
                .iter()
                .filter(|(_, in_flight)| in_flight.session == session)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in owned {
                if let Some(in_flight) = queue.unacked.remove(&tag) {
                    self.tag_owner.remove(&tag);
                    queue.requeue(in_flight.stored);
                }
            }
        }

        self.record(match status {
            SessionStatus::Severed => BrokerEvent::SessionSevered { session },
            _ => BrokerEvent::SessionClosed { session },
        });
    }

    /// A channel-level refusal closes the channel, like a real broker
    fn refuse(&mut self, session: u64, message: String) -> MessagingError {
        self.release(session, SessionStatus::ChannelClosed);
        MessagingError::Channel(message)
    }

    fn take_ready(
        &mut self,
        session: u64,
        queue_name: &str,
        via_consumer: bool,
    ) -> MessagingResult<Option<Delivery>> {
        let prefetch = self.sessions.get(&session).map_or(0, |s| s.prefetch);
        if !self.queues.contains_key(queue_name) {
            return Err(self.refuse(session, format!("NOT_FOUND - no queue '{}'", queue_name)));
        }
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Ok(None);
        };

        if via_consumer && prefetch > 0 {
            let held = queue
                .unacked
                .values()
                .filter(|f| f.session == session && f.via_consumer)
                .count();
            if held >= prefetch as usize {
                return Ok(None);
            }
        }

        let Some(stored) = queue.ready.pop_front() else {
            return Ok(None);
        };

        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        let delivery = Delivery {
            tag,
            payload: stored.message.payload.clone(),
            redelivered: stored.message.redelivered,
        };
        queue.unacked.insert(
            tag,
            InFlight {
                session,
                via_consumer,
                stored,
            },
        );
        self.tag_owner.insert(tag, queue_name.to_string());
        self.record(BrokerEvent::Delivered {
            queue: queue_name.to_string(),
            tag,
            redelivered: delivery.redelivered,
        });
        Ok(Some(delivery))
    }

    fn settle(&mut self, session: u64, tag: DeliveryTag, requeue: Option<bool>) -> MessagingResult<()> {
        let owner = self.tag_owner.get(&tag).cloned();
        let in_flight = match owner.as_deref() {
            Some(name) => self.queues.get_mut(name).and_then(|queue| {
                let owned = queue
                    .unacked
                    .get(&tag)
                    .is_some_and(|f| f.session == session);
                if owned {
                    queue.unacked.remove(&tag)
                } else {
                    None
                }
            }),
            None => None,
        };

        let Some(in_flight) = in_flight else {
            return Err(self.refuse(
                session,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", tag),
            ));
        };
        self.tag_owner.remove(&tag);

        match requeue {
            None => self.record(BrokerEvent::Acked { tag }),
            Some(requeue) => {
                self.record(BrokerEvent::Rejected { tag, requeue });
                if requeue {
                    if let Some(queue) = owner.as_deref().and_then(|name| self.queues.get_mut(name)) {
                        queue.requeue(in_flight.stored);
                    }
                }
            }
        }
        Ok(())
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

impl BrokerInner {
    fn mutate<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let result = f(&mut self.state.lock());
        self.changed.notify_waiters();
        result
    }
}

/// Shared in-process broker; clones refer to the same broker
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Make the next `count` connection attempts fail
    pub fn refuse_connections(&self, count: usize) {
        self.inner.state.lock().refused_connects = count;
    }

    /// Drop every open session as if the transport had failed
    pub fn sever_all_sessions(&self) -> usize {
        self.inner.mutate(|state| {
            let open: Vec<u64> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.status == SessionStatus::Open)
                .map(|(id, _)| *id)
                .collect();
            for id in &open {
                state.release(*id, SessionStatus::Severed);
            }
            open.len()
        })
    }

    /// Put a raw payload on a queue, declaring it durable if absent
    pub fn inject(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let payload = payload.into();
        self.inner.mutate(|state| {
            state.next_seq += 1;
            let seq = state.next_seq;
            state
                .queues
                .entry(queue.to_string())
                .or_insert_with(|| QueueState::new(true))
                .ready
                .push_back(StoredMessage {
                    seq,
                    message: QueuedMessage {
                        payload,
                        properties: PublishProperties::persistent_json(),
                        redelivered: false,
                    },
                });
        });
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.state.lock().connect_attempts
    }

    pub fn open_sessions(&self) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Open)
            .count()
    }

    /// Durability of a declared queue, `None` if never declared
    pub fn queue_durable(&self, queue: &str) -> Option<bool> {
        self.inner.state.lock().queues.get(queue).map(|q| q.durable)
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Snapshot of the ready messages, head first
    pub fn ready_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.inner.state.lock().events.iter().cloned().collect()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> MessagingResult<Box<dyn BrokerSession>> {
        let mut state = self.inner.state.lock();
        state.connect_attempts += 1;
        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(MessagingError::Connection(
                "connection refused by in-memory broker".to_string(),
            ));
        }

        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            SessionState {
                prefetch: 0,
                status: SessionStatus::Open,
            },
        );
        Ok(Box::new(InMemorySession {
            inner: Arc::clone(&self.inner),
            id,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

/// Session on the in-memory broker; dropping it behaves like a lost connection
pub struct InMemorySession {
    inner: Arc<BrokerInner>,
    id: u64,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_queue(&self, queue: &str, durable: bool) -> MessagingResult<()> {
        self.inner.mutate(|state| {
            state.ensure_open(self.id)?;
            let existing = state.queues.get(queue).map(|q| q.durable);
            match existing {
                Some(declared) if declared != durable => Err(state.refuse(
                    self.id,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                        queue
                    ),
                )),
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(queue.to_string(), QueueState::new(durable));
                    Ok(())
                }
            }
        })
    }

    async fn set_prefetch(&self, count: u16) -> MessagingResult<()> {
        self.inner.mutate(|state| {
            state.ensure_open(self.id)?;
            if let Some(session) = state.sessions.get_mut(&self.id) {
                session.prefetch = count;
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()> {
        self.inner.mutate(|state| {
            state.ensure_open(self.id)?;
            state.next_seq += 1;
            let seq = state.next_seq;
            match state.queues.get_mut(queue) {
                Some(q) => {
                    q.ready.push_back(StoredMessage {
                        seq,
                        message: QueuedMessage {
                            payload: payload.to_vec(),
                            properties: properties.clone(),
                            redelivered: false,
                        },
                    });
                    state.record(BrokerEvent::Published {
                        queue: queue.to_string(),
                        persistent: properties.persistent,
                    });
                }
                // Default exchange drops unroutable messages unless `mandatory` is set.
                None => state.record(BrokerEvent::Unroutable {
                    queue: queue.to_string(),
                }),
            }
            Ok(())
        })
    }

    async fn fetch(&self, queue: &str) -> MessagingResult<Option<Delivery>> {
        self.inner.mutate(|state| {
            state.ensure_open(self.id)?;
            state.take_ready(self.id, queue, false)
        })
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> MessagingResult<Box<dyn DeliveryStream>> {
        self.inner.mutate(|state| {
            state.ensure_open(self.id)?;
            if !state.queues.contains_key(queue) {
                return Err(state.refuse(self.id, format!("NOT_FOUND - no queue '{}'", queue)));
            }
            Ok(())
        })?;
        Ok(Box::new(InMemoryDeliveryStream {
            inner: Arc::clone(&self.inner),
            session: self.id,
            queue: queue.to_string(),
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> MessagingResult<()> {
        self.inner.mutate(|state| {
            state.ensure_open(self.id)?;
            state.settle(self.id, tag, None)
        })
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> MessagingResult<()> {
        self.inner.mutate(|state| {
            state.ensure_open(self.id)?;
            state.settle(self.id, tag, Some(requeue))
        })
    }

    async fn close(&self) -> MessagingResult<()> {
        self.inner.mutate(|state| {
            let result = match state.sessions.get(&self.id).map(|s| s.status) {
                Some(SessionStatus::Open) | Some(SessionStatus::ChannelClosed) => Ok(()),
                _ => Err(MessagingError::Connection("session is not open".to_string())),
            };
            state.forget(self.id);
            result
        })
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.inner.mutate(|state| state.forget(self.id));
    }
}

/// Deliveries for one consumer registration
pub struct InMemoryDeliveryStream {
    inner: Arc<BrokerInner>,
    session: u64,
    queue: String,
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    async fn next_delivery(&mut self) -> MessagingResult<Option<Delivery>> {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                match state.sessions.get(&self.session).map(|s| s.status) {
                    Some(SessionStatus::Open) => {}
                    Some(SessionStatus::Closed) | None => return Ok(None),
                    Some(_) => state.ensure_open(self.session)?,
                }
                if let Some(delivery) = state.take_ready(self.session, &self.queue, true)? {
                    return Ok(Some(delivery));
                }
            }

            changed.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "mail_queue";

    async fn open(broker: &InMemoryBroker) -> Box<dyn BrokerSession> {
        let session = broker.connect().await.unwrap();
        session.declare_queue(Q, true).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_declare_is_idempotent_and_checks_durability() {
        let broker = InMemoryBroker::new();
        let session = open(&broker).await;
        session.declare_queue(Q, true).await.unwrap();
        assert_eq!(broker.queue_durable(Q), Some(true));

        let err = session.declare_queue(Q, false).await.unwrap_err();
        assert_eq!(err.kind(), "channel");
        // channel is gone after the refusal
        assert!(session.fetch(Q).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_ack_and_requeue_position() {
        let broker = InMemoryBroker::new();
        let session = open(&broker).await;
        let props = PublishProperties::persistent_json();
        for body in [b"a", b"b", b"c"] {
            session.publish(Q, body, &props).await.unwrap();
        }

        let a = session.fetch(Q).await.unwrap().unwrap();
        let b = session.fetch(Q).await.unwrap().unwrap();
        session.reject(a.tag, true).await.unwrap();
        session.ack(b.tag).await.unwrap();

        let payloads: Vec<_> = broker.ready_messages(Q).into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"c".to_vec()]);
        assert!(broker.ready_messages(Q)[0].redelivered);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_discards() {
        let broker = InMemoryBroker::new();
        let session = open(&broker).await;
        session
            .publish(Q, b"x", &PublishProperties::persistent_json())
            .await
            .unwrap();
        let d = session.fetch(Q).await.unwrap().unwrap();
        session.reject(d.tag, false).await.unwrap();
        assert_eq!(broker.ready_count(Q), 0);
        assert_eq!(broker.unacked_count(Q), 0);
        assert!(session.fetch(Q).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_tag_is_channel_error() {
        let broker = InMemoryBroker::new();
        let session = open(&broker).await;
        let err = session.ack(DeliveryTag(42)).await.unwrap_err();
        assert_eq!(err.kind(), "channel");
    }

    #[tokio::test]
    async fn test_close_and_drop_requeue_unacked() {
        let broker = InMemoryBroker::new();
        broker.inject(Q, b"one".to_vec());
        broker.inject(Q, b"two".to_vec());

        let session = open(&broker).await;
        session.fetch(Q).await.unwrap().unwrap();
        session.close().await.unwrap();
        assert_eq!(broker.ready_count(Q), 2);

        let session = open(&broker).await;
        session.fetch(Q).await.unwrap().unwrap();
        drop(session);
        assert_eq!(broker.ready_count(Q), 2);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_closed_sessions_are_forgotten() {
        let broker = InMemoryBroker::new();
        for _ in 0..10 {
            let session = open(&broker).await;
            session.close().await.unwrap();
        }
        drop(open(&broker).await);

        let severed = open(&broker).await;
        broker.sever_all_sessions();
        assert!(severed.close().await.is_err());

        assert_eq!(broker.inner.state.lock().sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_event_log_is_bounded() {
        let broker = InMemoryBroker::new();
        let session = open(&broker).await;
        let props = PublishProperties::persistent_json();
        for _ in 0..EVENT_LOG_CAPACITY + 10 {
            session.publish(Q, b"x", &props).await.unwrap();
        }
        session.close().await.unwrap();

        let events = broker.events();
        assert_eq!(events.len(), EVENT_LOG_CAPACITY);
        assert_eq!(events.last(), Some(&BrokerEvent::SessionClosed { session: 1 }));
    }

    #[tokio::test]
    async fn test_prefetch_limits_consumer_deliveries() {
        let broker = InMemoryBroker::new();
        broker.inject(Q, b"one".to_vec());
        broker.inject(Q, b"two".to_vec());

        let session = open(&broker).await;
        session.set_prefetch(1).await.unwrap();
        let mut stream = session.consume(Q, "test").await.unwrap();

        let first = stream.next_delivery().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            stream.next_delivery(),
        )
        .await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        session.ack(first.tag).await.unwrap();
        let second = stream.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.payload, b"two".to_vec());
    }

    #[tokio::test]
    async fn test_sever_fails_stream_and_refused_connects() {
        let broker = InMemoryBroker::new();
        let session = open(&broker).await;
        let mut stream = session.consume(Q, "test").await.unwrap();

        assert_eq!(broker.sever_all_sessions(), 1);
        let err = stream.next_delivery().await.unwrap_err();
        assert_eq!(err.kind(), "connection");

        broker.refuse_connections(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }
}
