//! Prometheus metrics for the queue layer

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts};

use crate::metrics::NAMESPACE;

/// Messaging metrics
pub struct MessagingMetrics {
    /// Envelopes accepted by the broker
    pub messages_published: CounterVec,

    /// Publish attempts that failed, by error kind
    pub publish_failures: CounterVec,

    /// Deliveries acknowledged by the consumer loop
    pub messages_acknowledged: CounterVec,

    /// Deliveries rejected, by error kind and requeue flag
    pub messages_rejected: CounterVec,

    /// Consumer sessions lost and retried
    pub consumer_reconnects: CounterVec,

    /// Envelopes taken off the queue by a filtered drain
    pub messages_drained: CounterVec,

    /// Current consumer loop state
    pub consumer_state: GaugeVec,

    /// Publish latency including connect and close
    pub publish_latency: HistogramVec,
}

impl MessagingMetrics {
    /// Boxed clones for registry registration
    pub fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.messages_published.clone()),
            Box::new(self.publish_failures.clone()),
            Box::new(self.messages_acknowledged.clone()),
            Box::new(self.messages_rejected.clone()),
            Box::new(self.consumer_reconnects.clone()),
            Box::new(self.messages_drained.clone()),
            Box::new(self.consumer_state.clone()),
            Box::new(self.publish_latency.clone()),
        ]
    }
}

lazy_static! {
    pub static ref MESSAGING_METRICS: MessagingMetrics = MessagingMetrics {
        messages_published: CounterVec::new(
            Opts::new("messages_published_total", "Total number of envelopes published")
                .namespace(NAMESPACE),
            &["queue"]
        )
        .expect("Failed to create messages_published_total metric"),

        publish_failures: CounterVec::new(
            Opts::new("publish_failures_total", "Total number of failed publishes")
                .namespace(NAMESPACE),
            &["queue", "kind"]
        )
        .expect("Failed to create publish_failures_total metric"),

        messages_acknowledged: CounterVec::new(
            Opts::new("messages_acknowledged_total", "Total number of deliveries acknowledged")
                .namespace(NAMESPACE),
            &["queue"]
        )
        .expect("Failed to create messages_acknowledged_total metric"),

        messages_rejected: CounterVec::new(
            Opts::new("messages_rejected_total", "Total number of deliveries rejected")
                .namespace(NAMESPACE),
            &["queue", "kind", "requeue"]
        )
        .expect("Failed to create messages_rejected_total metric"),

        consumer_reconnects: CounterVec::new(
            Opts::new("consumer_reconnects_total", "Total number of consumer reconnect cycles")
                .namespace(NAMESPACE),
            &["queue"]
        )
        .expect("Failed to create consumer_reconnects_total metric"),

        messages_drained: CounterVec::new(
            Opts::new("messages_drained_total", "Total number of envelopes taken by filtered drains")
                .namespace(NAMESPACE),
            &["queue"]
        )
        .expect("Failed to create messages_drained_total metric"),

        consumer_state: GaugeVec::new(
            Opts::new(
                "consumer_state",
                "Consumer loop state (0=disconnected, 1=connected, 2=consuming, 3=stopped)"
            )
            .namespace(NAMESPACE),
            &["queue"]
        )
        .expect("Failed to create consumer_state metric"),

        publish_latency: HistogramVec::new(
            HistogramOpts::new("publish_latency_seconds", "Publish latency in seconds")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue"]
        )
        .expect("Failed to create publish_latency_seconds metric"),
    };
}
