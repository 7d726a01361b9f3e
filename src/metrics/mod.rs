//! Prometheus metrics exporter for the mail relay.
//!
//! All collectors live in one process-wide registry under the `mail_relay`
//! namespace. The consumer binary serves [`gather_metrics`] on `/metrics`.
//!
//! # Example
//! ```no_run
//! use mail_relay::metrics;
//!
//! metrics::init_metrics().expect("metrics registry");
//! println!("{}", metrics::gather_metrics());
//! ```

use lazy_static::lazy_static;
use prometheus::{GaugeVec, Opts, Registry};

pub use crate::messaging::MESSAGING_METRICS;

/// Namespace prefixed to every metric name
pub const NAMESPACE: &str = "mail_relay";

lazy_static! {
    /// Global Prometheus registry for all metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    /// Build information
    ///
    /// Labels: version
    pub static ref BUILD_INFO: GaugeVec = GaugeVec::new(
        Opts::new("build_info", "Build information").namespace(NAMESPACE),
        &["version"]
    ).expect("Failed to create BUILD_INFO metric");
}

/// Register every collector with [`PROMETHEUS_REGISTRY`].
///
/// Safe to call more than once; collectors that are already registered are
/// skipped.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    register(Box::new(BUILD_INFO.clone()))?;
    for collector in MESSAGING_METRICS.collectors() {
        register(collector)?;
    }

    BUILD_INFO
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

fn register(collector: Box<dyn prometheus::core::Collector>) -> Result<(), prometheus::Error> {
    match PROMETHEUS_REGISTRY.register(collector) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Generate Prometheus text format metrics
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().unwrap();
        MESSAGING_METRICS
            .messages_published
            .with_label_values(&["metrics_test_queue"])
            .inc();

        let output = gather_metrics();
        assert!(output.contains("mail_relay_build_info"));
        assert!(output.contains("mail_relay_messages_published_total"));
    }
}
