//! We re-export those from prometheus crate to
//! make sure that we use the same dep version everywhere.
//!
//! Unlike the process-wide default registry, the pageserver keeps its metrics
//! in a [`Registry`] owned by its server context, so several servers (or tests)
//! can live in one process without seeing each other's series.
use prometheus::core::{AtomicU64, GenericCounter, GenericCounterVec, GenericGauge, GenericGaugeVec};
pub use prometheus::opts;
pub use prometheus::Error;
pub use prometheus::{core, proto};
pub use prometheus::{exponential_buckets, Histogram, HistogramOpts, HistogramVec};
pub use prometheus::{Encoder, Registry, TextEncoder};
pub use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts};

pub type UIntGauge = GenericGauge<AtomicU64>;
pub type UIntGaugeVec = GenericGaugeVec<AtomicU64>;

pub type UIntCounter = GenericCounter<AtomicU64>;
pub type UIntCounterVec = GenericCounterVec<AtomicU64>;

/// Creates a `UIntGaugeVec` and registers it in the given registry.
pub fn register_uint_gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<UIntGaugeVec, Error> {
    let gauge_vec = UIntGaugeVec::new(opts!(name, help), labels)?;
    registry.register(Box::new(gauge_vec.clone()))?;
    Ok(gauge_vec)
}

/// Creates an `IntCounterVec` and registers it in the given registry.
pub fn register_int_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, Error> {
    let counter_vec = IntCounterVec::new(opts!(name, help), labels)?;
    registry.register(Box::new(counter_vec.clone()))?;
    Ok(counter_vec)
}

/// Creates an `IntCounter` and registers it in the given registry.
pub fn register_int_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Creates a `HistogramVec` and registers it in the given registry.
pub fn register_histogram_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> Result<HistogramVec, Error> {
    let histogram_vec = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)?;
    registry.register(Box::new(histogram_vec.clone()))?;
    Ok(histogram_vec)
}

/// Renders the registry in the text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String, Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() {
        let a = Registry::new();
        let b = Registry::new();
        let gauge_a = register_uint_gauge_vec(&a, "queue_items", "help", &["id"]).unwrap();
        let _gauge_b = register_uint_gauge_vec(&b, "queue_items", "help", &["id"]).unwrap();

        gauge_a.with_label_values(&["x"]).set(3);

        assert!(encode_text(&a).unwrap().contains("queue_items{id=\"x\"} 3"));
        assert!(!encode_text(&b).unwrap().contains("queue_items{id=\"x\"}"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let r = Registry::new();
        register_int_counter(&r, "ops_total", "help").unwrap();
        register_int_counter(&r, "ops_total", "help").unwrap_err();
    }
}
