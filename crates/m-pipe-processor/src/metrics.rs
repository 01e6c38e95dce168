//! ---
//! mpipe_section: "04-consumer-orchestration"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metrics processor service coordinating consumers and persistence."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Instrumentation recorded by the processor about its own pipeline.
#[derive(Clone)]
pub struct ProcessorMetrics {
    registry: SharedRegistry,
    records_persisted: IntCounter,
    persist_failures: IntCounter,
    checkpoint_failures: IntCounter,
    decode_failures: IntCounter,
    processing_delay_ms: IntGauge,
}

impl ProcessorMetrics {
    /// Register the processor's metric families on the given registry.
    pub fn new(registry: SharedRegistry) -> Result<Self, prometheus::Error> {
        let records_persisted = IntCounter::with_opts(Opts::new(
            "m_pipe_records_persisted_total",
            "Total metric records accepted by the metric sink",
        ))?;
        registry.register(Box::new(records_persisted.clone()))?;

        let persist_failures = IntCounter::with_opts(Opts::new(
            "m_pipe_persist_failures_total",
            "Persistence passes whose sink write failed",
        ))?;
        registry.register(Box::new(persist_failures.clone()))?;

        let checkpoint_failures = IntCounter::with_opts(Opts::new(
            "m_pipe_checkpoint_failures_total",
            "Marker commits rejected by the checkpoint store",
        ))?;
        registry.register(Box::new(checkpoint_failures.clone()))?;

        let decode_failures = IntCounter::with_opts(Opts::new(
            "m_pipe_decode_failures_total",
            "Messages skipped because their payload failed to decode",
        ))?;
        registry.register(Box::new(decode_failures.clone()))?;

        let processing_delay_ms = IntGauge::with_opts(Opts::new(
            "m_pipe_processing_delay_ms",
            "Age of the newest record in the most recently persisted batch",
        ))?;
        registry.register(Box::new(processing_delay_ms.clone()))?;

        Ok(Self {
            registry,
            records_persisted,
            persist_failures,
            checkpoint_failures,
            decode_failures,
            processing_delay_ms,
        })
    }

    /// Registry the families are registered on.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub(crate) fn add_persisted(&self, count: u64) {
        self.records_persisted.inc_by(count);
    }

    pub(crate) fn inc_persist_failure(&self) {
        self.persist_failures.inc();
    }

    pub(crate) fn inc_checkpoint_failure(&self) {
        self.checkpoint_failures.inc();
    }

    pub(crate) fn inc_decode_failure(&self) {
        self.decode_failures.inc();
    }

    pub(crate) fn set_processing_delay_ms(&self, delay_ms: i64) {
        self.processing_delay_ms.set(delay_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_register_and_count() {
        let registry = new_registry();
        let metrics = ProcessorMetrics::new(registry.clone()).unwrap();
        metrics.add_persisted(5);
        metrics.inc_decode_failure();
        metrics.set_processing_delay_ms(120);

        let families = registry.gather();
        let persisted = families
            .iter()
            .find(|family| family.get_name() == "m_pipe_records_persisted_total")
            .expect("persisted counter registered");
        assert_eq!(persisted.get_metric()[0].get_counter().get_value(), 5.0);

        let delay = families
            .iter()
            .find(|family| family.get_name() == "m_pipe_processing_delay_ms")
            .expect("delay gauge registered");
        assert_eq!(delay.get_metric()[0].get_gauge().get_value(), 120.0);
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = new_registry();
        let _first = ProcessorMetrics::new(registry.clone()).unwrap();
        assert!(ProcessorMetrics::new(registry).is_err());
    }
}
