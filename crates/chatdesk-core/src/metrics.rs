//! Prometheus metrics for the blast engine

use chatdesk_common::{Error, Result};
use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_with_registry, Encoder,
    IntCounterVec, IntGauge, Registry, TextEncoder,
};

/// Engine metrics, registered in a private registry
#[derive(Clone)]
pub struct BlastMetrics {
    registry: Registry,
    /// Generation attempts by outcome (success/failure)
    generations: IntCounterVec,
    /// Dispatch attempts by outcome (sent/failed)
    dispatches: IntCounterVec,
    /// Recipients moved by the recovery sweep, by the status they were stuck in
    recovered: IntCounterVec,
    /// Counter corrections made by reconciliation, by campaign counter
    counter_drift: IntCounterVec,
    active_pacers: IntGauge,
}

impl BlastMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("chatdesk".to_string()), None)
            .map_err(metrics_err)?;

        let generations = register_int_counter_vec_with_registry!(
            "blast_generations_total",
            "Message generation attempts",
            &["outcome"],
            registry
        )
        .map_err(metrics_err)?;

        let dispatches = register_int_counter_vec_with_registry!(
            "blast_dispatches_total",
            "Channel dispatch attempts",
            &["outcome"],
            registry
        )
        .map_err(metrics_err)?;

        let recovered = register_int_counter_vec_with_registry!(
            "blast_recovered_recipients_total",
            "Recipients reset by the startup recovery sweep",
            &["stuck_in"],
            registry
        )
        .map_err(metrics_err)?;

        let counter_drift = register_int_counter_vec_with_registry!(
            "blast_counter_corrections_total",
            "Campaign counters corrected by reconciliation",
            &["counter"],
            registry
        )
        .map_err(metrics_err)?;

        let active_pacers = register_int_gauge_with_registry!(
            "blast_active_pacers",
            "Delivery pacers currently running",
            registry
        )
        .map_err(metrics_err)?;

        Ok(Self {
            registry,
            generations,
            dispatches,
            recovered,
            counter_drift,
            active_pacers,
        })
    }

    pub fn record_generation(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.generations.with_label_values(&[outcome]).inc();
    }

    pub fn record_dispatch(&self, sent: bool) {
        let outcome = if sent { "sent" } else { "failed" };
        self.dispatches.with_label_values(&[outcome]).inc();
    }

    pub fn record_recovered(&self, stuck_in: &str, count: u64) {
        self.recovered.with_label_values(&[stuck_in]).inc_by(count);
    }

    pub fn record_counter_correction(&self, counter: &str) {
        self.counter_drift.with_label_values(&[counter]).inc();
    }

    pub fn pacer_started(&self) {
        self.active_pacers.inc();
    }

    pub fn pacer_stopped(&self) {
        self.active_pacers.dec();
    }

    pub fn active_pacers(&self) -> i64 {
        self.active_pacers.get()
    }

    pub fn generation_count(&self, success: bool) -> u64 {
        let outcome = if success { "success" } else { "failure" };
        self.generations.with_label_values(&[outcome]).get()
    }

    pub fn dispatch_count(&self, sent: bool) -> u64 {
        let outcome = if sent { "sent" } else { "failed" };
        self.dispatches.with_label_values(&[outcome]).get()
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn export(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = BlastMetrics::new().unwrap();
        metrics.record_dispatch(true);
        metrics.record_dispatch(true);
        metrics.record_generation(false);
        metrics.pacer_started();

        let text = metrics.export().unwrap();
        assert!(text.contains("chatdesk_blast_dispatches_total{outcome=\"sent\"} 2"));
        assert!(text.contains("chatdesk_blast_generations_total{outcome=\"failure\"} 1"));
        assert!(text.contains("chatdesk_blast_active_pacers 1"));
        assert_eq!(metrics.dispatch_count(true), 2);
    }
}
