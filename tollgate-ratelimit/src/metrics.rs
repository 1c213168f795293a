//! Admission metrics
//!
//! Denials are business outcomes: they are counted here rather than logged
//! as failures.

use crate::decision::{Backend, RateLimitDecision};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Prometheus counters for admission decisions
#[derive(Clone)]
pub struct AdmissionMetrics {
    decisions: IntCounterVec,
    outages: IntCounterVec,
    disagreements: IntCounter,
}

impl AdmissionMetrics {
    /// Create unregistered counters
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            decisions: IntCounterVec::new(
                Opts::new(
                    "tollgate_decisions_total",
                    "Rate limit decisions by backend, outcome and window",
                ),
                &["backend", "outcome", "limit_type"],
            )?,
            outages: IntCounterVec::new(
                Opts::new(
                    "tollgate_backend_outages_total",
                    "Decisions made by the outage policy",
                ),
                &["policy"],
            )?,
            disagreements: IntCounter::new(
                "tollgate_hybrid_disagreements_total",
                "Hybrid evaluations where the two backends disagreed",
            )?,
        })
    }

    /// Create counters and register them
    pub fn registered(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::new()?;
        registry.register(Box::new(metrics.decisions.clone()))?;
        registry.register(Box::new(metrics.outages.clone()))?;
        registry.register(Box::new(metrics.disagreements.clone()))?;
        Ok(metrics)
    }

    pub fn record_decision(&self, decision: &RateLimitDecision) {
        let outcome = if decision.allowed { "allowed" } else { "denied" };
        let limit_type = decision.limit_type.map(|w| w.as_str()).unwrap_or("none");
        self.decisions
            .with_label_values(&[decision.backend.as_str(), outcome, limit_type])
            .inc();

        if decision.backend == Backend::Unavailable {
            let policy = if decision.allowed { "open" } else { "closed" };
            self.outages.with_label_values(&[policy]).inc();
        }
    }

    pub fn record_disagreement(&self) {
        self.disagreements.inc();
    }

    pub fn decisions(&self, backend: Backend, allowed: bool, limit_type: &str) -> u64 {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.decisions
            .with_label_values(&[backend.as_str(), outcome, limit_type])
            .get()
    }

    pub fn outages(&self, fail_open: bool) -> u64 {
        let policy = if fail_open { "open" } else { "closed" };
        self.outages.with_label_values(&[policy]).get()
    }

    pub fn disagreements(&self) -> u64 {
        self.disagreements.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Window;
    use std::time::Duration;

    #[test]
    fn test_record_decisions() {
        let metrics = AdmissionMetrics::new().unwrap();

        metrics.record_decision(&RateLimitDecision::allowed(
            5,
            10,
            0,
            Window::Second,
            Backend::Distributed,
        ));
        metrics.record_decision(&RateLimitDecision::denied(
            10,
            0,
            Duration::from_secs(1),
            Window::Burst,
            Backend::Distributed,
        ));
        metrics.record_decision(&RateLimitDecision::unavailable(
            false,
            10,
            Duration::from_secs(5),
        ));

        assert_eq!(metrics.decisions(Backend::Distributed, true, "second"), 1);
        assert_eq!(metrics.decisions(Backend::Distributed, false, "burst"), 1);
        assert_eq!(metrics.decisions(Backend::Unavailable, false, "none"), 1);
        assert_eq!(metrics.outages(false), 1);
        assert_eq!(metrics.outages(true), 0);
    }

    #[test]
    fn test_registration() {
        let registry = Registry::new();
        let metrics = AdmissionMetrics::registered(&registry).unwrap();
        metrics.record_disagreement();
        metrics.record_decision(&RateLimitDecision::unavailable(
            true,
            10,
            Duration::from_secs(5),
        ));

        assert_eq!(registry.gather().len(), 3);
        assert_eq!(metrics.disagreements(), 1);

        assert!(AdmissionMetrics::registered(&registry).is_err());
    }
}
