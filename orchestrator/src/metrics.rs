use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry,
};

/// Collectors for report runs. Registered once per registry.
#[derive(Clone)]
pub struct Metrics {
    pub runs_total: IntCounterVec,
    pub stage_duration: HistogramVec,
    pub stage_fallbacks: IntCounterVec,
    pub search_failures: IntCounter,
}

impl Metrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let runs_total = IntCounterVec::new(
            opts!("report_runs_total", "Report runs by final outcome"),
            &["outcome"],
        )?;
        let stage_duration = HistogramVec::new(
            histogram_opts!(
                "report_stage_duration_seconds",
                "Wall time spent in each pipeline stage",
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]
            ),
            &["stage"],
        )?;
        let stage_fallbacks = IntCounterVec::new(
            opts!(
                "report_stage_fallbacks_total",
                "Stages that returned their documented fallback"
            ),
            &["stage"],
        )?;
        let search_failures = IntCounter::with_opts(opts!(
            "report_search_failures_total",
            "Individual search queries that failed"
        ))?;

        registry.register(Box::new(runs_total.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(stage_fallbacks.clone()))?;
        registry.register(Box::new(search_failures.clone()))?;

        Ok(Self {
            runs_total,
            stage_duration,
            stage_fallbacks,
            search_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_collectors() {
        let registry = Registry::new();
        let metrics = Metrics::register(&registry).unwrap();
        metrics.runs_total.with_label_values(&["complete"]).inc();
        metrics.stage_duration.with_label_values(&["writer"]).observe(0.2);
        metrics.stage_fallbacks.with_label_values(&["writer"]).inc();
        metrics.search_failures.inc();

        let names: Vec<String> = registry.gather().iter().map(|f| f.get_name().to_string()).collect();
        for name in [
            "report_runs_total",
            "report_stage_duration_seconds",
            "report_stage_fallbacks_total",
            "report_search_failures_total",
        ] {
            assert!(names.contains(&name.to_string()), "{} not registered", name);
        }
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        Metrics::register(&registry).unwrap();
        assert!(Metrics::register(&registry).is_err());
    }
}
