// src/telemetry.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "collect_items_total",
            "Raw items accumulated by collectors."
        );
        describe_counter!(
            "collect_page_errors_total",
            "Listing pages skipped after a fetch failure."
        );
        describe_counter!(
            "clean_skipped_total",
            "Items skipped by the cleaner (missing fields, filters, LLM)."
        );
        describe_counter!("llm_calls_total", "Enrichment calls issued.");
        describe_counter!("store_upserts_total", "Records upserted.");
        describe_counter!(
            "sweep_flagged_total",
            "Records soft-deleted by the validation sweep."
        );
        describe_counter!("pipeline_runs_total", "Completed pipeline runs.");
        describe_gauge!(
            "pipeline_last_run_ts",
            "Unix ts when the pipeline last completed."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize the Prometheus recorder and describe the pipeline series.
    pub fn init() -> Self {
        // Use default buckets to avoid API differences across crate versions.
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .expect("prometheus: install recorder");

        ensure_metrics_described();

        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
