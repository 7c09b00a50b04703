/*!
 * # Metrics Module
 *
 * Prometheus exporter behind the `metrics` facade. Every `counter!`,
 * `gauge!` and `histogram!` call in the crate is collected by the recorder
 * that [`install`] sets up, and `/metrics` renders it in text format.
 */

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::info;

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to build metrics exporter: {0}")]
    Build(#[from] BuildError),
}

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), LATENCY_BUCKETS)
}

/// Installs the process-wide Prometheus recorder. Later calls return the
/// handle of the first installation.
pub fn install() -> Result<&'static PrometheusHandle, MetricsError> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle);
    }
    let handle = builder()?.install_recorder()?;
    info!("Prometheus metrics recorder installed");
    Ok(HANDLE.get_or_init(|| handle))
}

/// Prometheus text for the installed recorder; empty before [`install`].
pub async fn metrics_handler() -> String {
    HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{Key, Label, Recorder};

    #[test]
    fn renders_counters_and_latency_buckets() {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();

        recorder
            .register_counter(&Key::from_parts(
                "payment_transitions_total",
                vec![Label::new("outcome", "applied")],
            ))
            .increment(3);
        recorder
            .register_histogram(&Key::from_name("http_request_duration_seconds"))
            .record(0.02);

        let text = handle.render();
        assert!(text.contains("payment_transitions_total{outcome=\"applied\"} 3"));
        assert!(text.contains("http_request_duration_seconds_bucket{le=\"0.025\"} 1"));
    }

    #[test]
    fn label_values_are_escaped() {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();

        recorder
            .register_counter(&Key::from_parts(
                "provider_calls_total",
                vec![Label::new("op", "a\"b\\c\nd")],
            ))
            .increment(1);

        let text = handle.render();
        let line = text
            .lines()
            .find(|l| l.starts_with("provider_calls_total{"))
            .unwrap();
        // An unescaped newline would split the series over two lines.
        assert!(line.ends_with(" 1"));
        assert!(line.contains("\\\""));
    }
}
