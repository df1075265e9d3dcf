use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;

/// Per-frame detector latency buckets. GPU inference lands in the low
/// tens of milliseconds, CPU fallback in the hundreds.
const INFERENCE_BUCKETS_MS: [f64; 14] = [
    5.0, 10.0, 15.0, 20.0, 30.0, 40.0, 50.0, 75.0, 100.0, 150.0, 250.0, 500.0, 1000.0, 2500.0,
];

pub struct Metrics {
    request_counter: Counter<u64>,
    inference_duration: Histogram<u64>,
    frames_streamed: Counter<u64>,
    cleanup_failures: Counter<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("hazard_api");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(INFERENCE_BUCKETS_MS.to_vec())
            .with_description("Duration of detector invocations in milliseconds")
            .build();

        let frames_streamed = meter
            .u64_counter("frames_streamed_total")
            .with_description("Annotated frames written to streaming responses")
            .build();

        let cleanup_failures = meter
            .u64_counter("cleanup_failures_total")
            .with_description("Temporary uploads that could not be deleted")
            .build();

        Ok(Metrics {
            request_counter,
            inference_duration,
            frames_streamed,
            cleanup_failures,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }

    pub fn record_frame_streamed(&self) {
        self.frames_streamed.add(1, &[]);
    }

    pub fn record_cleanup_failure(&self) {
        self.cleanup_failures.add(1, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_buckets_are_strictly_increasing() {
        assert!(INFERENCE_BUCKETS_MS.windows(2).all(|w| w[0] < w[1]));
        assert!(INFERENCE_BUCKETS_MS[0] > 0.0);
    }

    #[test]
    fn test_metrics_are_exported_to_registry() {
        let metrics = Metrics::new().unwrap();

        metrics.record_request("/track/video");
        metrics.record_inference_duration(42, "/track/video");
        metrics.record_frame_streamed();
        metrics.record_cleanup_failure();

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("requests_total")));
        assert!(names.iter().any(|n| n.starts_with("inference_duration_ms")));
        assert!(names.iter().any(|n| n.starts_with("frames_streamed_total")));
        assert!(names.iter().any(|n| n.starts_with("cleanup_failures_total")));
    }
}
