use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    pipeline_duration: Histogram<u64>,
    frames_streamed: Counter<u64>,
    frames_skipped: Counter<u64>,
    read_failures: Counter<u64>,
    free_slots: Gauge<u64>,
    active_consumers: Gauge<u64>,
    pub registry: Registry,
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build prometheus exporter: {e}"))?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("parking_feed");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let boundaries = generate_boundaries((5, 25, 45, 245, 1045));

        let pipeline_duration = meter
            .u64_histogram("pipeline_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Read, classify, annotate and encode time per frame in milliseconds")
            .build();

        let frames_streamed = meter
            .u64_counter("frames_streamed_total")
            .with_description("Frames encoded and handed to a consumer")
            .build();

        let frames_skipped = meter
            .u64_counter("frames_skipped_total")
            .with_description("Frames dropped by a failing pipeline stage")
            .build();

        let read_failures = meter
            .u64_counter("read_failures_total")
            .with_description("Frame reads that ended a consumer's stream")
            .build();

        let free_slots = meter
            .u64_gauge("free_slots")
            .with_description("Free slots in the most recent frame")
            .build();

        let active_consumers = meter
            .u64_gauge("active_consumers")
            .with_description("Live feed consumers currently attached")
            .build();

        Ok(Metrics {
            request_counter,
            pipeline_duration,
            frames_streamed,
            frames_skipped,
            read_failures,
            free_slots,
            active_consumers,
            registry,
            _provider: provider,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_pipeline_duration(&self, duration_ms: u64) {
        self.pipeline_duration.record(duration_ms, &[]);
    }

    pub fn record_frame_streamed(&self) {
        self.frames_streamed.add(1, &[]);
    }

    pub fn record_frame_skipped(&self, reason: &'static str) {
        let attributes = vec![KeyValue::new("reason", reason)];
        self.frames_skipped.add(1, &attributes);
    }

    pub fn record_read_failure(&self) {
        self.read_failures.add(1, &[]);
    }

    pub fn record_free_slots(&self, free: u64) {
        self.free_slots.record(free, &[]);
    }

    pub fn record_active_consumers(&self, consumers: usize) {
        self.active_consumers.record(consumers as u64, &[]);
    }
}

#[cfg(test)]
impl Metrics {
    /// Sum of the exported counter samples whose family name starts with
    /// `prefix` and that carry `label`, when given.
    pub(crate) fn counter_value(&self, prefix: &str, label: Option<(&str, &str)>) -> f64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name().starts_with(prefix))
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                label.map_or(true, |(name, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == name && pair.get_value() == value)
                })
            })
            .map(|metric| metric.get_counter().get_value())
            .sum()
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 5;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 12, 16, 36, 136);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 7.0, 12.0, 14.0, 16.0, 36.0, 136.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_boundaries_are_sorted() {
        let get = generate_boundaries((5, 25, 45, 245, 1045));
        assert!(get.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(get.first(), Some(&5.0));
        assert_eq!(get.last(), Some(&1045.0));
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/live_feed");
        metrics.record_frame_skipped("encode");

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|name| name.starts_with("requests")));
        assert!(names.iter().any(|name| name.starts_with("frames_skipped")));
    }

    #[test]
    fn test_pipeline_duration_does_not_count_streamed_frames() {
        let metrics = Metrics::new().unwrap();
        metrics.record_pipeline_duration(12);
        metrics.record_pipeline_duration(14);
        metrics.record_frame_streamed();

        assert_eq!(metrics.counter_value("frames_streamed", None), 1.0);
    }

    #[test]
    fn test_skipped_frames_are_counted_by_reason() {
        let metrics = Metrics::new().unwrap();
        metrics.record_frame_skipped("classify");
        metrics.record_frame_skipped("classify");
        metrics.record_frame_skipped("encode");

        let classify = metrics.counter_value("frames_skipped", Some(("reason", "classify")));
        let encode = metrics.counter_value("frames_skipped", Some(("reason", "encode")));
        assert_eq!(classify, 2.0);
        assert_eq!(encode, 1.0);
    }
}
