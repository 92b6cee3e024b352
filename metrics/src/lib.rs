use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram, UpDownCounter},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub fn init_provider() -> Result<Registry> {
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder()
        .with_resource(opentelemetry_sdk::Resource::new(vec![
            KeyValue::new("service.name", "faas-gateway"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .with_reader(exporter)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(registry)
}

fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.000005, 0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
        5.0, 10.0, 30.0, 60.0,
    ]
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: &[],
        }
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn add(&self, value: i64, labels: &[KeyValue]);
}

impl AutoIncrement for UpDownCounter<i64> {
    fn add(&self, value: i64, labels: &[KeyValue]) {
        self.add(value, labels);
    }
}

pub struct Increment<'a, T: AutoIncrement + Sync> {
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: AutoIncrement + Sync> Increment<'a, T> {
    pub fn inc(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        metric.add(1, labels);
        Self { metric, labels }
    }
}

impl<'a, T: AutoIncrement + Sync> Drop for Increment<'a, T> {
    fn drop(&mut self) {
        self.metric.add(-1, self.labels);
    }
}

pub mod gateway_stats {
    use super::*;

    /// Process-wide dispatch instruments.
    #[derive(Debug)]
    pub struct Metrics {
        pub incoming_requests: Counter<u64>,
        pub request_interval: Histogram<f64>,
        pub requests_instant_rps: Histogram<f64>,
        pub inflight_requests: UpDownCounter<i64>,
        pub running_requests: Histogram<u64>,
        pub queueing_delay: Histogram<f64>,
        pub dispatch_overhead: Histogram<f64>,
        pub http_request_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("gateway-dispatch");
            let incoming_requests = meter
                .u64_counter("incoming_requests")
                .with_description("number of function calls received")
                .build();
            let request_interval = meter
                .f64_histogram("request_interval")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("interval between consecutive function calls")
                .build();
            let requests_instant_rps = meter
                .f64_histogram("requests_instant_rps")
                .with_description("instantaneous request rate computed per arrival")
                .build();
            let inflight_requests = meter
                .i64_up_down_counter("inflight_requests")
                .with_description("client requests currently held open")
                .build();
            let running_requests = meter
                .u64_histogram("running_requests")
                .with_description("size of the running-call table, sampled per dispatch")
                .build();
            let queueing_delay = meter
                .f64_histogram("queueing_delay")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("time spent in the pending queue before dispatch")
                .build();
            let dispatch_overhead = meter
                .f64_histogram("dispatch_overhead")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("gateway-side overhead excluding engine processing time")
                .build();
            let http_request_duration = meter
                .f64_histogram("http_request_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("wall time of one client request, receipt to response")
                .build();
            Metrics {
                incoming_requests,
                request_interval,
                requests_instant_rps,
                inflight_requests,
                running_requests,
                queueing_delay,
                dispatch_overhead,
                http_request_duration,
            }
        }
    }
}

pub mod per_func_stats {
    use super::*;

    /// Per-function instruments, recorded with a `func` attribute.
    #[derive(Debug)]
    pub struct Metrics {
        pub incoming_requests: Counter<u64>,
        pub request_interval: Histogram<f64>,
        pub end2end_delay: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("gateway-per-func");
            let incoming_requests = meter
                .u64_counter("func_incoming_requests")
                .with_description("number of calls received per function")
                .build();
            let request_interval = meter
                .f64_histogram("func_request_interval")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("interval between consecutive calls of one function")
                .build();
            let end2end_delay = meter
                .f64_histogram("func_end2end_delay")
                .with_unit("s")
                .with_description("receipt-to-completion delay for async calls")
                .build();
            Metrics {
                incoming_requests,
                request_interval,
                end2end_delay,
            }
        }
    }
}
