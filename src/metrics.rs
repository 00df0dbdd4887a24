//metrics.rs
use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram, HistogramOpts, Opts};

lazy_static! {
    // Dispatch metrics
    pub static ref EVENTS_DISPATCHED: Counter = register_counter!(Opts::new(
        "events_dispatched_total",
        "Total number of events fanned out"
    ))
    .unwrap();

    pub static ref EVENTS_REJECTED: Counter = register_counter!(Opts::new(
        "events_rejected_total",
        "Events dropped at submission because the dispatch queue was full or closed"
    ))
    .unwrap();

    pub static ref EVENTS_INVALID: Counter = register_counter!(Opts::new(
        "events_invalid_total",
        "Events that failed validation before any send"
    ))
    .unwrap();

    pub static ref RECIPIENTS_UNREACHED: Counter = register_counter!(Opts::new(
        "recipients_unreached_total",
        "Recipients for whom no device accepted the notification"
    ))
    .unwrap();

    // Delivery metrics
    pub static ref PUSH_SENT: Counter = register_counter!(Opts::new(
        "push_sent_total",
        "Total number of per-device pushes accepted by a transport"
    ))
    .unwrap();

    pub static ref PUSH_FAILED: Counter = register_counter!(Opts::new(
        "push_failed_total",
        "Total number of per-device pushes that failed"
    ))
    .unwrap();

    pub static ref CREDENTIALS_REJECTED: Counter = register_counter!(Opts::new(
        "credentials_rejected_total",
        "Sends where the provider reported the device credential as no longer valid"
    ))
    .unwrap();

    // Timing metrics
    pub static ref DISPATCH_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "dispatch_time_seconds",
            "Time taken to fan out one event"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();

    pub static ref TRANSPORT_LATENCY: Histogram = register_histogram!(
        HistogramOpts::new(
            "transport_latency_seconds",
            "Time taken by a single push transport call"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();
}

// Function to expose metrics endpoint
pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
