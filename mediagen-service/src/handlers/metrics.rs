use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
};
use std::sync::LazyLock;

// Add global metrics
static GLOBAL_METER: LazyLock<Meter> = LazyLock::new(|| global::meter("mediagen-service"));

const LATENCY_HISTOGRAM_BUCKETS: [f64; 14] = [
    0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0,
];

/// Counter metric that tracks the total number of generation requests.
///
/// # Metric Details
/// - Name: `mediagen_generation_num_requests`
/// - Type: Counter
/// - Labels: `kind`, `model`
/// - Unit: requests (count)
pub static GENERATION_NUM_REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    GLOBAL_METER
        .u64_counter("mediagen_generation_num_requests")
        .with_description("The number of incoming generation requests")
        .with_unit("requests")
        .build()
});

/// Histogram metric that tracks the end-to-end time of synchronous generations,
/// from the provider call to the stored artifact.
///
/// # Metric Details
/// - Name: `mediagen_generation_latency`
/// - Type: Histogram
/// - Labels: `kind`, `model`
/// - Unit: seconds
pub static GENERATION_LATENCY: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    GLOBAL_METER
        .f64_histogram("mediagen_generation_latency")
        .with_description("Time taken to generate and store media in seconds")
        .with_unit("s")
        .with_boundaries(LATENCY_HISTOGRAM_BUCKETS.to_vec())
        .build()
});

/// Counter metric that tracks failed generation requests, labelled by error code.
///
/// # Metric Details
/// - Name: `mediagen_total_failed_generation_requests`
/// - Type: Counter
/// - Labels: `kind`, `code`
/// - Unit: requests (count)
pub static TOTAL_FAILED_GENERATION_REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    GLOBAL_METER
        .u64_counter("mediagen_total_failed_generation_requests")
        .with_description("Total number of failed generation requests")
        .with_unit("requests")
        .build()
});

/// Counter metric that tracks provider calls retried after a transient failure.
///
/// # Metric Details
/// - Name: `mediagen_provider_retries`
/// - Type: Counter
/// - Labels: `model`
/// - Unit: retries (count)
pub static PROVIDER_RETRIES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    GLOBAL_METER
        .u64_counter("mediagen_provider_retries")
        .with_description("Total number of retried provider calls")
        .with_unit("retries")
        .build()
});

/// Counter metric that tracks provider callbacks, labelled by reported status.
///
/// # Metric Details
/// - Name: `mediagen_callbacks_received`
/// - Type: Counter
/// - Labels: `status`
/// - Unit: callbacks (count)
pub static CALLBACKS_RECEIVED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    GLOBAL_METER
        .u64_counter("mediagen_callbacks_received")
        .with_description("Total number of provider callbacks received")
        .with_unit("callbacks")
        .build()
});
