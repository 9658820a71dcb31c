//! Prometheus metrics for the lease providers.
//!
//! Two families, both labeled by provider id:
//! - `mqleaseserver_provider_lease_requests_total` (gauge): requests a
//!   provider currently knows about that have not completed.
//! - `mqleaseserver_provider_merged_batch_size` (histogram): number of
//!   sibling requests subsumed each time a winner reports success.

use prometheus::{Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "mqleaseserver";

/// Buckets sized for merge-queue batches: most merges subsume a handful of
/// PRs, a busy queue can land twenty at once.
const MERGED_BATCH_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 10.0, 15.0, 20.0];

/// Handles to the lease metric families. Cheap to clone; all vectors share
/// state internally and are safe to use across threads.
#[derive(Clone)]
pub struct LeaseMetrics {
    queue_size: GaugeVec,
    merged_batch_size: HistogramVec,
}

impl LeaseMetrics {
    /// Creates the metric families and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let queue_size = GaugeVec::new(
            Opts::new(
                "provider_lease_requests_total",
                "All lease requests known in a provider",
            )
            .namespace(NAMESPACE),
            &["provider_id"],
        )?;
        let merged_batch_size = HistogramVec::new(
            HistogramOpts::new(
                "provider_merged_batch_size",
                "Number of requests merged in same batch",
            )
            .namespace(NAMESPACE)
            .buckets(MERGED_BATCH_BUCKETS.to_vec()),
            &["provider_id"],
        )?;

        registry.register(Box::new(queue_size.clone()))?;
        registry.register(Box::new(merged_batch_size.clone()))?;

        Ok(Self {
            queue_size,
            merged_batch_size,
        })
    }

    pub fn set_queue_size(&self, provider_id: &str, size: f64) {
        self.queue_size.with_label_values(&[provider_id]).set(size);
    }

    pub fn observe_merged_batch_size(&self, provider_id: &str, size: f64) {
        self.merged_batch_size
            .with_label_values(&[provider_id])
            .observe(size);
    }
}

/// Renders every metric registered with `registry` in Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|err| prometheus::Error::Msg(format!("metrics are not valid UTF-8: {}", err)))
}
