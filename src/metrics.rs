//! Prometheus metrics for the streaming pipeline.

use prometheus::{Histogram, HistogramOpts, HistogramVec, Registry};

/// Stage label value for the loading iterator.
pub const STAGE_CHUNKS_LOAD: &str = "chunks_load";

/// Stage label value for the preloading iterator.
pub const STAGE_CHUNKS_PRELOADED: &str = "chunks_preloaded";

/// Metrics recorded by the series-chunks pipeline.
///
/// The per-stage duration histogram shows where the streaming pipeline
/// bottlenecks: time spent in `chunks_load` is chunk fetching itself, while
/// time spent in `chunks_preloaded` is the consumer waiting for a batch that
/// was not ready yet. In an ideal run the latter is close to zero.
#[derive(Clone)]
pub struct StoreGatewayMetrics {
    iterator_load_durations: HistogramVec,
}

impl std::fmt::Debug for StoreGatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreGatewayMetrics").finish_non_exhaustive()
    }
}

impl StoreGatewayMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let iterator_load_durations = HistogramVec::new(
            HistogramOpts::new(
                "store_gateway_series_iterator_load_duration_seconds",
                "Wall time of one advance of a series-chunks set iterator, by pipeline stage",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["stage"],
        )?;
        registry.register(Box::new(iterator_load_durations.clone()))?;

        Ok(Self {
            iterator_load_durations,
        })
    }

    /// The duration histogram for one pipeline stage.
    pub fn stage_duration(&self, stage: &str) -> Histogram {
        self.iterator_load_durations.with_label_values(&[stage])
    }
}
