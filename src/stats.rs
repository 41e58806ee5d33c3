//! Per-query statistics collected by the chunk readers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Counters describing the chunk loading work done for one query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueryStats {
    /// Chunks fetched from object storage (cache hits excluded).
    pub chunks_fetched: usize,
    /// Bytes fetched from object storage.
    pub chunks_fetched_size_sum: usize,
    /// Chunks whose frame exceeded the planned range and required an exact
    /// refetch.
    pub chunks_refetched: usize,
    /// Cumulative wall time spent fetching ranges from object storage.
    pub chunks_fetch_duration: Duration,
}

/// A [`QueryStats`] wrapper safe to update from concurrent pipeline stages.
///
/// Cheap to clone; all clones share the same counters.
#[derive(Debug, Default, Clone)]
pub struct SafeQueryStats {
    inner: Arc<Mutex<QueryStats>>,
}

impl SafeQueryStats {
    /// Create a zeroed stats holder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to the stats under the lock.
    pub fn update(&self, f: impl FnOnce(&mut QueryStats)) {
        f(&mut self.inner.lock());
    }

    /// A copy of the current values.
    pub fn snapshot(&self) -> QueryStats {
        *self.inner.lock()
    }
}
