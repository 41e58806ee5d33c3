//! Remote key-value cache adapter used by the chunk readers.
//!
//! The adapter is deliberately best-effort on both paths. Stores are
//! fire-and-forget: the read path never waits for the cache to acknowledge a
//! write. Fetch errors are converted into misses: a degraded cache turns a
//! consistency concern into a latency concern, which is strictly safer for
//! the read path.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prometheus::{IntCounter, Opts, Registry};
use snafu::Snafu;
use tracing::{debug, warn};

use crate::block::BlockId;

/// Error reported by a [`CacheClient`] implementation.
#[derive(Debug, Snafu)]
#[snafu(display("remote cache: {}", message))]
pub struct ClientError {
    /// Human-readable description of the transport failure.
    pub message: String,
}

impl ClientError {
    /// Create an error from any displayable cause.
    pub fn new(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Client for a remote key-value cache; a memcached-class service is the
/// reference implementation.
#[async_trait]
pub trait CacheClient: Debug + Send + Sync + 'static {
    /// Fetch multiple keys in one request, returning only the hits.
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, ClientError>;

    /// Enqueue a set; the write completes asynchronously in the client.
    fn set_async(&self, key: String, value: Bytes, ttl: Duration) -> Result<(), ClientError>;
}

/// Best-effort facade over a [`CacheClient`], with hit/miss accounting.
pub struct RemoteCache {
    name: String,
    client: Arc<dyn CacheClient>,

    requests: IntCounter,
    hits: IntCounter,
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache")
            .field("name", &self.name)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl RemoteCache {
    /// Create a facade named `name` (used as the metric label) and register
    /// its counters with `registry`.
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn CacheClient>,
        registry: &Registry,
    ) -> Result<Self, prometheus::Error> {
        let name = name.into();

        let requests = IntCounter::with_opts(
            Opts::new(
                "cache_memcached_requests_total",
                "Total number of items requested from the cache",
            )
            .const_label("name", name.as_str()),
        )?;
        registry.register(Box::new(requests.clone()))?;

        let hits = IntCounter::with_opts(
            Opts::new(
                "cache_memcached_hits_total",
                "Total number of requested items found in the cache",
            )
            .const_label("name", name.as_str()),
        )?;
        registry.register(Box::new(hits.clone()))?;

        Ok(Self {
            name,
            client,
            requests,
            hits,
        })
    }

    /// Store `data` with the given TTL, best-effort.
    ///
    /// Per-key failures are accumulated and logged once; the caller never
    /// learns about them and never waits for the cache.
    pub fn store(&self, data: HashMap<String, Bytes>, ttl: Duration) {
        let mut failed = 0;
        let mut first_err = None;

        for (key, value) in data {
            if let Err(e) = self.client.set_async(key, value, ttl) {
                failed += 1;
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        if let Some(e) = first_err {
            warn!(
                cache = %self.name,
                failed,
                first_error = %e,
                "failed to store items in remote cache"
            );
        }
    }

    /// Fetch `keys` in one bulk request, returning only the hits.
    ///
    /// Any transport error yields an empty map: misses, not failure.
    pub async fn fetch(&self, keys: &[String]) -> HashMap<String, Bytes> {
        self.requests.inc_by(keys.len() as u64);

        let results = match self.client.get_multi(keys).await {
            Ok(results) => results,
            Err(e) => {
                debug!(cache = %self.name, error = %e, "remote cache fetch failed, treating as miss");
                HashMap::new()
            }
        };

        self.hits.inc_by(results.len() as u64);
        results
    }

    /// Identifier of this cache, used for metric labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total items requested so far.
    pub fn requests_total(&self) -> u64 {
        self.requests.get()
    }

    /// Total items found so far.
    pub fn hits_total(&self) -> u64 {
        self.hits.get()
    }
}

/// Cache key for one planned chunk range read.
///
/// Both the tenant and the block id are part of the key, which makes
/// collisions across tenants and across blocks impossible; segment id,
/// offset and length pin down the exact byte range.
pub fn chunks_range_key(
    tenant: &str,
    block_id: &BlockId,
    segment_file: u32,
    offset: u64,
    length: u64,
) -> String {
    format!("chunks:{tenant}:{block_id}:{segment_file:06}:{offset}:{length}")
}
