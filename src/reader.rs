//! Bulk chunk reads against the segment files of blocks in object storage.
//!
//! [`BucketChunkReaders`] collects the chunk loads of one batch, groups them
//! by block and segment file, sorts them by offset and coalesces
//! near-adjacent loads into as few range reads as possible. Each planned
//! range is fetched exactly once, preferably from the remote cache; misses
//! go to object storage with a bounded retry policy and are stored back
//! best-effort. Fetched frames are parsed and written into the fixed
//! `(series, chunk)` slots of the output set, so the concurrency of the
//! range fetches never reorders anything observable.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoffBuilder;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use object_store::path::Path;
use object_store::ObjectStore;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::block::{chunks_segment_path, BlockId, ChunkRef};
use crate::cache::{chunks_range_key, RemoteCache};
use crate::chunk::{self, ParseOutcome, ESTIMATED_MAX_CHUNK_SIZE};
use crate::chunk_set::ChunkSet;
use crate::pool::ChunkBytesBatch;
use crate::stats::SafeQueryStats;

/// Maximum distance between two chunk extents that still coalesces them
/// into a single range read.
pub const DEFAULT_MAX_GAP_SIZE: u64 = 512 * 1024;

/// Bound on concurrently in-flight range fetches per batch.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;

/// How long fetched chunk ranges stay in the remote cache. Blocks are
/// immutable, so the TTL only bounds cache occupancy.
const CHUNKS_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("no chunk reader for block {}", block_id))]
    UnknownBlock { block_id: BlockId },

    #[snafu(display(
        "fetching {} bytes at offset {} of segment {}: {}",
        length,
        offset,
        path,
        source
    ))]
    FetchRange {
        path: Path,
        offset: u64,
        length: u64,
        source: object_store::Error,
    },

    #[snafu(display("resolving size of segment {}: {}", path, source))]
    SegmentSize {
        path: Path,
        source: object_store::Error,
    },

    #[snafu(display("chunk at offset {} of segment {}: {}", offset, path, source))]
    MalformedChunk {
        path: Path,
        offset: u64,
        source: chunk::Error,
    },

    #[snafu(display(
        "chunk at offset {} extends past the end of segment {}",
        offset,
        path
    ))]
    TruncatedChunk { path: Path, offset: u64 },

    #[snafu(display("chunk load cancelled"))]
    Cancelled,
}

impl Error {
    /// Whether this error was caused by query cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// One chunk load registered via [`BucketChunkReaders::add_load`].
#[derive(Debug, Clone, Copy)]
struct PendingChunk {
    chunk_ref: ChunkRef,
    series_idx: usize,
    chunk_idx: usize,
}

/// One chunk within a planned range read.
#[derive(Debug, Clone, Copy)]
struct PlannedChunk {
    offset: u64,
    series_idx: usize,
    chunk_idx: usize,
}

/// One coalesced range read against a single segment file.
#[derive(Debug)]
struct RangeJob {
    store: Arc<dyn ObjectStore>,
    path: Path,
    segment_size: u64,
    range: Range<u64>,
    key: String,
    chunks: Vec<PlannedChunk>,
}

/// Per-block state: the block's store handle, memoized segment sizes and the
/// loads registered for the current batch.
#[derive(Debug)]
struct BucketChunkReader {
    block_id: BlockId,
    store: Arc<dyn ObjectStore>,
    segment_sizes: HashMap<u32, u64>,
    pending: Vec<PendingChunk>,
}

impl BucketChunkReader {
    async fn segment_size(
        &mut self,
        segment_file: u32,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<u64, Error> {
        if let Some(size) = self.segment_sizes.get(&segment_file) {
            return Ok(*size);
        }

        let head = retrying(|| self.store.head(path));
        let meta = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            meta = head => meta.context(SegmentSizeSnafu { path: path.clone() })?,
        };

        let size = meta.size as u64;
        self.segment_sizes.insert(segment_file, size);
        Ok(size)
    }

    /// Turn the pending loads into coalesced range jobs.
    async fn plan(
        &mut self,
        tenant: &str,
        max_gap_size: u64,
        token: &CancellationToken,
    ) -> Result<Vec<RangeJob>, Error> {
        let mut by_segment: BTreeMap<u32, Vec<PendingChunk>> = BTreeMap::new();
        for pending in self.pending.drain(..) {
            by_segment
                .entry(pending.chunk_ref.segment_file())
                .or_default()
                .push(pending);
        }

        let block_id = self.block_id;
        let mut jobs = Vec::new();
        for (segment_file, mut chunks) in by_segment {
            chunks.sort_by_key(|c| c.chunk_ref.offset());

            let path = chunks_segment_path(&block_id, segment_file);
            let size = self.segment_size(segment_file, &path, token).await?;

            let mut current: Option<RangeJob> = None;
            for (i, pending) in chunks.iter().enumerate() {
                let offset = u64::from(pending.chunk_ref.offset());
                if offset >= size {
                    return TruncatedChunkSnafu {
                        path: path.clone(),
                        offset,
                    }
                    .fail();
                }

                // Estimate the chunk's extent: bounded by the estimated
                // maximum frame size, the start of the next chunk and the end
                // of the segment. Underestimates are corrected by a refetch.
                let mut est_end = (offset + ESTIMATED_MAX_CHUNK_SIZE as u64).min(size);
                if let Some(next) = chunks.get(i + 1) {
                    let next_offset = u64::from(next.chunk_ref.offset());
                    if next_offset > offset {
                        est_end = est_end.min(next_offset);
                    }
                }

                let planned = PlannedChunk {
                    offset,
                    series_idx: pending.series_idx,
                    chunk_idx: pending.chunk_idx,
                };

                match current.as_mut() {
                    Some(job) if offset.saturating_sub(job.range.end) <= max_gap_size => {
                        job.range.end = job.range.end.max(est_end);
                        job.chunks.push(planned);
                    }
                    _ => {
                        if let Some(mut job) = current.take() {
                            job.key = range_key(tenant, &block_id, segment_file, &job.range);
                            jobs.push(job);
                        }
                        current = Some(RangeJob {
                            store: Arc::clone(&self.store),
                            path: path.clone(),
                            segment_size: size,
                            range: offset..est_end,
                            key: String::new(),
                            chunks: vec![planned],
                        });
                    }
                }
            }
            if let Some(mut job) = current.take() {
                job.key = range_key(tenant, &block_id, segment_file, &job.range);
                jobs.push(job);
            }
        }

        Ok(jobs)
    }
}

fn range_key(tenant: &str, block_id: &BlockId, segment_file: u32, range: &Range<u64>) -> String {
    chunks_range_key(
        tenant,
        block_id,
        segment_file,
        range.start,
        range.end - range.start,
    )
}

/// Schedules and performs the chunk reads of one batch across all blocks
/// referenced by it.
#[derive(Debug)]
pub struct BucketChunkReaders {
    readers: HashMap<BlockId, BucketChunkReader>,
    tenant: Arc<str>,
    cache: Option<Arc<RemoteCache>>,
    max_gap_size: u64,
    fetch_concurrency: usize,
}

impl BucketChunkReaders {
    /// Create readers for the given blocks, all backed by `store`.
    ///
    /// `tenant` becomes part of every cache key. `cache` is optional; without
    /// it every range read goes to object storage.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tenant: impl Into<Arc<str>>,
        block_ids: impl IntoIterator<Item = BlockId>,
        cache: Option<Arc<RemoteCache>>,
    ) -> Self {
        let readers = block_ids
            .into_iter()
            .map(|block_id| {
                (
                    block_id,
                    BucketChunkReader {
                        block_id,
                        store: Arc::clone(&store),
                        segment_sizes: HashMap::new(),
                        pending: Vec::new(),
                    },
                )
            })
            .collect();

        Self {
            readers,
            tenant: tenant.into(),
            cache,
            max_gap_size: DEFAULT_MAX_GAP_SIZE,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    /// Override the gap threshold for coalescing range reads.
    pub fn with_max_gap_size(mut self, max_gap_size: u64) -> Self {
        self.max_gap_size = max_gap_size;
        self
    }

    /// Override the bound on concurrently in-flight range fetches.
    pub fn with_fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        self.fetch_concurrency = fetch_concurrency.max(1);
        self
    }

    /// Discard the load plan of the previous batch.
    pub fn reset(&mut self) {
        for reader in self.readers.values_mut() {
            reader.pending.clear();
        }
    }

    /// Register one chunk of the current batch for loading into slot
    /// `(series_idx, chunk_idx)` of the output set.
    pub fn add_load(
        &mut self,
        block_id: BlockId,
        chunk_ref: ChunkRef,
        series_idx: usize,
        chunk_idx: usize,
    ) -> Result<(), Error> {
        let reader = self
            .readers
            .get_mut(&block_id)
            .context(UnknownBlockSnafu { block_id })?;
        reader.pending.push(PendingChunk {
            chunk_ref,
            series_idx,
            chunk_idx,
        });
        Ok(())
    }

    /// Perform all registered loads, filling the chunk slots of `set` with
    /// payloads allocated from `bytes`.
    ///
    /// The batch either completes intact or fails with the first error;
    /// slots written before a failure are discarded together with the set by
    /// the caller.
    pub async fn load(
        &mut self,
        set: &mut ChunkSet,
        bytes: &mut ChunkBytesBatch,
        stats: &SafeQueryStats,
        token: &CancellationToken,
    ) -> Result<(), Error> {
        let mut jobs = Vec::new();
        for reader in self.readers.values_mut() {
            if reader.pending.is_empty() {
                continue;
            }
            jobs.extend(reader.plan(&self.tenant, self.max_gap_size, token).await?);
        }
        if jobs.is_empty() {
            return Ok(());
        }

        // One bulk lookup for every planned range of the batch.
        let mut cached = match &self.cache {
            Some(cache) => {
                let keys: Vec<String> = jobs.iter().map(|j| j.key.clone()).collect();
                cache.fetch(&keys).await
            }
            None => HashMap::new(),
        };

        let mut misses = Vec::with_capacity(jobs.len());
        for job in jobs {
            match cached.remove(&job.key) {
                Some(data) if data.len() as u64 == job.range.end - job.range.start => {
                    write_job_chunks(set, bytes, &job, &data, stats, token).await?;
                }
                Some(data) => {
                    // A cached entry of unexpected size cannot be trusted.
                    debug!(
                        key = %job.key,
                        expected = job.range.end - job.range.start,
                        actual = data.len(),
                        "cached chunk range has unexpected length, refetching"
                    );
                    misses.push(job);
                }
                None => misses.push(job),
            }
        }

        let mut to_store: HashMap<String, Bytes> = HashMap::new();
        {
            let concurrency = self.fetch_concurrency;
            let mut fetches = stream::iter(misses.into_iter().map(|job| {
                let token = token.clone();
                async move {
                    let started = Instant::now();
                    let result =
                        fetch_range(&job.store, &job.path, job.range.clone(), &token).await;
                    (job, started.elapsed(), result)
                }
            }))
            .buffer_unordered(concurrency);

            while let Some((job, elapsed, result)) = fetches.next().await {
                let data = result?;
                stats.update(|s| {
                    s.chunks_fetched += job.chunks.len();
                    s.chunks_fetched_size_sum += data.len();
                    s.chunks_fetch_duration += elapsed;
                });
                if self.cache.is_some() {
                    to_store.insert(job.key.clone(), data.clone());
                }
                write_job_chunks(set, bytes, &job, &data, stats, token).await?;
            }
        }

        // Fire-and-forget; the batch is complete regardless of the outcome.
        if let Some(cache) = &self.cache {
            if !to_store.is_empty() {
                cache.store(to_store, CHUNKS_CACHE_TTL);
            }
        }

        Ok(())
    }
}

/// Parse every chunk of a fetched range and write the payloads into their
/// slots. A chunk whose frame turns out longer than the planned range is
/// refetched exactly.
async fn write_job_chunks(
    set: &mut ChunkSet,
    batch: &mut ChunkBytesBatch,
    job: &RangeJob,
    data: &Bytes,
    stats: &SafeQueryStats,
    token: &CancellationToken,
) -> Result<(), Error> {
    for planned in &job.chunks {
        let rel = (planned.offset - job.range.start) as usize;
        let mut current = data.slice(rel..);

        loop {
            let required = {
                let outcome = chunk::parse_chunk(&current).context(MalformedChunkSnafu {
                    path: job.path.clone(),
                    offset: planned.offset,
                })?;
                match outcome {
                    ParseOutcome::Complete(parsed) => {
                        let payload = batch.copy_from(parsed.payload);
                        let slot = set.chunk_mut(planned.series_idx, planned.chunk_idx);
                        slot.encoding = parsed.encoding;
                        slot.data = payload;
                        None
                    }
                    ParseOutcome::NeedMoreData { required } => Some(required),
                }
            };
            let Some(required) = required else { break };

            if required <= current.len() || planned.offset + required as u64 > job.segment_size {
                return TruncatedChunkSnafu {
                    path: job.path.clone(),
                    offset: planned.offset,
                }
                .fail();
            }

            stats.update(|s| s.chunks_refetched += 1);
            current = fetch_range(
                &job.store,
                &job.path,
                planned.offset..planned.offset + required as u64,
                token,
            )
            .await?;
        }
    }

    Ok(())
}

/// Fetch one byte range, retrying transient failures under a bounded
/// exponential policy and honoring cancellation.
async fn fetch_range(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    range: Range<u64>,
    token: &CancellationToken,
) -> Result<Bytes, Error> {
    let fetch = retrying(|| store.get_range(path, range.start as usize..range.end as usize));

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = fetch => result.context(FetchRangeSnafu {
            path: path.clone(),
            offset: range.start,
            length: range.end - range.start,
        }),
    }
}

/// Run `op` under the bounded exponential retry policy. Not-found is
/// terminal immediately; every other store error is treated as transient.
async fn retrying<T, F, Fut>(mut op: F) -> Result<T, object_store::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, object_store::Error>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(Some(Duration::from_secs(5)))
        .build();

    backoff::future::retry(policy, || {
        let fut = op();
        async move {
            fut.await.map_err(|e| match e {
                e @ object_store::Error::NotFound { .. } => backoff::Error::permanent(e),
                e => backoff::Error::transient(e),
            })
        }
    })
    .await
}
