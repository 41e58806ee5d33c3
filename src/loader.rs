//! The loading stage and the composition of the full pipeline.
//!
//! [`LoadingSetIterator`] turns batches of chunk references into [`ChunkSet`]s
//! with fully populated payloads. [`chunk_streaming_series_set`] wires the
//! loader, the measuring and preloading stages and the series adapter
//! together the way a `Series` RPC handler consumes them.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::chunk_set::{ChunkSet, ChunkSetPools};
use crate::iterator::{MeasuredSetIterator, PreloadingSetIterator, SetIterator};
use crate::metrics::{StoreGatewayMetrics, STAGE_CHUNKS_LOAD, STAGE_CHUNKS_PRELOADED};
use crate::pool::{BytesPool, ChunkBytesBatch};
use crate::reader::BucketChunkReaders;
use crate::series::SeriesChunkRefsSet;
use crate::series_set::ChunkedSeriesSet;
use crate::stats::SafeQueryStats;
use crate::{Error, PlanChunksSnafu, Result};

/// Iterator loading the chunks referenced by each upstream batch.
///
/// Each advance pulls one reference batch, registers every chunk with the
/// bucket readers, performs the bulk load and yields a releasable
/// [`ChunkSet`]. The reference batch is dropped (recycling its buffers) as
/// soon as the chunk-set is built; an errored partial set is likewise
/// dropped, never delivered.
#[derive(Debug)]
pub struct LoadingSetIterator<I> {
    from: I,
    from_batch_size: usize,
    readers: BucketChunkReaders,
    pools: Arc<ChunkSetPools>,
    bytes_pool: Arc<BytesPool>,
    stats: SafeQueryStats,
    token: CancellationToken,
    done: bool,
}

impl<I> LoadingSetIterator<I>
where
    I: SetIterator<Set = SeriesChunkRefsSet>,
{
    /// Create a loading iterator over `from`.
    ///
    /// `from_batch_size` is the batch size hint the reference stage was
    /// configured with; output sets are provisioned to at least that many
    /// series so pooled buffer capacities converge across batches.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        readers: BucketChunkReaders,
        bytes_pool: Arc<BytesPool>,
        pools: Arc<ChunkSetPools>,
        from: I,
        from_batch_size: usize,
        stats: SafeQueryStats,
        token: CancellationToken,
    ) -> Self {
        Self {
            from,
            from_batch_size,
            readers,
            pools,
            bytes_pool,
            stats,
            token,
            done: false,
        }
    }

    async fn load_one(&mut self, refs: &SeriesChunkRefsSet) -> Result<ChunkSet> {
        // Provision for the configured batch size even when this batch is
        // smaller, so the pooled series buffer converges to one capacity and
        // pool hits stay high across batches.
        let mut set = ChunkSet::new(
            self.from_batch_size.max(refs.len()),
            Some(Arc::clone(&self.pools)),
        );

        self.readers.reset();
        for (series_idx, series) in refs.series().iter().enumerate() {
            set.push_series(series.labels.clone(), &series.chunks);
            for (chunk_idx, chunk) in series.chunks.iter().enumerate() {
                self.readers
                    .add_load(chunk.block_id, chunk.chunk_ref, series_idx, chunk_idx)
                    .context(PlanChunksSnafu)?;
            }
        }

        // Pin every byte allocated while loading to this batch; the batch
        // becomes the set's releaser.
        let mut batch = ChunkBytesBatch::new(Arc::clone(&self.bytes_pool));
        self.readers
            .load(&mut set, &mut batch, &self.stats, &self.token)
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    Error::Cancelled
                } else {
                    Error::LoadChunks { source: e }
                }
            })?;
        set.set_chunks_releaser(Box::new(batch));

        Ok(set)
    }
}

#[async_trait]
impl<I> SetIterator for LoadingSetIterator<I>
where
    I: SetIterator<Set = SeriesChunkRefsSet>,
{
    type Set = ChunkSet;

    async fn next_set(&mut self) -> Option<Result<ChunkSet>> {
        if self.done {
            return None;
        }
        if self.token.is_cancelled() {
            self.done = true;
            return Some(Err(Error::Cancelled));
        }

        let refs = match self.from.next_set().await {
            None => {
                self.done = true;
                return None;
            }
            Some(Err(e)) => {
                self.done = true;
                return Some(Err(e));
            }
            Some(Ok(refs)) => refs,
        };

        // This stage is the last reader of the references; `refs` is dropped
        // (recycling its buffers) when this function returns.
        match self.load_one(&refs).await {
            Ok(set) => Some(Ok(set)),
            Err(e) => {
                // The partial output set was already dropped inside
                // `load_one`; latch the error.
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Number of loaded batches materialized ahead of the consumer.
const PRELOADED_SET_COUNT: usize = 1;

/// Build the full streaming pipeline over a reference iterator:
/// load, measure, preload, measure again, flatten.
///
/// The caller drives the returned [`ChunkedSeriesSet`] to exhaustion or
/// cancels `token`; either way every materialized batch is released.
#[allow(clippy::too_many_arguments)]
pub fn chunk_streaming_series_set<I>(
    token: CancellationToken,
    readers: BucketChunkReaders,
    bytes_pool: Arc<BytesPool>,
    pools: Arc<ChunkSetPools>,
    refs_iterator: I,
    refs_batch_size: usize,
    stats: SafeQueryStats,
    metrics: &StoreGatewayMetrics,
) -> ChunkedSeriesSet<impl SetIterator<Set = ChunkSet>>
where
    I: SetIterator<Set = SeriesChunkRefsSet> + 'static,
{
    let iterator = LoadingSetIterator::new(
        readers,
        bytes_pool,
        pools,
        refs_iterator,
        refs_batch_size,
        stats,
        token.clone(),
    );
    let iterator = MeasuredSetIterator::new(iterator, metrics.stage_duration(STAGE_CHUNKS_LOAD));
    let iterator = PreloadingSetIterator::new(token, PRELOADED_SET_COUNT, iterator);
    // Waiting for a preloaded batch is ideally free because one is always
    // ready; comparing this histogram with the chunks_load one shows where
    // the streaming pipeline bottlenecks.
    let iterator =
        MeasuredSetIterator::new(iterator, metrics.stage_duration(STAGE_CHUNKS_PRELOADED));
    ChunkedSeriesSet::new(iterator)
}
