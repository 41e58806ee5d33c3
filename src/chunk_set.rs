//! Pooled batches of series with loaded chunks.
//!
//! A [`ChunkSet`] is the unit of streaming between pipeline stages: an
//! ordered group of series, each carrying its fully loaded [`AggrChunk`]s.
//! The set exclusively owns its series buffer, the slabs its chunk runs are
//! carved from, and (through its [`ChunksReleaser`]) the bytes backing every
//! payload. Downstream stages may read, never retain.
//!
//! Ownership of a set moves linearly from the loader to the series adapter,
//! so release happens exactly once, when the set is consumed (or dropped on
//! an error path). Releasing recycles the series buffer and chunk slabs
//! through [`ChunkSetPools`] and invokes the releaser for the payload bytes.

use std::mem;
use std::sync::Arc;

use crate::chunk::AggrChunk;
use crate::pool::{SlabPool, SlabRun, SlicePool};
use crate::series::{Labels, SeriesChunkRef};

/// Number of [`AggrChunk`] slots per slab.
///
/// Blocks span at most 24h; at a 5s scrape interval and 120 samples per
/// chunk that is 86400 / 5 / 120 = 144 chunks per series, so one slab holds
/// several worst-case series without growing past a modest footprint.
pub const SERIES_CHUNKS_SLAB_SIZE: usize = 1000;

/// Capability releasing the bytes backing all chunk payloads of one set.
///
/// Held by the owning [`ChunkSet`] and invoked exactly once when the set is
/// released.
pub trait ChunksReleaser: Send + std::fmt::Debug {
    /// Release the memory backing the set's chunk payloads.
    fn release(&mut self);
}

/// Process-wide pools backing [`ChunkSet`] recycling.
///
/// Injected rather than global so tests can observe allocation and release
/// counts on a private instance.
#[derive(Debug, Default)]
pub struct ChunkSetPools {
    series_entries: Arc<SlicePool<SeriesEntry>>,
    chunk_slabs: Arc<SlicePool<AggrChunk>>,
}

impl ChunkSetPools {
    /// Create a fresh set of pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool recycling series-entry buffers.
    pub fn series_entries(&self) -> &SlicePool<SeriesEntry> {
        &self.series_entries
    }

    /// Pool recycling chunk slabs.
    pub fn chunk_slabs(&self) -> &SlicePool<AggrChunk> {
        &self.chunk_slabs
    }
}

/// One series of a [`ChunkSet`]: its label set and the run of chunk slots
/// carved for it from the set's slab pool.
#[derive(Debug)]
pub struct SeriesEntry {
    labels: Labels,
    chunks: SlabRun,
}

/// An ordered batch of series with loaded chunks.
#[derive(Debug)]
pub struct ChunkSet {
    series: Vec<SeriesEntry>,

    /// `Some` makes the set releasable: its buffers recycle through these
    /// pools when the set is dropped.
    pools: Option<Arc<ChunkSetPools>>,

    /// Lazily initialized so memory is only touched once chunks actually get
    /// populated.
    chunks_pool: Option<SlabPool<AggrChunk>>,

    chunks_releaser: Option<Box<dyn ChunksReleaser>>,
}

impl ChunkSet {
    /// Create a set whose series buffer is guaranteed to have capacity for
    /// at least `series_capacity` entries.
    ///
    /// With `pools`, the buffer is drawn from the series-entry pool; a
    /// pooled buffer of insufficient capacity is discarded and replaced by a
    /// fresh allocation, never regrown.
    pub fn new(series_capacity: usize, pools: Option<Arc<ChunkSetPools>>) -> Self {
        let series = pools
            .as_ref()
            .and_then(|p| p.series_entries.get(series_capacity))
            .unwrap_or_else(|| Vec::with_capacity(series_capacity));
        debug_assert!(series.capacity() >= series_capacity);

        Self {
            series,
            pools,
            chunks_pool: None,
            chunks_releaser: None,
        }
    }

    /// Append a series, carving a chunk run of exactly `chunk_refs.len()`
    /// slots with the time bounds prefilled from the references. Payloads
    /// are populated later by the chunk readers.
    pub fn push_series(&mut self, labels: Labels, chunk_refs: &[SeriesChunkRef]) {
        let run = self.new_chunks_run(chunk_refs.len());
        if !run.is_empty() {
            let chunks = self
                .chunks_pool
                .as_mut()
                .expect("slab pool initialized by new_chunks_run")
                .resolve_mut(run);
            for (chunk, r) in chunks.iter_mut().zip(chunk_refs) {
                chunk.min_time = r.min_time;
                chunk.max_time = r.max_time;
            }
        }
        self.series.push(SeriesEntry { labels, chunks: run });
    }

    /// Carve a run of exactly `len` chunk slots from the set's slab pool,
    /// initializing the pool on first use.
    fn new_chunks_run(&mut self, len: usize) -> SlabRun {
        if len == 0 {
            return SlabRun::default();
        }

        let pools = &self.pools;
        self.chunks_pool
            .get_or_insert_with(|| match pools {
                Some(pools) => {
                    SlabPool::new(Arc::clone(&pools.chunk_slabs), SERIES_CHUNKS_SLAB_SIZE)
                }
                None => SlabPool::unpooled(),
            })
            .get(len)
    }

    /// Number of series in this set.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether the set holds no series.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Capacity of the series buffer.
    pub fn series_capacity(&self) -> usize {
        self.series.capacity()
    }

    /// The labels and chunks of the series at `idx`.
    ///
    /// The returned chunk slice aliases the set; it is invalid once the set
    /// is released.
    pub fn get(&self, idx: usize) -> Option<(&Labels, &[AggrChunk])> {
        let entry = self.series.get(idx)?;
        Some((&entry.labels, self.resolve(entry.chunks)))
    }

    /// The chunks of the series at `idx`.
    pub fn chunks(&self, idx: usize) -> &[AggrChunk] {
        self.resolve(self.series[idx].chunks)
    }

    fn resolve(&self, run: SlabRun) -> &[AggrChunk] {
        match &self.chunks_pool {
            Some(pool) => pool.resolve(run),
            None => &[],
        }
    }

    /// Mutable access to one chunk slot, used by the chunk readers to write
    /// fetched payloads into place.
    pub(crate) fn chunk_mut(&mut self, series_idx: usize, chunk_idx: usize) -> &mut AggrChunk {
        let run = self.series[series_idx].chunks;
        let pool = self.chunks_pool.as_mut().expect("series has chunk slots");
        &mut pool.resolve_mut(run)[chunk_idx]
    }

    /// Attach the releaser owning this set's payload bytes.
    pub fn set_chunks_releaser(&mut self, releaser: Box<dyn ChunksReleaser>) {
        self.chunks_releaser = Some(releaser);
    }

    /// Whether a releaser is attached.
    pub fn has_chunks_releaser(&self) -> bool {
        self.chunks_releaser.is_some()
    }

    /// Whether dropping this set recycles its buffers through pools.
    pub fn releasable(&self) -> bool {
        self.pools.is_some()
    }

    /// Release the set: invoke the chunks releaser, recycle the chunk slabs
    /// and return the series buffer to its pool.
    ///
    /// Consumes the set, so a second release is impossible; dropping without
    /// calling this performs the same cleanup.
    pub fn release(self) {}
}

impl Drop for ChunkSet {
    fn drop(&mut self) {
        if let Some(mut releaser) = self.chunks_releaser.take() {
            releaser.release();
        }

        if let Some(pools) = self.pools.take() {
            // Returning slabs drops every chunk, which in turn drops the
            // payload views pinned by the releaser above.
            if let Some(chunks_pool) = self.chunks_pool.take() {
                chunks_pool.release();
            }
            pools.series_entries.put(mem::take(&mut self.series));
        }
    }
}
