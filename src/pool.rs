//! Memory pools that keep allocation amortized under sustained query load.
//!
//! Three pooling strategies are layered here:
//!
//! * [`SlicePool`] recycles whole `Vec<T>` buffers, handing them back only
//!   when their capacity satisfies the request.
//! * [`SlabPool`] carves exact-length runs out of large fixed-size slabs and
//!   returns the slabs to a delegate [`SlicePool`] as a unit.
//! * [`BytesPool`] recycles byte buffers in power-of-two size classes;
//!   [`ChunkBytesBatch`] pins every buffer handed out during one batch's load
//!   so they are all released together with the batch.
//!
//! All pools are concurrency-safe and expose counters so tests can observe
//! hit rates and outstanding allocations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::chunk_set::ChunksReleaser;

/// Default bound on how many idle buffers a [`SlicePool`] retains.
const DEFAULT_MAX_IDLE: usize = 128;

/// A concurrency-safe pool of reusable `Vec<T>` buffers.
///
/// `get` pops an idle buffer and returns it only if its capacity covers the
/// request; an undersized buffer is dropped rather than regrown, so the pool
/// converges towards the capacities callers actually ask for.
#[derive(Debug)]
pub struct SlicePool<T> {
    idle: Mutex<Vec<Vec<T>>>,
    max_idle: usize,

    gets: AtomicU64,
    hits: AtomicU64,
    puts: AtomicU64,
}

impl<T> Default for SlicePool<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl<T> SlicePool<T> {
    /// Create a pool retaining at most `max_idle` buffers.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Pop an idle buffer with capacity at least `min_capacity`.
    ///
    /// Returns `None` when the pool is empty or the popped buffer is too
    /// small; the caller is expected to allocate a fresh buffer then.
    pub fn get(&self, min_capacity: usize) -> Option<Vec<T>> {
        self.gets.fetch_add(1, Ordering::Relaxed);

        let candidate = self.idle.lock().pop()?;
        if candidate.capacity() < min_capacity {
            // Dropped, not regrown: regrowing would defeat capacity
            // convergence.
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(candidate)
    }

    /// Return a buffer to the pool. The buffer is cleared; its capacity is
    /// retained.
    pub fn put(&self, mut buffer: Vec<T>) {
        buffer.clear();
        self.puts.fetch_add(1, Ordering::Relaxed);

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buffer);
        }
    }

    /// Number of `get` calls so far.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of `get` calls satisfied from the pool.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of buffers returned so far.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A run of elements carved out of a [`SlabPool`], identified by slab index,
/// offset and length. Resolved against the owning pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabRun {
    slab: u32,
    offset: u32,
    len: u32,
}

impl SlabRun {
    /// Number of elements in the run.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the run is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Allocates exact-length element runs by carving large slabs.
///
/// Slabs are obtained from a delegate [`SlicePool`] and returned to it as a
/// whole by [`release`](Self::release). A pool built with
/// [`unpooled`](Self::unpooled) allocates one dedicated slab per request and
/// never recycles; it exists so non-releasable chunk-sets share the same code
/// path.
#[derive(Debug)]
pub struct SlabPool<T> {
    delegate: Option<Arc<SlicePool<T>>>,
    slab_size: usize,
    slabs: Vec<Vec<T>>,
}

impl<T: Default> SlabPool<T> {
    /// Create a pool carving `slab_size`-slot slabs from `delegate`.
    pub fn new(delegate: Arc<SlicePool<T>>, slab_size: usize) -> Self {
        assert!(slab_size > 0, "slab size must be non-zero");
        Self {
            delegate: Some(delegate),
            slab_size,
            slabs: Vec::new(),
        }
    }

    /// Create a pool that allocates a dedicated, exactly-sized slab per
    /// request and returns nothing on release.
    pub fn unpooled() -> Self {
        Self {
            delegate: None,
            slab_size: 0,
            slabs: Vec::new(),
        }
    }

    /// Carve a run of exactly `len` default-initialized elements.
    pub fn get(&mut self, len: usize) -> SlabRun {
        if len == 0 {
            return SlabRun::default();
        }

        let needs_new_slab = match self.slabs.last() {
            Some(slab) => slab.capacity() - slab.len() < len,
            None => true,
        };
        if needs_new_slab {
            let capacity = self.slab_size.max(len);
            let slab = self
                .delegate
                .as_ref()
                .and_then(|pool| pool.get(capacity))
                .unwrap_or_else(|| Vec::with_capacity(capacity));
            self.slabs.push(slab);
        }

        let slab_idx = self.slabs.len() - 1;
        let slab = &mut self.slabs[slab_idx];
        let offset = slab.len();
        slab.resize_with(offset + len, T::default);

        SlabRun {
            slab: slab_idx as u32,
            offset: offset as u32,
            len: len as u32,
        }
    }

    /// Resolve a run previously returned by [`get`](Self::get).
    pub fn resolve(&self, run: SlabRun) -> &[T] {
        if run.is_empty() {
            return &[];
        }
        let offset = run.offset as usize;
        &self.slabs[run.slab as usize][offset..offset + run.len as usize]
    }

    /// Mutably resolve a run previously returned by [`get`](Self::get).
    pub fn resolve_mut(&mut self, run: SlabRun) -> &mut [T] {
        if run.is_empty() {
            return &mut [];
        }
        let offset = run.offset as usize;
        &mut self.slabs[run.slab as usize][offset..offset + run.len as usize]
    }

    /// Drop all elements and hand every slab back to the delegate pool.
    ///
    /// Outstanding [`SlabRun`]s become dangling; the owner must not resolve
    /// them afterwards.
    pub fn release(mut self) {
        if let Some(delegate) = self.delegate.take() {
            for slab in self.slabs.drain(..) {
                delegate.put(slab);
            }
        }
    }
}

/// Smallest byte-buffer size class.
const MIN_BYTES_CLASS: usize = 256;

/// Largest byte-buffer size class. Requests above this are allocated exactly
/// and never pooled.
const MAX_BYTES_CLASS: usize = 64 * 1024;

/// A pool of byte buffers bucketed into power-of-two size classes.
#[derive(Debug)]
pub struct BytesPool {
    classes: Vec<SizeClass>,
    max_idle_per_class: usize,

    gets: AtomicU64,
    hits: AtomicU64,
    puts: AtomicU64,
}

#[derive(Debug)]
struct SizeClass {
    size: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl Default for BytesPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl BytesPool {
    /// Create a pool retaining at most `max_idle_per_class` buffers per size
    /// class.
    pub fn new(max_idle_per_class: usize) -> Self {
        let mut classes = Vec::new();
        let mut size = MIN_BYTES_CLASS;
        while size <= MAX_BYTES_CLASS {
            classes.push(SizeClass {
                size,
                idle: Mutex::new(Vec::new()),
            });
            size *= 2;
        }

        Self {
            classes,
            max_idle_per_class,
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Get an empty buffer with capacity at least `min_capacity`.
    pub fn get(&self, min_capacity: usize) -> Vec<u8> {
        self.gets.fetch_add(1, Ordering::Relaxed);

        let Some(class) = self.class_for(min_capacity) else {
            // Above the largest class: exact allocation, never pooled.
            return Vec::with_capacity(min_capacity);
        };

        if let Some(buffer) = class.idle.lock().pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return buffer;
        }
        Vec::with_capacity(class.size)
    }

    /// Return a buffer to its size class. Buffers whose capacity matches no
    /// class are dropped.
    pub fn put(&self, mut buffer: Vec<u8>) {
        self.puts.fetch_add(1, Ordering::Relaxed);

        let Some(class) = self.class_matching(buffer.capacity()) else {
            return;
        };
        buffer.clear();

        let mut idle = class.idle.lock();
        if idle.len() < self.max_idle_per_class {
            idle.push(buffer);
        }
    }

    fn class_for(&self, min_capacity: usize) -> Option<&SizeClass> {
        self.classes.iter().find(|c| c.size >= min_capacity)
    }

    fn class_matching(&self, capacity: usize) -> Option<&SizeClass> {
        if capacity > MAX_BYTES_CLASS {
            return None;
        }
        self.classes.iter().rev().find(|c| c.size <= capacity)
    }

    /// Number of `get` calls so far.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of `get` calls satisfied from the pool.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of buffers returned so far.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of buffers currently idle across all classes.
    pub fn idle_len(&self) -> usize {
        self.classes.iter().map(|c| c.idle.lock().len()).sum()
    }
}

/// A pooled byte buffer that returns itself to its [`BytesPool`] when the
/// last [`Bytes`] view over it is dropped.
#[derive(Debug)]
struct PooledBuf {
    buffer: Option<Vec<u8>>,
    pool: Arc<BytesPool>,
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.put(buffer);
        }
    }
}

/// Byte allocations scoped to a single batch load.
///
/// Every buffer handed out through [`copy_from`](Self::copy_from) is pinned
/// by this batch until [`ChunksReleaser::release`] runs; together with the
/// owning chunk-set dropping its payload views, that returns all buffers to
/// the shared [`BytesPool`] at once.
#[derive(Debug)]
pub struct ChunkBytesBatch {
    delegate: Arc<BytesPool>,
    roots: Vec<Bytes>,
}

impl ChunkBytesBatch {
    /// Create a batch allocator drawing from `delegate`.
    pub fn new(delegate: Arc<BytesPool>) -> Self {
        Self {
            delegate,
            roots: Vec::new(),
        }
    }

    /// Copy `data` into a pooled buffer owned by this batch and return a view
    /// of it.
    pub fn copy_from(&mut self, data: &[u8]) -> Bytes {
        let mut buffer = self.delegate.get(data.len());
        buffer.extend_from_slice(data);

        let root = Bytes::from_owner(PooledBuf {
            buffer: Some(buffer),
            pool: Arc::clone(&self.delegate),
        });
        self.roots.push(root.clone());
        root
    }

    /// Number of buffers allocated by this batch so far.
    pub fn allocated(&self) -> usize {
        self.roots.len()
    }
}

impl ChunksReleaser for ChunkBytesBatch {
    fn release(&mut self) {
        self.roots.clear();
    }
}
