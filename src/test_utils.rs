//! Shared fixtures for the crate's tests: an instrumented object store, mock
//! cache clients, canned set iterators and segment-file builders.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use parking_lot::Mutex;

use crate::block::{chunks_segment_path, BlockId, ChunkRef};
use crate::cache::{CacheClient, ClientError};
use crate::chunk::{encode_uvarint, ChunkEncoding, SEGMENT_FORMAT_V1, SEGMENT_MAGIC};
use crate::iterator::SetIterator;
use crate::pool::SlicePool;
use crate::series::{Labels, SeriesChunkRef, SeriesChunkRefs, SeriesChunkRefsSet};
use crate::Result;

/// An object store decorator counting read requests and optionally injecting
/// failures into range reads.
#[derive(Debug)]
pub(crate) struct InstrumentedStore {
    inner: Arc<dyn ObjectStore>,
    range_requests: AtomicU64,
    head_requests: AtomicU64,
    not_found_prefix: Mutex<Option<String>>,
    transient_failures: AtomicI64,
}

impl InstrumentedStore {
    pub(crate) fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            range_requests: AtomicU64::new(0),
            head_requests: AtomicU64::new(0),
            not_found_prefix: Mutex::new(None),
            transient_failures: AtomicI64::new(0),
        }
    }

    /// A fresh instrumented in-memory store.
    pub(crate) fn in_memory() -> Arc<Self> {
        Arc::new(Self::new(Arc::new(InMemory::new())))
    }

    /// Make every range read under `prefix` fail with a not-found error.
    pub(crate) fn fail_with_not_found(&self, prefix: impl Into<String>) {
        *self.not_found_prefix.lock() = Some(prefix.into());
    }

    /// Make the next `n` range reads fail with a transient error.
    pub(crate) fn fail_transiently(&self, n: i64) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Number of range reads issued so far.
    pub(crate) fn range_requests(&self) -> u64 {
        self.range_requests.load(Ordering::SeqCst)
    }

    /// Number of head requests issued so far.
    pub(crate) fn head_requests(&self) -> u64 {
        self.head_requests.load(Ordering::SeqCst)
    }

    fn check_failures(&self, location: &Path) -> object_store::Result<()> {
        if let Some(prefix) = self.not_found_prefix.lock().as_deref() {
            if location.as_ref().starts_with(prefix) {
                return Err(object_store::Error::NotFound {
                    path: location.to_string(),
                    source: "simulated not-found".to_string().into(),
                });
            }
        }
        if self.transient_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(object_store::Error::Generic {
                store: "InstrumentedStore",
                source: "simulated transient failure".to_string().into(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for InstrumentedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstrumentedStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for InstrumentedStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn get_range(
        &self,
        location: &Path,
        range: Range<usize>,
    ) -> object_store::Result<Bytes> {
        self.range_requests.fetch_add(1, Ordering::SeqCst);
        self.check_failures(location)?;
        self.inner.get_range(location, range).await
    }

    async fn get_ranges(
        &self,
        location: &Path,
        ranges: &[Range<usize>],
    ) -> object_store::Result<Vec<Bytes>> {
        self.range_requests.fetch_add(ranges.len() as u64, Ordering::SeqCst);
        self.check_failures(location)?;
        self.inner.get_ranges(location, ranges).await
    }

    async fn head(&self, location: &Path) -> object_store::Result<ObjectMeta> {
        self.head_requests.fetch_add(1, Ordering::SeqCst);
        self.inner.head(location).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&Path>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// An in-memory [`CacheClient`] with synchronous, always-successful sets.
#[derive(Debug, Default)]
pub(crate) struct MockCacheClient {
    data: Mutex<HashMap<String, Bytes>>,
    set_attempts: AtomicU64,
}

impl MockCacheClient {
    pub(crate) fn seed(&self, key: String, value: Bytes) {
        self.data.lock().insert(key, value);
    }

    pub(crate) fn set_attempts(&self) -> u64 {
        self.set_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.data.lock().len()
    }
}

#[async_trait]
impl CacheClient for MockCacheClient {
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, ClientError> {
        let data = self.data.lock();
        Ok(keys
            .iter()
            .filter_map(|k| data.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn set_async(&self, key: String, value: Bytes, _ttl: Duration) -> Result<(), ClientError> {
        self.set_attempts.fetch_add(1, Ordering::SeqCst);
        self.data.lock().insert(key, value);
        Ok(())
    }
}

/// A [`CacheClient`] whose every operation fails.
#[derive(Debug, Default)]
pub(crate) struct FailingCacheClient {
    set_attempts: AtomicU64,
}

impl FailingCacheClient {
    pub(crate) fn set_attempts(&self) -> u64 {
        self.set_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheClient for FailingCacheClient {
    async fn get_multi(&self, _keys: &[String]) -> Result<HashMap<String, Bytes>, ClientError> {
        Err(ClientError::new("simulated cache outage"))
    }

    fn set_async(&self, _key: String, _value: Bytes, _ttl: Duration) -> Result<(), ClientError> {
        self.set_attempts.fetch_add(1, Ordering::SeqCst);
        Err(ClientError::new("simulated cache outage"))
    }
}

/// A [`SetIterator`] yielding canned items. Fused: once an error is yielded
/// or the items run out, every further advance returns `None`.
pub(crate) struct StaticSetIterator<Set> {
    items: VecDeque<Result<Set>>,
}

impl<Set> StaticSetIterator<Set> {
    pub(crate) fn new(items: Vec<Result<Set>>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

#[async_trait]
impl<Set: Send + 'static> SetIterator for StaticSetIterator<Set> {
    type Set = Set;

    async fn next_set(&mut self) -> Option<Result<Set>> {
        let item = self.items.pop_front()?;
        if item.is_err() {
            self.items.clear();
        }
        Some(item)
    }
}

/// Builds a chunk segment file: header followed by back-to-back frames.
pub(crate) struct SegmentBuilder {
    data: Vec<u8>,
}

impl SegmentBuilder {
    pub(crate) fn new() -> Self {
        let mut data = Vec::new();
        data.extend_from_slice(&SEGMENT_MAGIC.to_be_bytes());
        data.push(SEGMENT_FORMAT_V1);
        data.extend_from_slice(&[0, 0, 0]);
        Self { data }
    }

    /// Append one chunk frame, returning its offset within the segment.
    pub(crate) fn add_chunk(&mut self, encoding: ChunkEncoding, payload: &[u8]) -> u32 {
        let offset = self.data.len() as u32;
        encode_uvarint(payload.len() as u64, &mut self.data);
        let body_start = self.data.len();
        self.data.push(encoding.as_u8());
        self.data.extend_from_slice(payload);
        let crc = crc32fast::hash(&self.data[body_start..]);
        self.data.extend_from_slice(&crc.to_be_bytes());
        offset
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.data.into()
    }
}

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One expected chunk of a seeded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExpectedChunk {
    pub(crate) payload: Bytes,
    pub(crate) min_time: i64,
    pub(crate) max_time: i64,
}

/// A reference batch together with what the pipeline is expected to yield
/// for it.
pub(crate) struct SeededBatch {
    pub(crate) refs: SeriesChunkRefsSet,
    pub(crate) expected: Vec<(Labels, Vec<ExpectedChunk>)>,
}

/// Upload one segment of `block_id` holding `n_series * chunks_per_series`
/// chunks and return the matching reference batch.
///
/// Series names embed `batch_idx` so batches seeded with increasing indexes
/// stay in global lexicographic order.
pub(crate) async fn seed_batch(
    store: &dyn ObjectStore,
    block_id: BlockId,
    segment_file: u32,
    batch_idx: usize,
    n_series: usize,
    chunks_per_series: usize,
    refs_pool: Option<Arc<SlicePool<SeriesChunkRefs>>>,
) -> SeededBatch {
    let mut builder = SegmentBuilder::new();
    let mut refs = SeriesChunkRefsSet::new(n_series, refs_pool);
    let mut expected = Vec::with_capacity(n_series);

    for series_idx in 0..n_series {
        let labels = Labels::from_pairs([(
            "series",
            format!("{batch_idx:03}-{series_idx:03}"),
        )]);

        let mut chunks = Vec::with_capacity(chunks_per_series);
        let mut expected_chunks = Vec::with_capacity(chunks_per_series);
        for chunk_idx in 0..chunks_per_series {
            let payload = format!("payload-{batch_idx}-{series_idx}-{chunk_idx}");
            let offset = builder.add_chunk(ChunkEncoding::Xor, payload.as_bytes());

            let min_time = (chunk_idx * 100) as i64;
            let max_time = min_time + 99;
            chunks.push(SeriesChunkRef {
                block_id,
                chunk_ref: ChunkRef::new(segment_file, offset),
                min_time,
                max_time,
            });
            expected_chunks.push(ExpectedChunk {
                payload: payload.into_bytes().into(),
                min_time,
                max_time,
            });
        }

        refs.push(SeriesChunkRefs {
            labels: labels.clone(),
            chunks,
        });
        expected.push((labels, expected_chunks));
    }

    store
        .put(
            &chunks_segment_path(&block_id, segment_file),
            builder.into_bytes().into(),
        )
        .await
        .expect("upload segment");

    SeededBatch { refs, expected }
}
