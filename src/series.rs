//! Series identity and series-chunk references.
//!
//! A series is identified by its label set. The reference stage (external to
//! this crate) resolves label matchers into batches of [`SeriesChunkRefs`]:
//! per series, the addresses and time bounds of every chunk that overlaps
//! the queried time range.

use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::block::{BlockId, ChunkRef};
use crate::pool::SlicePool;

/// A single label name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// An immutable, sorted label set identifying one series.
///
/// Cloning is cheap: the underlying storage is shared. The derived order is
/// the lexicographic order of the label sequence, which is the order the
/// reference stage sorts series by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Arc<[Label]>);

impl Default for Labels {
    fn default() -> Self {
        Self(Vec::new().into())
    }
}

impl Labels {
    /// Build a label set from name/value pairs, sorting them by name.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = pairs
            .into_iter()
            .map(|(name, value)| Label {
                name: name.into(),
                value: value.into(),
            })
            .collect();
        labels.sort();
        Self(labels.into())
    }

    /// Value of the label with the given name, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Iterate over the labels in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the label set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialOrd for Labels {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Labels {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_ref().cmp(other.0.as_ref())
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

/// Address and time bounds of one chunk of one series.
///
/// The time bounds duplicate what the chunk payload itself encodes, so that
/// neither the loader nor its consumers re-parse payloads to learn them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesChunkRef {
    /// Block holding the chunk.
    pub block_id: BlockId,
    /// Position of the chunk within the block.
    pub chunk_ref: ChunkRef,
    /// Timestamp of the chunk's first sample, milliseconds since epoch.
    pub min_time: i64,
    /// Timestamp of the chunk's last sample, milliseconds since epoch.
    pub max_time: i64,
}

/// One series together with references to all its chunks, in ascending
/// `min_time` order.
#[derive(Debug, Clone)]
pub struct SeriesChunkRefs {
    /// The series' label set.
    pub labels: Labels,
    /// References to the series' chunks.
    pub chunks: Vec<SeriesChunkRef>,
}

/// An ordered batch of series with chunk references, produced by the
/// reference stage.
///
/// When built with a pool, dropping the set returns its series buffer for
/// reuse. The loader is the last reader of a reference set and drops it as
/// soon as the corresponding chunk-set is built.
#[derive(Debug)]
pub struct SeriesChunkRefsSet {
    series: Vec<SeriesChunkRefs>,
    pool: Option<Arc<SlicePool<SeriesChunkRefs>>>,
}

impl SeriesChunkRefsSet {
    /// Create a set whose series buffer has capacity for at least
    /// `series_capacity` entries, drawing the buffer from `pool` when one of
    /// sufficient capacity is available.
    pub fn new(series_capacity: usize, pool: Option<Arc<SlicePool<SeriesChunkRefs>>>) -> Self {
        let series = pool
            .as_ref()
            .and_then(|p| p.get(series_capacity))
            .unwrap_or_else(|| Vec::with_capacity(series_capacity));
        Self { series, pool }
    }

    /// Append a series. Series must be pushed in ascending label-set order.
    pub fn push(&mut self, series: SeriesChunkRefs) {
        self.series.push(series);
    }

    /// The series in this set.
    pub fn series(&self) -> &[SeriesChunkRefs] {
        &self.series
    }

    /// Number of series in this set.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether the set holds no series.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Whether dropping this set recycles its series buffer.
    pub fn releasable(&self) -> bool {
        self.pool.is_some()
    }

    /// Release the set. Equivalent to dropping it; provided so release
    /// points read explicitly at call sites.
    pub fn release(self) {}
}

impl Drop for SeriesChunkRefsSet {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(mem::take(&mut self.series));
        }
    }
}
