//! Addressing of chunks within immutable blocks.
//!
//! A block stores its chunk data in one or more *segment files*, named by a
//! monotonically increasing id under the block's `chunks/` prefix. A chunk is
//! addressed by a [`ChunkRef`], a 64-bit value packing the segment file id
//! and the byte offset of the chunk within that segment.

use std::fmt;
use std::str::FromStr;

use object_store::path::Path;
use uuid::Uuid;

/// Unique id of an immutable block in object storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Create a new random block id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing id.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying uuid.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BlockId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Position of a chunk within a block: segment file id in the upper 32 bits,
/// byte offset within that segment in the lower 32 bits.
///
/// The packing must match the block writer bit-for-bit; both halves
/// round-trip exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkRef(u64);

impl ChunkRef {
    /// Pack a segment file id and an offset within that segment.
    pub fn new(segment_file: u32, offset: u32) -> Self {
        Self(u64::from(segment_file) << 32 | u64::from(offset))
    }

    /// Reinterpret a raw 64-bit reference produced by the block writer.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit representation.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Id of the segment file holding the chunk.
    pub fn segment_file(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Byte offset of the chunk within its segment file.
    pub fn offset(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_file(), self.offset())
    }
}

/// Object storage location of a block's chunk segment file.
///
/// Segment files are named by zero-padded six-digit decimal id, e.g.
/// `<block id>/chunks/000001`.
pub fn chunks_segment_path(block_id: &BlockId, segment_file: u32) -> Path {
    Path::from(format!("{}/chunks/{:06}", block_id, segment_file))
}
