//! Chunk payloads and the on-disk framing used by segment files.
//!
//! A segment file is a short header followed by back-to-back chunk frames.
//! Each frame is:
//!
//! ```text
//! uvarint payload length | encoding (1 byte) | payload | crc32 (4 bytes, BE)
//! ```
//!
//! The checksum covers the encoding byte and the payload. Chunk references
//! point at the first byte of the uvarint, so a reader positioned at a
//! reference can parse the frame without consulting the header.

use bytes::Bytes;
use snafu::Snafu;

/// Length of the segment file header: 4 bytes of magic, one format version
/// byte, three bytes of padding.
pub const SEGMENT_HEADER_LEN: usize = 8;

/// Magic number opening every chunk segment file.
pub const SEGMENT_MAGIC: u32 = 0x6368_6B73;

/// Current segment file format version.
pub const SEGMENT_FORMAT_V1: u8 = 1;

/// Estimated upper bound of an encoded chunk frame, used to size range reads
/// when the distance to the next chunk is unknown. Chunks larger than this
/// are handled by an exact refetch of the missing tail.
pub const ESTIMATED_MAX_CHUNK_SIZE: usize = 16_000;

/// Hard upper bound of a chunk payload. A frame declaring a larger payload is
/// treated as corruption rather than fetched.
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

/// Maximum number of bytes a payload-length uvarint can occupy.
const MAX_UVARINT_LEN: usize = 10;

/// Bytes of frame overhead around the payload when the uvarint is at its
/// longest: length prefix, encoding byte and checksum.
const MAX_FRAME_OVERHEAD: usize = MAX_UVARINT_LEN + 1 + 4;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("unknown chunk encoding {}", encoding))]
    UnknownEncoding { encoding: u8 },

    #[snafu(display("malformed chunk length prefix"))]
    MalformedLength,

    #[snafu(display("chunk payload length {} exceeds maximum {}", len, MAX_CHUNK_SIZE))]
    OversizedChunk { len: u64 },

    #[snafu(display(
        "chunk checksum mismatch: stored {:#010x}, computed {:#010x}",
        stored,
        computed
    ))]
    ChecksumMismatch { stored: u32, computed: u32 },
}

/// Encoding of a chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkEncoding {
    /// Double-delta timestamps with XOR-compressed float values.
    Xor,
    /// Native integer histogram samples.
    Histogram,
    /// Native float histogram samples.
    FloatHistogram,
}

impl ChunkEncoding {
    /// The on-disk byte identifying this encoding.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Xor => 1,
            Self::Histogram => 2,
            Self::FloatHistogram => 3,
        }
    }
}

impl TryFrom<u8> for ChunkEncoding {
    type Error = Error;

    fn try_from(encoding: u8) -> Result<Self, Error> {
        match encoding {
            1 => Ok(Self::Xor),
            2 => Ok(Self::Histogram),
            3 => Ok(Self::FloatHistogram),
            _ => Err(Error::UnknownEncoding { encoding }),
        }
    }
}

/// Aggregation carried by a chunk payload.
///
/// `Raw` is the original sample stream. The remaining variants are
/// precomputed downsampling aggregates; their payloads pass through this
/// crate opaque, exactly like raw ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChunkAggregation {
    #[default]
    Raw,
    Count,
    Sum,
    Min,
    Max,
    Counter,
}

/// A chunk payload together with its time bounds.
///
/// The time bounds are carried redundantly from the chunk reference so that
/// consumers never need to re-parse the payload to learn them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggrChunk {
    /// Timestamp of the first sample, milliseconds since epoch.
    pub min_time: i64,
    /// Timestamp of the last sample, milliseconds since epoch.
    pub max_time: i64,
    /// Aggregation of the payload.
    pub aggregation: ChunkAggregation,
    /// Encoding of the payload.
    pub encoding: ChunkEncoding,
    /// The encoded samples. Owned by the chunk-set's releaser; invalid after
    /// the owning set is released.
    pub data: Bytes,
}

impl Default for AggrChunk {
    fn default() -> Self {
        Self {
            min_time: 0,
            max_time: 0,
            aggregation: ChunkAggregation::Raw,
            encoding: ChunkEncoding::Xor,
            data: Bytes::new(),
        }
    }
}

impl AggrChunk {
    /// Zero all fields and drop the payload reference.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Result of parsing a chunk frame out of a (possibly too short) buffer.
#[derive(Debug)]
pub enum ParseOutcome<'a> {
    /// The frame was complete and its checksum valid.
    Complete(ParsedChunk<'a>),
    /// The buffer ends before the frame does; `required` is the number of
    /// bytes, counted from the start of the frame, needed to finish parsing.
    NeedMoreData { required: usize },
}

/// A successfully parsed chunk frame.
#[derive(Debug)]
pub struct ParsedChunk<'a> {
    /// Encoding declared by the frame.
    pub encoding: ChunkEncoding,
    /// The payload, borrowed from the input buffer.
    pub payload: &'a [u8],
    /// Total size of the frame including prefix and checksum.
    pub frame_len: usize,
}

/// Parse the chunk frame starting at the beginning of `buf`.
pub fn parse_chunk(buf: &[u8]) -> Result<ParseOutcome<'_>, Error> {
    let (len, prefix_len) = match decode_uvarint(buf) {
        UvarintOutcome::Value(len, n) => (len, n),
        UvarintOutcome::Incomplete => {
            return Ok(ParseOutcome::NeedMoreData {
                required: MAX_FRAME_OVERHEAD,
            })
        }
        UvarintOutcome::Malformed => return Err(Error::MalformedLength),
    };

    if len > MAX_CHUNK_SIZE as u64 {
        return Err(Error::OversizedChunk { len });
    }
    let len = len as usize;

    let required = prefix_len + 1 + len + 4;
    if buf.len() < required {
        return Ok(ParseOutcome::NeedMoreData { required });
    }

    let encoding = ChunkEncoding::try_from(buf[prefix_len])?;
    let payload = &buf[prefix_len + 1..prefix_len + 1 + len];

    let stored = u32::from_be_bytes(
        buf[prefix_len + 1 + len..required]
            .try_into()
            .expect("slice is four bytes"),
    );
    let computed = crc32fast::hash(&buf[prefix_len..prefix_len + 1 + len]);
    if stored != computed {
        return Err(Error::ChecksumMismatch { stored, computed });
    }

    Ok(ParseOutcome::Complete(ParsedChunk {
        encoding,
        payload,
        frame_len: required,
    }))
}

#[derive(Debug)]
enum UvarintOutcome {
    Value(u64, usize),
    Incomplete,
    Malformed,
}

fn decode_uvarint(buf: &[u8]) -> UvarintOutcome {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &b) in buf.iter().enumerate() {
        if i >= MAX_UVARINT_LEN || (i == MAX_UVARINT_LEN - 1 && b > 1) {
            return UvarintOutcome::Malformed;
        }
        if b < 0x80 {
            return UvarintOutcome::Value(value | u64::from(b) << shift, i + 1);
        }
        value |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    if buf.len() >= MAX_UVARINT_LEN {
        UvarintOutcome::Malformed
    } else {
        UvarintOutcome::Incomplete
    }
}

#[cfg(test)]
pub(crate) fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push(value as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn encode_frame(encoding: ChunkEncoding, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        encode_uvarint(payload.len() as u64, &mut frame);
        let body_start = frame.len();
        frame.push(encoding.as_u8());
        frame.extend_from_slice(payload);
        let crc = crc32fast::hash(&frame[body_start..]);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame
    }

    #[test]
    fn uvarint_round_trips() {
        for value in [0, 1, 127, 128, 300, 16_000, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            encode_uvarint(value, &mut buf);
            assert_matches!(
                decode_uvarint(&buf),
                UvarintOutcome::Value(v, n) if v == value && n == buf.len()
            );
        }
    }

    #[test]
    fn uvarint_incomplete_and_malformed() {
        assert_matches!(decode_uvarint(&[0x80]), UvarintOutcome::Incomplete);
        assert_matches!(decode_uvarint(&[]), UvarintOutcome::Incomplete);
        assert_matches!(decode_uvarint(&[0x80; 10]), UvarintOutcome::Malformed);
    }

    #[test]
    fn parses_complete_frame() {
        let payload = vec![0xAB; 300];
        let frame = encode_frame(ChunkEncoding::Histogram, &payload);

        let parsed = assert_matches!(
            parse_chunk(&frame).unwrap(),
            ParseOutcome::Complete(c) => c
        );
        assert_eq!(parsed.encoding, ChunkEncoding::Histogram);
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.frame_len, frame.len());
    }

    #[test]
    fn parses_frame_with_trailing_data() {
        let mut buf = encode_frame(ChunkEncoding::Xor, b"abc");
        let frame_len = buf.len();
        buf.extend_from_slice(&encode_frame(ChunkEncoding::Xor, b"next chunk"));

        let parsed = assert_matches!(
            parse_chunk(&buf).unwrap(),
            ParseOutcome::Complete(c) => c
        );
        assert_eq!(parsed.payload, b"abc");
        assert_eq!(parsed.frame_len, frame_len);
    }

    #[test]
    fn reports_required_length_when_truncated() {
        let frame = encode_frame(ChunkEncoding::Xor, &[0xCD; 5_000]);

        let required = assert_matches!(
            parse_chunk(&frame[..100]).unwrap(),
            ParseOutcome::NeedMoreData { required } => required
        );
        assert_eq!(required, frame.len());

        // With the required bytes available, parsing completes.
        assert_matches!(
            parse_chunk(&frame[..required]).unwrap(),
            ParseOutcome::Complete(_)
        );
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let mut frame = encode_frame(ChunkEncoding::Xor, b"payload");
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        assert_matches!(parse_chunk(&frame), Err(Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn rejects_unknown_encoding() {
        let mut frame = Vec::new();
        encode_uvarint(3, &mut frame);
        frame.push(9);
        frame.extend_from_slice(b"abc");
        let crc = crc32fast::hash(&frame[1..]);
        frame.extend_from_slice(&crc.to_be_bytes());

        assert_matches!(parse_chunk(&frame), Err(Error::UnknownEncoding { encoding: 9 }));
    }

    #[test]
    fn rejects_oversized_declared_payload() {
        let mut frame = Vec::new();
        encode_uvarint(MAX_CHUNK_SIZE as u64 + 1, &mut frame);
        frame.push(1);

        assert_matches!(parse_chunk(&frame), Err(Error::OversizedChunk { .. }));
    }

    #[test]
    fn aggr_chunk_reset_clears_payload() {
        let mut chunk = AggrChunk {
            min_time: 5,
            max_time: 90,
            aggregation: ChunkAggregation::Sum,
            encoding: ChunkEncoding::Histogram,
            data: Bytes::from_static(b"data"),
        };
        chunk.reset();
        assert_eq!(chunk, AggrChunk::default());
        assert!(chunk.data.is_empty());
    }
}
