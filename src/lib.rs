//! Streaming series-chunks loading pipeline.
//!
//! This crate implements the read path that turns resolved series-chunk
//! *references* (block id, chunk position, time bounds) into a stream of
//! series paired with their chunk payloads, ready for an RPC streaming
//! response. Chunks live in immutable blocks in object storage; the pipeline
//! loads them in batches, overlaps I/O with consumption, and recycles the
//! memory backing each batch as soon as the consumer moves past it.
//!
//! # Pipeline
//!
//! The pipeline is a chain of set-iterators. Each stage yields a whole batch
//! per advance, not individual series, which amortizes scheduling, pool and
//! I/O costs:
//!
//! ```text
//! reference iterator          (external: matchers -> SeriesChunkRefsSet)
//!       |
//! LoadingSetIterator          (bulk chunk reads -> ChunkSet)
//!       |
//! MeasuredSetIterator         (stage = "chunks_load")
//!       |
//! PreloadingSetIterator       (background producer, bounded channel)
//!       |
//! MeasuredSetIterator         (stage = "chunks_preloaded")
//!       |
//! ChunkedSeriesSet            (series-at-a-time adapter for the RPC layer)
//! ```
//!
//! Ownership of every batch moves linearly down this chain; a batch's memory
//! returns to the shared pools exactly once, when the adapter advances past
//! it (or when an errored batch is dropped inside the loader).

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;

pub mod block;
pub mod cache;
pub mod chunk;
pub mod chunk_set;
pub mod iterator;
pub mod loader;
pub mod metrics;
pub mod pool;
pub mod reader;
pub mod series;
pub mod series_set;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_utils;

/// Terminal error of a streaming pipeline.
///
/// Errors are latched on the stage where they originate and forwarded
/// verbatim by every downstream stage; no stage invents errors of its own.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("gathering series chunk references: {}", source))]
    References {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("registering chunk loads: {}", source))]
    PlanChunks { source: reader::Error },

    #[snafu(display("loading chunks: {}", source))]
    LoadChunks { source: reader::Error },

    #[snafu(display("query cancelled"))]
    Cancelled,
}

/// A specialized `Result` for pipeline errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
