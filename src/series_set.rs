//! Series-at-a-time adapter over a stream of chunk-sets.

use async_trait::async_trait;

use crate::chunk::AggrChunk;
use crate::chunk_set::ChunkSet;
use crate::iterator::SetIterator;
use crate::series::Labels;
use crate::Error;

/// The series stream consumed by the RPC layer: one series with its loaded
/// chunks per advance, in the order established by the reference stage.
#[async_trait]
pub trait SeriesSet: Send {
    /// Advance to the next series. Returns `false` on exhaustion or error;
    /// [`err`](Self::err) distinguishes the two.
    async fn next(&mut self) -> bool;

    /// The current series.
    ///
    /// The returned chunk slice aliases the current batch and is invalidated
    /// by the next call to [`next`](Self::next); callers that need to retain
    /// it must copy.
    fn at(&self) -> Option<(&Labels, &[AggrChunk])>;

    /// The terminal error, if iteration failed. Stable once
    /// [`next`](Self::next) has returned `false`.
    fn err(&self) -> Option<&Error>;
}

/// Flattens [`ChunkSet`] batches into a [`SeriesSet`].
///
/// This adapter is the sole release point for loader output on the happy
/// path: a batch is released exactly when iteration moves off it.
#[derive(Debug)]
pub struct ChunkedSeriesSet<I> {
    from: I,
    current: Option<ChunkSet>,
    offset: usize,
    err: Option<Error>,
    done: bool,
}

impl<I> ChunkedSeriesSet<I>
where
    I: SetIterator<Set = ChunkSet>,
{
    /// Adapt `from` into a series-at-a-time stream.
    pub fn new(from: I) -> Self {
        Self {
            from,
            current: None,
            offset: 0,
            err: None,
            done: false,
        }
    }
}

#[async_trait]
impl<I> SeriesSet for ChunkedSeriesSet<I>
where
    I: SetIterator<Set = ChunkSet>,
{
    async fn next(&mut self) -> bool {
        if self.done {
            return false;
        }

        self.offset += 1;
        while self
            .current
            .as_ref()
            .map_or(true, |set| self.offset >= set.len())
        {
            // The current batch won't be read anymore: release it before
            // pulling the next one.
            if let Some(set) = self.current.take() {
                set.release();
            }

            match self.from.next_set().await {
                None => {
                    self.done = true;
                    return false;
                }
                Some(Err(e)) => {
                    self.err = Some(e);
                    self.done = true;
                    return false;
                }
                Some(Ok(set)) => {
                    self.current = Some(set);
                    self.offset = 0;
                }
            }
        }
        true
    }

    fn at(&self) -> Option<(&Labels, &[AggrChunk])> {
        self.current.as_ref().and_then(|set| set.get(self.offset))
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_set::ChunkSetPools;
    use crate::series::SeriesChunkRef;
    use crate::test_utils::StaticSetIterator;
    use crate::Result;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn set_with_series(pools: &Arc<ChunkSetPools>, names: &[&str]) -> ChunkSet {
        let mut set = ChunkSet::new(names.len(), Some(Arc::clone(pools)));
        for name in names {
            set.push_series(Labels::from_pairs([("name", *name)]), &[] as &[SeriesChunkRef]);
        }
        set
    }

    async fn collect_names(series_set: &mut impl SeriesSet) -> Vec<String> {
        let mut names = Vec::new();
        while series_set.next().await {
            let (labels, _) = series_set.at().expect("current series after next");
            names.push(labels.get("name").unwrap().to_string());
        }
        names
    }

    #[tokio::test]
    async fn flattens_batches_in_order() {
        let pools = Arc::new(ChunkSetPools::new());
        let batches: Vec<Result<ChunkSet>> = vec![
            Ok(set_with_series(&pools, &["a", "b"])),
            Ok(set_with_series(&pools, &["c"])),
            Ok(set_with_series(&pools, &["d", "e", "f"])),
        ];

        let mut series_set = ChunkedSeriesSet::new(StaticSetIterator::new(batches));
        assert_eq!(collect_names(&mut series_set).await, ["a", "b", "c", "d", "e", "f"]);
        assert!(series_set.err().is_none());
    }

    #[tokio::test]
    async fn skips_empty_batches() {
        let pools = Arc::new(ChunkSetPools::new());
        let batches: Vec<Result<ChunkSet>> = vec![
            Ok(ChunkSet::new(0, Some(Arc::clone(&pools)))),
            Ok(set_with_series(&pools, &["a"])),
            Ok(ChunkSet::new(0, Some(Arc::clone(&pools)))),
            Ok(set_with_series(&pools, &["b"])),
        ];

        let mut series_set = ChunkedSeriesSet::new(StaticSetIterator::new(batches));
        assert_eq!(collect_names(&mut series_set).await, ["a", "b"]);
    }

    #[tokio::test]
    async fn releases_each_batch_when_moving_off_it() {
        let pools = Arc::new(ChunkSetPools::new());
        let batches: Vec<Result<ChunkSet>> = vec![
            Ok(set_with_series(&pools, &["a", "b"])),
            Ok(set_with_series(&pools, &["c"])),
        ];

        let mut series_set = ChunkedSeriesSet::new(StaticSetIterator::new(batches));

        assert!(series_set.next().await); // a
        assert!(series_set.next().await); // b
        assert_eq!(pools.series_entries().puts(), 0);

        // Moving to the second batch releases the first.
        assert!(series_set.next().await); // c
        assert_eq!(pools.series_entries().puts(), 1);

        assert!(!series_set.next().await);
        assert_eq!(pools.series_entries().puts(), 2);
    }

    #[tokio::test]
    async fn surfaces_upstream_error_and_stays_exhausted() {
        let pools = Arc::new(ChunkSetPools::new());
        let batches: Vec<Result<ChunkSet>> = vec![
            Ok(set_with_series(&pools, &["a"])),
            Err(Error::Cancelled),
        ];

        let mut series_set = ChunkedSeriesSet::new(StaticSetIterator::new(batches));

        assert!(series_set.next().await);
        assert!(!series_set.next().await);
        assert_matches!(series_set.err(), Some(Error::Cancelled));

        // Exhaustion is idempotent and the error stays stable.
        assert!(!series_set.next().await);
        assert_matches!(series_set.err(), Some(Error::Cancelled));
        assert!(series_set.at().is_none());
    }
}
