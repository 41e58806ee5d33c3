//! Generic set-iterator stages.
//!
//! Every pipeline stage implements [`SetIterator`]: one advance yields one
//! whole batch, moved to the caller by value. Moving batches (instead of
//! lending them) makes ownership linear through the pipeline, so the point
//! at which a batch is released is unambiguous and a double release cannot
//! be expressed.
//!
//! The stages here are written once, generic over the set type, and composed
//! over both reference sets and chunk sets.

use std::time::Instant;

use async_trait::async_trait;
use prometheus::Histogram;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// An iterator yielding a batch per advance.
///
/// `next_set` returns `None` on exhaustion and `Some(Err(_))` on failure.
/// Iterators are fused: after either outcome every further call returns
/// `None`, and an error is yielded exactly once on the batch where it
/// occurred. Downstream stages forward errors verbatim and never invent
/// their own.
#[async_trait]
pub trait SetIterator: Send {
    /// The batch type this iterator yields.
    type Set: Send + 'static;

    /// Advance to the next batch, transferring its ownership to the caller.
    async fn next_set(&mut self) -> Option<Result<Self::Set>>;
}

/// Wraps a stage and records the wall time of each advance into a duration
/// histogram labeled by stage.
pub struct MeasuredSetIterator<I> {
    from: I,
    durations: Histogram,
}

impl<I> std::fmt::Debug for MeasuredSetIterator<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasuredSetIterator").finish_non_exhaustive()
    }
}

impl<I: SetIterator> MeasuredSetIterator<I> {
    /// Wrap `from`, observing into `durations`.
    pub fn new(from: I, durations: Histogram) -> Self {
        Self { from, durations }
    }
}

#[async_trait]
impl<I: SetIterator> SetIterator for MeasuredSetIterator<I> {
    type Set = I::Set;

    async fn next_set(&mut self) -> Option<Result<Self::Set>> {
        let start = Instant::now();
        let next = self.from.next_set().await;
        self.durations.observe(start.elapsed().as_secs_f64());
        next
    }
}

/// Runs its upstream in a background task so a consumer calling `next_set`
/// typically finds a ready batch.
///
/// The producer pulls from upstream as fast as a bounded channel allows;
/// `preload_count` bounds how many batches are materialized ahead of the
/// consumer. Batches arrive in exact upstream order.
///
/// The producer terminates when the upstream is exhausted, when the
/// cancellation token fires (no further sends after cancellation is
/// observed), or when the consumer is dropped.
#[derive(Debug)]
pub struct PreloadingSetIterator<Set> {
    rx: mpsc::Receiver<Result<Set>>,
    token: CancellationToken,
    done: bool,
}

impl<Set: Send + 'static> PreloadingSetIterator<Set> {
    /// Start preloading from `from`, keeping at most `preload_count` batches
    /// ahead of the consumer.
    pub fn new<I>(token: CancellationToken, preload_count: usize, from: I) -> Self
    where
        I: SetIterator<Set = Set> + 'static,
    {
        assert!(preload_count >= 1, "preload count must be at least one");

        // One batch is held by the consumer outside the channel, hence the
        // minus one.
        let (tx, rx) = mpsc::channel(preload_count.saturating_sub(1).max(1));
        tokio::spawn(Self::produce(token.clone(), from, tx));

        Self {
            rx,
            token,
            done: false,
        }
    }

    async fn produce<I>(token: CancellationToken, mut from: I, tx: mpsc::Sender<Result<Set>>)
    where
        I: SetIterator<Set = Set>,
    {
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                item = from.next_set() => match item {
                    Some(item) => item,
                    None => return,
                },
            };

            let is_err = item.is_err();
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                sent = tx.send(item) => {
                    if sent.is_err() || is_err {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<Set: Send + 'static> SetIterator for PreloadingSetIterator<Set> {
    type Set = Set;

    async fn next_set(&mut self) -> Option<Result<Set>> {
        if self.done {
            return None;
        }

        match self.rx.recv().await {
            Some(item) => {
                if item.is_err() {
                    self.done = true;
                }
                Some(item)
            }
            None => {
                self.done = true;
                if self.token.is_cancelled() {
                    // The producer stopped because of cancellation; surface
                    // the cause once.
                    Some(Err(Error::Cancelled))
                } else {
                    None
                }
            }
        }
    }
}
