//! Restores report order from fetch completions that arrive in any order.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, SyncSender};

use crate::domain::FetchResult;
use crate::error::SeqrepError;

/// Buffers out of order items and releases them as gap free runs.
///
/// `pending` never holds an index at or below `next_expected`; every index in
/// `0..total` is released exactly once.
#[derive(Debug)]
pub struct Resequencer<T> {
    next_expected: usize,
    total: usize,
    pending: BTreeMap<usize, T>,
    max_pending: usize,
}

impl<T> Resequencer<T> {
    pub fn new(total: usize) -> Self {
        Self {
            next_expected: 0,
            total,
            pending: BTreeMap::new(),
            max_pending: 0,
        }
    }

    /// Accepts one item and returns every item that became releasable, in order.
    pub fn accept(&mut self, index: usize, item: T) -> Result<Vec<T>, SeqrepError> {
        if index < self.next_expected {
            return Err(SeqrepError::ProtocolViolation(format!(
                "index {index} arrived after it was released"
            )));
        }
        if index >= self.total {
            return Err(SeqrepError::ProtocolViolation(format!(
                "index {index} is outside a sequence of {} items",
                self.total
            )));
        }
        if index > self.next_expected {
            if self.pending.insert(index, item).is_some() {
                return Err(SeqrepError::ProtocolViolation(format!(
                    "index {index} arrived twice"
                )));
            }
            self.max_pending = self.max_pending.max(self.pending.len());
            return Ok(Vec::new());
        }

        let mut released = vec![item];
        self.next_expected += 1;
        while let Some(next) = self.pending.remove(&self.next_expected) {
            released.push(next);
            self.next_expected += 1;
        }
        Ok(released)
    }

    pub fn next_expected(&self) -> usize {
        self.next_expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn is_complete(&self) -> bool {
        self.next_expected >= self.total
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResequencerStats {
    pub released: usize,
    pub max_pending: usize,
}

/// Stage loop: reads unordered results until `total` items were released,
/// the upstream closes, or the downstream hangs up. `on_release` runs once per
/// released item before it is forwarded.
pub fn run_stage<F>(
    total: usize,
    input: Receiver<FetchResult>,
    output: SyncSender<FetchResult>,
    mut on_release: F,
) -> Result<ResequencerStats, SeqrepError>
where
    F: FnMut(),
{
    let mut state = Resequencer::new(total);
    let mut released = 0usize;
    while !state.is_complete() {
        let Ok(result) = input.recv() else {
            tracing::debug!(released, total, "fetch results closed early");
            break;
        };
        let index = result.index;
        for item in state.accept(index, result)? {
            on_release();
            tracing::trace!(index = item.index, "released");
            released += 1;
            if output.send(item).is_err() {
                tracing::debug!(released, "ordered queue closed by writer");
                return Ok(ResequencerStats {
                    released,
                    max_pending: state.max_pending(),
                });
            }
        }
    }
    Ok(ResequencerStats {
        released,
        max_pending: state.max_pending(),
    })
}
