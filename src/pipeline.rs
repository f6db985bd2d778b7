//! Coordinator wiring the fetch pool, resequencer and sink writer into one run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::domain::{ErrorPolicy, FetchResult, WorkItem};
use crate::ena::Fetcher;
use crate::error::SeqrepError;
use crate::pool::{FetchPool, TrackedThread, credit_channel};
use crate::resequencer::{self, ResequencerStats};
use crate::sink::{ArtifactSink, SinkOutcome, SinkSummary, SinkWriter};

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_QUEUE_CAPACITY: usize = 15;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Run level cancellation flag, shared by clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Number of concurrent fetch workers.
    pub concurrency: usize,
    /// Capacity of the ordered queue between resequencer and writer.
    pub queue_capacity: usize,
    pub error_policy: ErrorPolicy,
    /// How long shutdown waits for in-flight fetches before detaching them.
    pub grace_period: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            error_policy: ErrorPolicy::Abort,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), SeqrepError> {
        if self.concurrency == 0 {
            return Err(SeqrepError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(SeqrepError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum RunStatus {
    Completed,
    CompletedWithSkippedItems(usize),
    Aborted(SeqrepError),
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, RunStatus::Aborted(_))
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub status: RunStatus,
    pub total: usize,
    pub written: usize,
    pub skipped: Vec<String>,
    pub bytes_written: u64,
    /// Largest number of results the resequencer held back at once.
    pub max_pending: usize,
}

pub struct Pipeline<F: Fetcher + ?Sized> {
    fetcher: Arc<F>,
    settings: PipelineSettings,
}

impl<F: Fetcher + ?Sized + 'static> Pipeline<F> {
    pub fn new(fetcher: Arc<F>, settings: PipelineSettings) -> Self {
        Self { fetcher, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Fetches every item and appends the payloads to `sink` in index order.
    pub fn run<S, I>(&self, items: I, sink: &mut S, cancel: &CancelToken) -> PipelineReport
    where
        S: ArtifactSink + ?Sized,
        I: IntoIterator<Item = WorkItem>,
    {
        let items = items.into_iter().collect::<Vec<_>>();
        let total = items.len();
        let aborted = |err: SeqrepError| PipelineReport {
            status: RunStatus::Aborted(err),
            total,
            written: 0,
            skipped: Vec::new(),
            bytes_written: 0,
            max_pending: 0,
        };

        if let Err(err) = self.settings.validate() {
            return aborted(err);
        }
        if let Some((position, item)) = items
            .iter()
            .enumerate()
            .find(|(position, item)| item.index != *position)
        {
            return aborted(SeqrepError::ProtocolViolation(format!(
                "work item {} has index {}",
                position, item.index
            )));
        }

        let writer = SinkWriter::new(sink, self.settings.error_policy);
        if total == 0 {
            return report(writer.close(), total, ResequencerStats::default());
        }

        let width = self.settings.concurrency.min(total);
        tracing::info!(total, width, policy = %self.settings.error_policy, "starting fetch pipeline");
        let started = Instant::now();

        let stop = CancelToken::new();
        let (result_tx, result_rx) = mpsc::sync_channel::<FetchResult>(width);
        let (ordered_tx, ordered_rx) = mpsc::sync_channel::<FetchResult>(self.settings.queue_capacity);
        let (credit, credits) = credit_channel(width);

        let pool = FetchPool::new(Arc::clone(&self.fetcher), width);
        let pool = match pool.spawn(items, result_tx, credits, stop.clone()) {
            Ok(pool) => pool,
            Err(err) => return aborted(err),
        };
        let reseq = match TrackedThread::spawn("resequencer", move || {
            resequencer::run_stage(total, result_rx, ordered_tx, || credit.release())
        }) {
            Ok(handle) => handle,
            Err(err) => {
                stop.cancel();
                return aborted(err);
            }
        };

        let summary = writer.drain(ordered_rx, total, cancel);
        if !matches!(summary.outcome, SinkOutcome::Finished) {
            stop.cancel();
        }

        let deadline = Instant::now() + self.settings.grace_period;
        let reseq_result = reseq.join_before(deadline);
        let (dispatcher, workers) = pool.into_handles();
        let mut abandoned = 0usize;
        if dispatcher.join_before(deadline).is_none() {
            abandoned += 1;
        }
        for worker in workers {
            if worker.join_before(deadline).is_none() {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            tracing::warn!(abandoned, "detached threads still running after grace period");
        }

        let (stats, reseq_error) = match reseq_result {
            Some(Ok(stats)) => (stats, None),
            Some(Err(err)) => (ResequencerStats::default(), Some(err)),
            None => (ResequencerStats::default(), None),
        };

        let summary = match summary.outcome {
            SinkOutcome::StreamEnded => {
                let err = reseq_error.unwrap_or_else(|| {
                    if cancel.is_cancelled() {
                        SeqrepError::Cancelled
                    } else {
                        SeqrepError::ProtocolViolation(format!(
                            "ordered stream closed after {} of {total} items",
                            summary.written + summary.skipped.len()
                        ))
                    }
                });
                SinkSummary {
                    outcome: SinkOutcome::Aborted(err),
                    ..summary
                }
            }
            _ => summary,
        };

        let report = report(summary, total, stats);
        tracing::info!(
            written = report.written,
            skipped = report.skipped.len(),
            bytes = report.bytes_written,
            max_pending = report.max_pending,
            elapsed_ms = started.elapsed().as_millis() as u64,
            success = report.status.is_success(),
            "fetch pipeline finished"
        );
        report
    }
}

fn report(summary: SinkSummary, total: usize, stats: ResequencerStats) -> PipelineReport {
    let status = match summary.outcome {
        SinkOutcome::Finished if summary.skipped.is_empty() => RunStatus::Completed,
        SinkOutcome::Finished => RunStatus::CompletedWithSkippedItems(summary.skipped.len()),
        SinkOutcome::Aborted(err) => RunStatus::Aborted(err),
        SinkOutcome::Cancelled => RunStatus::Aborted(SeqrepError::Cancelled),
        SinkOutcome::StreamEnded => RunStatus::Aborted(SeqrepError::ProtocolViolation(
            "ordered stream closed early".to_string(),
        )),
    };
    PipelineReport {
        status,
        total,
        written: summary.written,
        skipped: summary.skipped,
        bytes_written: summary.bytes_written,
        max_pending: stats.max_pending,
    }
}
