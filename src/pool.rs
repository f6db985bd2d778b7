//! Bounded pool of blocking fetch workers.
//!
//! Workers complete in any order. Dispatch is gated by credits: one credit is
//! spent per dispatched item and handed back when the resequencer releases an
//! item, so at most `width` items are in flight or waiting to be released.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::domain::{FetchResult, WorkItem};
use crate::ena::Fetcher;
use crate::error::SeqrepError;
use crate::pipeline::CancelToken;

const CREDIT_POLL: Duration = Duration::from_millis(50);

/// Hands dispatch credits back to the pool.
#[derive(Debug, Clone)]
pub struct CreditReturn {
    tx: SyncSender<()>,
}

impl CreditReturn {
    pub fn release(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Disconnected(())) => {}
            Err(TrySendError::Full(())) => {
                tracing::warn!("credit returned to a full pool, ignoring");
            }
        }
    }
}

/// Creates the credit channel pre-filled with `width` credits.
pub fn credit_channel(width: usize) -> (CreditReturn, Receiver<()>) {
    let (tx, rx) = mpsc::sync_channel(width);
    for _ in 0..width {
        let _ = tx.try_send(());
    }
    (CreditReturn { tx }, rx)
}

/// Thread whose completion can be awaited with a deadline.
///
/// The closure owns the sender of `done`; the receiver disconnects once the
/// closure has returned or unwound.
#[derive(Debug)]
pub struct TrackedThread<T> {
    handle: JoinHandle<T>,
    done: Receiver<()>,
}

impl<T: Send + 'static> TrackedThread<T> {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Result<Self, SeqrepError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _done = done_tx;
                f()
            })
            .map_err(|err| SeqrepError::Thread(err.to_string()))?;
        Ok(Self { handle, done })
    }
}

impl<T> TrackedThread<T> {
    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }

    /// Joins the thread unless it is still running at `deadline`, in which
    /// case it is detached. A panicked thread counts as finished.
    pub fn join_before(self, deadline: Instant) -> Option<T> {
        let wait = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => None,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self.handle.join().ok(),
        }
    }
}

pub struct FetchPool<F: Fetcher + ?Sized> {
    fetcher: Arc<F>,
    width: usize,
}

pub struct PoolHandle {
    pub dispatcher: TrackedThread<usize>,
    pub workers: Vec<TrackedThread<usize>>,
}

impl PoolHandle {
    pub fn into_handles(self) -> (TrackedThread<usize>, Vec<TrackedThread<usize>>) {
        (self.dispatcher, self.workers)
    }
}

impl<F: Fetcher + ?Sized + 'static> FetchPool<F> {
    pub fn new(fetcher: Arc<F>, width: usize) -> Self {
        Self {
            fetcher,
            width: width.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Starts the dispatcher and `width` workers. Each dispatched item yields
    /// exactly one [`FetchResult`] on `results` unless the run is stopped.
    pub fn spawn(
        &self,
        items: Vec<WorkItem>,
        results: SyncSender<FetchResult>,
        credits: Receiver<()>,
        stop: CancelToken,
    ) -> Result<PoolHandle, SeqrepError> {
        let (work_tx, work_rx) = mpsc::sync_channel::<WorkItem>(self.width);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut workers = Vec::with_capacity(self.width);
        for id in 0..self.width {
            let fetcher = Arc::clone(&self.fetcher);
            let work_rx = Arc::clone(&work_rx);
            let results = results.clone();
            let stop = stop.clone();
            let handle = TrackedThread::spawn(format!("fetch-{id}"), move || {
                worker_loop(id, &*fetcher, &work_rx, &results, &stop)
            })?;
            workers.push(handle);
        }
        drop(results);

        let dispatcher =
            TrackedThread::spawn("dispatch", move || dispatch_loop(items, &work_tx, &credits, &stop))?;

        Ok(PoolHandle {
            dispatcher,
            workers,
        })
    }
}

fn dispatch_loop(
    items: Vec<WorkItem>,
    work_tx: &SyncSender<WorkItem>,
    credits: &Receiver<()>,
    stop: &CancelToken,
) -> usize {
    let mut dispatched = 0usize;
    for item in items {
        loop {
            if stop.is_cancelled() {
                tracing::debug!(dispatched, "dispatch stopped");
                return dispatched;
            }
            match credits.recv_timeout(CREDIT_POLL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return dispatched,
            }
        }
        if work_tx.send(item).is_err() {
            return dispatched;
        }
        dispatched += 1;
    }
    dispatched
}

fn worker_loop<F: Fetcher + ?Sized>(
    id: usize,
    fetcher: &F,
    work_rx: &Mutex<Receiver<WorkItem>>,
    results: &SyncSender<FetchResult>,
    stop: &CancelToken,
) -> usize {
    let mut completed = 0usize;
    loop {
        let next = match work_rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(item) = next else {
            break;
        };
        if stop.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let outcome = fetcher.fetch(&item.accession);
        match &outcome {
            Ok(payload) => tracing::debug!(
                worker = id,
                index = item.index,
                accession = %item.accession,
                bytes = payload.len(),
                latency_ms = started.elapsed().as_millis() as u64,
                "fetched"
            ),
            Err(err) => tracing::warn!(
                worker = id,
                index = item.index,
                accession = %item.accession,
                error = %err,
                "fetch failed"
            ),
        }

        let result = FetchResult {
            index: item.index,
            accession: item.accession,
            outcome,
        };
        if results.send(result).is_err() {
            break;
        }
        completed += 1;
    }
    completed
}
