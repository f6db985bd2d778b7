use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use seqrep_fasta_dl::domain::{ErrorPolicy, WorkItem};
use seqrep_fasta_dl::ena::Fetcher;
use seqrep_fasta_dl::error::{ErrorKind, SeqrepError};
use seqrep_fasta_dl::pipeline::{CancelToken, Pipeline, PipelineSettings, RunStatus};
use seqrep_fasta_dl::sink::ArtifactSink;

/// Fetcher with per-accession delays and failures, recording call order.
#[derive(Default)]
struct ScriptedFetcher {
    delays: HashMap<String, Duration>,
    failures: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn with_delays(delays: &[(&str, u64)]) -> Self {
        Self {
            delays: delays
                .iter()
                .map(|(acc, ms)| (acc.to_string(), Duration::from_millis(*ms)))
                .collect(),
            ..Self::default()
        }
    }

    fn failing(mut self, accession: &str) -> Self {
        self.failures.push(accession.to_string());
        self
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, accession: &str) -> Result<Vec<u8>, SeqrepError> {
        self.calls.lock().unwrap().push(accession.to_string());
        if let Some(delay) = self.delays.get(accession) {
            thread::sleep(*delay);
        }
        if self.failures.iter().any(|acc| acc == accession) {
            return Err(SeqrepError::Fetch {
                accession: accession.to_string(),
                message: "connection reset".to_string(),
            });
        }
        Ok(payload(accession))
    }
}

/// Sink keeping every append separately so item boundaries can be checked.
#[derive(Default)]
struct RecordingSink {
    appends: Vec<Vec<u8>>,
    fail_on_append: Option<usize>,
    finished: bool,
}

impl ArtifactSink for RecordingSink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), SeqrepError> {
        if self.fail_on_append == Some(self.appends.len()) {
            return Err(SeqrepError::Write("disk full".to_string()));
        }
        self.appends.push(bytes.to_vec());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SeqrepError> {
        self.finished = true;
        Ok(())
    }
}

fn payload(accession: &str) -> Vec<u8> {
    format!(">{accession}\nACGT\n").into_bytes()
}

fn work_items(accessions: &[String]) -> Vec<WorkItem> {
    accessions
        .iter()
        .enumerate()
        .map(|(index, accession)| WorkItem {
            index,
            accession: accession.clone(),
        })
        .collect()
}

fn accessions(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("CM{:06}.1", 663 + i)).collect()
}

fn settings(concurrency: usize, error_policy: ErrorPolicy) -> PipelineSettings {
    PipelineSettings {
        concurrency,
        error_policy,
        grace_period: Duration::from_secs(2),
        ..PipelineSettings::default()
    }
}

#[test]
fn reverse_completion_order_is_written_in_input_order() {
    let names = accessions(6);
    let delays = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), (6 - i as u64) * 40))
        .collect::<Vec<_>>();
    let fetcher = Arc::new(ScriptedFetcher::with_delays(&delays));
    let pipeline = Pipeline::new(fetcher, settings(6, ErrorPolicy::Abort));

    let mut sink = RecordingSink::default();
    let report = pipeline.run(work_items(&names), &mut sink, &CancelToken::new());

    assert_matches!(report.status, RunStatus::Completed);
    let expected = names.iter().map(|n| payload(n)).collect::<Vec<_>>();
    assert_eq!(sink.appends, expected);
    assert!(sink.finished);
    assert!(report.max_pending >= 1);
}

#[test]
fn every_item_is_written_exactly_once() {
    for n in [0usize, 1, 2, 7, 40] {
        let names = accessions(n);
        let pipeline = Pipeline::new(
            Arc::new(ScriptedFetcher::default()),
            settings(4, ErrorPolicy::Abort),
        );
        let mut sink = RecordingSink::default();
        let report = pipeline.run(work_items(&names), &mut sink, &CancelToken::new());

        assert_matches!(report.status, RunStatus::Completed);
        assert_eq!(report.total, n);
        assert_eq!(report.written, n);
        let expected = names.iter().map(|name| payload(name)).collect::<Vec<_>>();
        assert_eq!(sink.appends, expected);
    }
}

#[test]
fn pending_buffer_never_exceeds_pool_width() {
    let names = accessions(30);
    let fetcher = Arc::new(ScriptedFetcher::with_delays(&[(names[0].as_str(), 300)]));
    let pipeline = Pipeline::new(fetcher, settings(3, ErrorPolicy::Abort));

    let mut sink = RecordingSink::default();
    let report = pipeline.run(work_items(&names), &mut sink, &CancelToken::new());

    assert_matches!(report.status, RunStatus::Completed);
    assert!(report.max_pending <= 3, "max_pending = {}", report.max_pending);
    assert_eq!(sink.appends.len(), 30);
}

#[test]
fn skip_policy_leaves_failed_item_out() {
    let names = vec!["A1.1".to_string(), "B1.1".to_string(), "C1.1".to_string()];
    let fetcher = Arc::new(ScriptedFetcher::default().failing("B1.1"));
    let pipeline = Pipeline::new(fetcher, settings(3, ErrorPolicy::Skip));

    let mut sink = RecordingSink::default();
    let report = pipeline.run(work_items(&names), &mut sink, &CancelToken::new());

    assert_matches!(report.status, RunStatus::CompletedWithSkippedItems(1));
    assert_eq!(sink.appends, vec![payload("A1.1"), payload("C1.1")]);
    assert_eq!(report.skipped, vec!["B1.1".to_string()]);
}

#[test]
fn abort_policy_stops_before_later_items() {
    let names = vec!["A1.1".to_string(), "B1.1".to_string(), "C1.1".to_string()];
    let fetcher = Arc::new(ScriptedFetcher::default().failing("B1.1"));
    let pipeline = Pipeline::new(fetcher, settings(3, ErrorPolicy::Abort));

    let mut sink = RecordingSink::default();
    let report = pipeline.run(work_items(&names), &mut sink, &CancelToken::new());

    assert_matches!(report.status, RunStatus::Aborted(ref err) if err.kind() == ErrorKind::Fetch);
    assert!(sink.appends.len() <= 1);
    assert!(!sink.appends.contains(&payload("C1.1")));
    if let Some(first) = sink.appends.first() {
        assert_eq!(first, &payload("A1.1"));
    }
    assert!(!sink.finished);
}

#[test]
fn single_item_is_written() {
    let names = vec!["CM000663.2".to_string()];
    let pipeline = Pipeline::new(
        Arc::new(ScriptedFetcher::default()),
        settings(8, ErrorPolicy::Abort),
    );
    let mut sink = RecordingSink::default();
    let report = pipeline.run(work_items(&names), &mut sink, &CancelToken::new());

    assert_matches!(report.status, RunStatus::Completed);
    assert_eq!(sink.appends, vec![payload("CM000663.2")]);
}

#[test]
fn width_one_fetches_and_writes_sequentially() {
    let names = accessions(5);
    let delays = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), (5 - i as u64) * 10))
        .collect::<Vec<_>>();
    let fetcher = Arc::new(ScriptedFetcher::with_delays(&delays));
    let pipeline = Pipeline::new(Arc::clone(&fetcher), settings(1, ErrorPolicy::Abort));

    let mut sink = RecordingSink::default();
    let report = pipeline.run(work_items(&names), &mut sink, &CancelToken::new());

    assert_matches!(report.status, RunStatus::Completed);
    assert_eq!(*fetcher.calls.lock().unwrap(), names);
    assert_eq!(report.max_pending, 0);
    let expected = names.iter().map(|name| payload(name)).collect::<Vec<_>>();
    assert_eq!(sink.appends, expected);
}

#[test]
fn write_error_aborts_the_run() {
    let names = accessions(4);
    let pipeline = Pipeline::new(
        Arc::new(ScriptedFetcher::default()),
        settings(2, ErrorPolicy::Skip),
    );
    let mut sink = RecordingSink {
        fail_on_append: Some(1),
        ..RecordingSink::default()
    };
    let report = pipeline.run(work_items(&names), &mut sink, &CancelToken::new());

    assert_matches!(report.status, RunStatus::Aborted(SeqrepError::Write(_)));
    assert_eq!(sink.appends, vec![payload(&names[0])]);
}

#[test]
fn cancellation_aborts_within_grace_period() {
    let names = accessions(10);
    let delays = names
        .iter()
        .map(|name| (name.as_str(), 400))
        .collect::<Vec<_>>();
    let fetcher = Arc::new(ScriptedFetcher::with_delays(&delays));
    let pipeline = Pipeline::new(
        fetcher,
        PipelineSettings {
            concurrency: 2,
            grace_period: Duration::from_millis(100),
            ..PipelineSettings::default()
        },
    );

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.cancel();
    });

    let started = Instant::now();
    let mut sink = RecordingSink::default();
    let report = pipeline.run(work_items(&names), &mut sink, &cancel);
    canceller.join().unwrap();

    assert_matches!(report.status, RunStatus::Aborted(SeqrepError::Cancelled));
    assert!(sink.appends.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
}
