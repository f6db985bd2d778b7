use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;

use crate::domain::{AssemblyAccession, WorkItem};
use crate::ena::{Fetcher, ReportDownloader};
use crate::error::SeqrepError;
use crate::pipeline::{CancelToken, Pipeline, PipelineSettings, RunStatus};
use crate::report::{EntryFilter, FileReportSource, ReportSource, extract_work_items};
use crate::sink::{ArtifactLock, FileArtifactSink};
use crate::store::{RunMetadata, Stage, Store};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub assembly: String,
    pub stage: Stage,
    pub action: String,
    pub report_path: String,
    pub artifact_path: Option<String>,
    pub total_items: usize,
    pub written_items: usize,
    pub skipped_accessions: Vec<String>,
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C> {
    store: Store,
    client: Arc<C>,
    settings: PipelineSettings,
    filter: EntryFilter,
}

impl<C> App<C>
where
    C: Fetcher + ReportDownloader + 'static,
{
    pub fn new(store: Store, client: C, settings: PipelineSettings, filter: EntryFilter) -> Self {
        Self {
            store,
            client: Arc::new(client),
            settings,
            filter,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Runs every stage still missing for `accession`, resuming from the
    /// files already in the store.
    ///
    /// Everything that touches the store happens under the artifact lock, so
    /// a run that finds the lock held leaves the holder's files alone.
    pub fn run(
        &self,
        accession: &AssemblyAccession,
        options: RunOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, SeqrepError> {
        let stage = self.start_stage(accession, &options);
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {accession} starts at {stage:?}"),
            elapsed: None,
        });

        let report_path = self.store.report_path(accession);
        let artifact_path = self.store.artifact_path(accession);
        let mut result = RunResult {
            assembly: accession.to_string(),
            stage,
            action: String::new(),
            report_path: report_path.to_string(),
            artifact_path: None,
            total_items: 0,
            written_items: 0,
            skipped_accessions: Vec::new(),
            bytes_written: 0,
        };

        if stage == Stage::Done {
            return Ok(up_to_date(result, &artifact_path, sink));
        }

        if options.dry_run {
            result.action = "dry-run".to_string();
            if stage == Stage::FetchSequences {
                result.total_items = self.work_items(&report_path)?.len();
            }
            result.artifact_path = Some(artifact_path.to_string());
            return Ok(result);
        }

        self.store.ensure_root()?;
        let partial_path = self.store.partial_artifact_path(accession);
        let lock = ArtifactLock::acquire(partial_path.as_std_path())?;

        // another run may have finished between the first look and the lock
        let stage = self.start_stage(accession, &options);
        result.stage = stage;
        if stage == Stage::Done {
            return Ok(up_to_date(result, &artifact_path, sink));
        }

        self.store.reset_from(accession, stage)?;

        if stage == Stage::DownloadReport {
            self.download_report(accession, sink)?;
        }

        sink.event(ProgressEvent {
            message: "phase=Prepare; extracting chromosome accessions".to_string(),
            elapsed: None,
        });
        let items = self.work_items(&report_path)?;
        result.total_items = items.len();
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; {} sequences", items.len()),
            elapsed: None,
        });

        let started = Instant::now();
        let mut artifact = FileArtifactSink::open_under(partial_path.as_std_path(), &lock)?;
        let pipeline = Pipeline::new(Arc::clone(&self.client), self.settings.clone());
        let report = pipeline.run(items, &mut artifact, cancel);
        drop(artifact);
        sink.event(ProgressEvent {
            message: format!(
                "phase=Verify; wrote {} of {} sequences",
                report.written, report.total
            ),
            elapsed: Some(started.elapsed()),
        });

        match report.status {
            RunStatus::Aborted(err) => return Err(err),
            RunStatus::Completed => result.action = "completed".to_string(),
            RunStatus::CompletedWithSkippedItems(count) => {
                result.action = format!("completed-with-{count}-skipped");
            }
        }

        sink.event(ProgressEvent {
            message: "phase=Store; finalizing artifact".to_string(),
            elapsed: None,
        });
        let final_path = self.store.promote_artifact(accession)?;
        let metadata = RunMetadata {
            assembly: accession.to_string(),
            report_url: Some(self.client.report_url(accession)),
            artifact_path: final_path.to_string(),
            total_items: report.total,
            written_items: report.written,
            skipped_accessions: report.skipped.clone(),
            bytes_written: report.bytes_written,
            finished_at: iso_timestamp(),
            tool: format!("seqrep-dl/{}", env!("CARGO_PKG_VERSION")),
        };
        Store::write_metadata(&self.store.metadata_path(accession), &metadata)?;
        drop(lock);

        result.artifact_path = Some(final_path.to_string());
        result.written_items = report.written;
        result.skipped_accessions = report.skipped;
        result.bytes_written = report.bytes_written;
        Ok(result)
    }

    fn start_stage(&self, accession: &AssemblyAccession, options: &RunOptions) -> Stage {
        if options.force {
            Stage::DownloadReport
        } else {
            self.store.stage(accession)
        }
    }

    fn download_report(
        &self,
        accession: &AssemblyAccession,
        sink: &dyn ProgressSink,
    ) -> Result<(), SeqrepError> {
        sink.event(ProgressEvent {
            message: "ena.request".to_string(),
            elapsed: None,
        });
        let temp = tempfile::Builder::new()
            .prefix("seqrep-dl-report")
            .tempfile_in(self.store.root().as_std_path())
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        let start = Instant::now();
        self.client.download_report(accession, temp.path())?;
        let latency = start.elapsed().as_millis();
        sink.event(ProgressEvent {
            message: format!("ena.response latency_ms={latency}"),
            elapsed: None,
        });
        temp.persist(self.store.report_path(accession).as_std_path())
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn work_items(&self, report_path: &Utf8Path) -> Result<Vec<WorkItem>, SeqrepError> {
        let entries = FileReportSource::new(report_path.as_std_path()).list_entries()?;
        Ok(extract_work_items(&entries, |entry| self.filter.matches(entry)).collect())
    }
}

fn up_to_date(mut result: RunResult, artifact_path: &Utf8Path, sink: &dyn ProgressSink) -> RunResult {
    sink.event(ProgressEvent {
        message: "phase=Store; artifact already present".to_string(),
        elapsed: None,
    });
    result.action = "up-to-date".to_string();
    result.artifact_path = Some(artifact_path.to_string());
    result
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
