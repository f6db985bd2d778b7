use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::domain::{ErrorPolicy, FetchResult};
use crate::error::SeqrepError;
use crate::pipeline::CancelToken;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Append-only destination for ordered payloads.
pub trait ArtifactSink {
    /// Appends one payload. A successful return means the bytes are durable.
    fn append(&mut self, bytes: &[u8]) -> Result<(), SeqrepError>;

    fn finish(&mut self) -> Result<(), SeqrepError> {
        Ok(())
    }
}

impl ArtifactSink for Vec<u8> {
    fn append(&mut self, bytes: &[u8]) -> Result<(), SeqrepError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Exclusive claim on an artifact, held as a `<path>.lock` file created with
/// create-new semantics. The file is removed on drop.
#[derive(Debug)]
pub struct ArtifactLock {
    lock_path: PathBuf,
}

impl ArtifactLock {
    pub fn acquire(artifact: impl AsRef<Path>) -> Result<Self, SeqrepError> {
        let artifact = artifact.as_ref();
        if let Some(parent) = artifact.parent() {
            fs::create_dir_all(parent).map_err(|err| SeqrepError::Write(err.to_string()))?;
        }
        let lock_path = lock_path_for(artifact);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => SeqrepError::ArtifactLocked(lock_path.clone()),
                _ => SeqrepError::Write(format!("lock {}: {err}", lock_path.display())),
            })?;
        Ok(Self { lock_path })
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Append-only artifact file. Either owns its lock or is opened under a lock
/// the caller keeps for longer than the sink.
#[derive(Debug)]
pub struct FileArtifactSink {
    path: PathBuf,
    file: File,
    _lock: Option<ArtifactLock>,
}

impl FileArtifactSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SeqrepError> {
        let lock = ArtifactLock::acquire(path.as_ref())?;
        Self::open_file(path.as_ref(), Some(lock))
    }

    /// Opens `path` for a caller already holding its lock.
    pub fn open_under(path: impl AsRef<Path>, _lock: &ArtifactLock) -> Result<Self, SeqrepError> {
        Self::open_file(path.as_ref(), None)
    }

    fn open_file(path: &Path, lock: Option<ArtifactLock>) -> Result<Self, SeqrepError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| SeqrepError::Write(format!("open {}: {err}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArtifactSink for FileArtifactSink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), SeqrepError> {
        self.file
            .write_all(bytes)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync_data())
            .map_err(|err| SeqrepError::Write(format!("append {}: {err}", self.path.display())))
    }

    fn finish(&mut self) -> Result<(), SeqrepError> {
        self.file
            .sync_all()
            .map_err(|err| SeqrepError::Write(format!("sync {}: {err}", self.path.display())))
    }
}

pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[derive(Debug)]
pub enum SinkOutcome {
    /// Every item was released and the sink was finished.
    Finished,
    Aborted(SeqrepError),
    Cancelled,
    /// The ordered stream closed before all items arrived.
    StreamEnded,
}

#[derive(Debug)]
pub struct SinkSummary {
    pub outcome: SinkOutcome,
    pub written: usize,
    pub skipped: Vec<String>,
    pub bytes_written: u64,
}

/// Writes the ordered stream to an [`ArtifactSink`], one append per item.
pub struct SinkWriter<'a, S: ArtifactSink + ?Sized> {
    sink: &'a mut S,
    policy: ErrorPolicy,
    next_index: usize,
    written: usize,
    skipped: Vec<String>,
    bytes_written: u64,
}

impl<'a, S: ArtifactSink + ?Sized> SinkWriter<'a, S> {
    pub fn new(sink: &'a mut S, policy: ErrorPolicy) -> Self {
        Self {
            sink,
            policy,
            next_index: 0,
            written: 0,
            skipped: Vec::new(),
            bytes_written: 0,
        }
    }

    /// Handles the next item of the ordered stream.
    pub fn write(&mut self, result: FetchResult) -> Result<(), SeqrepError> {
        if result.index != self.next_index {
            return Err(SeqrepError::ProtocolViolation(format!(
                "writer expected index {} but received {}",
                self.next_index, result.index
            )));
        }
        self.next_index += 1;
        match result.outcome {
            Ok(payload) => {
                self.sink.append(&payload)?;
                self.written += 1;
                self.bytes_written += payload.len() as u64;
                tracing::debug!(index = result.index, accession = %result.accession, "appended");
                Ok(())
            }
            Err(err) => match self.policy {
                ErrorPolicy::Skip => {
                    tracing::warn!(
                        index = result.index,
                        accession = %result.accession,
                        error = %err,
                        "skipping failed item"
                    );
                    self.skipped.push(result.accession);
                    Ok(())
                }
                ErrorPolicy::Abort => Err(err),
            },
        }
    }

    /// Consumes `total` ordered items from `input`, polling `cancel` while idle.
    pub fn drain(
        mut self,
        input: Receiver<FetchResult>,
        total: usize,
        cancel: &CancelToken,
    ) -> SinkSummary {
        while self.next_index < total {
            if cancel.is_cancelled() {
                return self.summary(SinkOutcome::Cancelled);
            }
            let result = match input.recv_timeout(CANCEL_POLL) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return self.summary(SinkOutcome::StreamEnded);
                }
            };
            if let Err(err) = self.write(result) {
                return self.summary(SinkOutcome::Aborted(err));
            }
        }
        self.close()
    }

    /// Finishes the sink after the last item.
    pub fn close(mut self) -> SinkSummary {
        match self.sink.finish() {
            Ok(()) => self.summary(SinkOutcome::Finished),
            Err(err) => self.summary(SinkOutcome::Aborted(err)),
        }
    }

    fn summary(self, outcome: SinkOutcome) -> SinkSummary {
        SinkSummary {
            outcome,
            written: self.written,
            skipped: self.skipped,
            bytes_written: self.bytes_written,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn ok(index: usize, payload: &str) -> FetchResult {
        FetchResult {
            index,
            accession: format!("ACC{index}"),
            outcome: Ok(payload.as_bytes().to_vec()),
        }
    }

    fn failed(index: usize) -> FetchResult {
        FetchResult {
            index,
            accession: format!("ACC{index}"),
            outcome: Err(SeqrepError::Fetch {
                accession: format!("ACC{index}"),
                message: "timeout".to_string(),
            }),
        }
    }

    #[test]
    fn skip_policy_drops_failed_payload() {
        let mut out = Vec::new();
        let mut writer = SinkWriter::new(&mut out, ErrorPolicy::Skip);
        writer.write(ok(0, ">a\n")).unwrap();
        writer.write(failed(1)).unwrap();
        writer.write(ok(2, ">c\n")).unwrap();
        let summary = writer.close();
        assert_matches!(summary.outcome, SinkOutcome::Finished);
        assert_eq!(summary.skipped, vec!["ACC1".to_string()]);
        assert_eq!(summary.written, 2);
        assert_eq!(out, b">a\n>c\n");
    }

    #[test]
    fn abort_policy_surfaces_fetch_error() {
        let mut out = Vec::new();
        let mut writer = SinkWriter::new(&mut out, ErrorPolicy::Abort);
        writer.write(ok(0, ">a\n")).unwrap();
        assert_matches!(writer.write(failed(1)), Err(SeqrepError::Fetch { .. }));
    }

    #[test]
    fn out_of_order_item_is_rejected() {
        let mut out = Vec::new();
        let mut writer = SinkWriter::new(&mut out, ErrorPolicy::Abort);
        assert_matches!(
            writer.write(ok(1, ">b\n")),
            Err(SeqrepError::ProtocolViolation(_))
        );
        assert!(out.is_empty());
    }

    #[test]
    fn drain_reports_early_end_of_stream() {
        let (tx, rx) = std::sync::mpsc::sync_channel(2);
        tx.send(ok(0, ">a\n")).unwrap();
        drop(tx);
        let mut out = Vec::new();
        let summary = SinkWriter::new(&mut out, ErrorPolicy::Abort).drain(rx, 2, &CancelToken::new());
        assert_matches!(summary.outcome, SinkOutcome::StreamEnded);
        assert_eq!(summary.written, 1);
    }

    #[test]
    fn drain_observes_cancellation() {
        let (_tx, rx) = std::sync::mpsc::sync_channel::<FetchResult>(2);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        let summary = SinkWriter::new(&mut out, ErrorPolicy::Abort).drain(rx, 1, &cancel);
        assert_matches!(summary.outcome, SinkOutcome::Cancelled);
    }

    #[test]
    fn file_sink_appends_and_holds_lock() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("GCA_000001405.10.fasta.part");
        {
            let mut sink = FileArtifactSink::open(&path).unwrap();
            assert_matches!(
                FileArtifactSink::open(&path),
                Err(SeqrepError::ArtifactLocked(_))
            );
            sink.append(b">a\nAC\n").unwrap();
            sink.append(b">b\nGT\n").unwrap();
            sink.finish().unwrap();
        }
        assert!(!lock_path_for(&path).exists());
        assert_eq!(std::fs::read(&path).unwrap(), b">a\nAC\n>b\nGT\n");
    }

    #[test]
    fn lock_outlives_sink_opened_under_it() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("GCA_000001405.10.fasta.part");
        let lock = ArtifactLock::acquire(&path).unwrap();
        {
            let mut sink = FileArtifactSink::open_under(&path, &lock).unwrap();
            sink.append(b">a\n").unwrap();
        }
        assert!(lock.path().exists());
        assert_matches!(
            ArtifactLock::acquire(&path),
            Err(SeqrepError::ArtifactLocked(_))
        );
        drop(lock);
        assert!(!lock_path_for(&path).exists());
        assert!(ArtifactLock::acquire(&path).is_ok());
    }
}
