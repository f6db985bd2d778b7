use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::AssemblyAccession;
use crate::error::SeqrepError;

/// Layout of the local assembly directory:
///
/// ```text
/// <root>/<accession>_sequence_report.txt
/// <root>/<accession>.fasta          final artifact
/// <root>/<accession>.fasta.part     artifact of a run in progress or aborted
/// <root>/metadata/<accession>.json
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
    report_suffix: String,
    fasta_extension: String,
}

/// Where a run for an assembly has to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    DownloadReport,
    FetchSequences,
    Done,
}

impl Store {
    pub fn new(
        root: Utf8PathBuf,
        report_suffix: impl Into<String>,
        fasta_extension: impl Into<String>,
    ) -> Self {
        Self {
            root,
            report_suffix: report_suffix.into(),
            fasta_extension: fasta_extension.into(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn report_path(&self, acc: &AssemblyAccession) -> Utf8PathBuf {
        self.root
            .join(format!("{}{}", acc.as_str(), self.report_suffix))
    }

    pub fn artifact_path(&self, acc: &AssemblyAccession) -> Utf8PathBuf {
        self.root
            .join(format!("{}.{}", acc.as_str(), self.fasta_extension))
    }

    pub fn partial_artifact_path(&self, acc: &AssemblyAccession) -> Utf8PathBuf {
        self.root
            .join(format!("{}.{}.part", acc.as_str(), self.fasta_extension))
    }

    pub fn metadata_path(&self, acc: &AssemblyAccession) -> Utf8PathBuf {
        self.root
            .join("metadata")
            .join(format!("{}.json", acc.as_str()))
    }

    pub fn ensure_root(&self) -> Result<(), SeqrepError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))
    }

    pub fn stage(&self, acc: &AssemblyAccession) -> Stage {
        if !self.report_path(acc).as_std_path().exists() {
            Stage::DownloadReport
        } else if !self.artifact_path(acc).as_std_path().exists() {
            Stage::FetchSequences
        } else {
            Stage::Done
        }
    }

    /// Removes what a previous run left behind so a new run starts from `stage`.
    pub fn reset_from(&self, acc: &AssemblyAccession, stage: Stage) -> Result<(), SeqrepError> {
        let mut stale = vec![self.partial_artifact_path(acc)];
        match stage {
            Stage::DownloadReport => {
                stale.push(self.report_path(acc));
                stale.push(self.artifact_path(acc));
            }
            Stage::FetchSequences => stale.push(self.artifact_path(acc)),
            Stage::Done => {}
        }
        for path in stale {
            if path.as_std_path().exists() {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| SeqrepError::Filesystem(format!("remove {path}: {err}")))?;
            }
        }
        Ok(())
    }

    /// Moves a finished partial artifact to its final name.
    pub fn promote_artifact(&self, acc: &AssemblyAccession) -> Result<Utf8PathBuf, SeqrepError> {
        let partial = self.partial_artifact_path(acc);
        let target = self.artifact_path(acc);
        fs::rename(partial.as_std_path(), target.as_std_path())
            .map_err(|err| SeqrepError::Filesystem(format!("rename {partial}: {err}")))?;
        Ok(target)
    }

    pub fn write_metadata(path: &Utf8Path, metadata: &RunMetadata) -> Result<(), SeqrepError> {
        let content = serde_json::to_vec_pretty(metadata)
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn read_metadata(path: &Utf8Path) -> Result<RunMetadata, SeqrepError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        serde_json::from_str(&content).map_err(|err| SeqrepError::Filesystem(err.to_string()))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SeqrepError> {
        let parent = path
            .parent()
            .ok_or_else(|| SeqrepError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix("seqrep-dl-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub assembly: String,
    pub report_url: Option<String>,
    pub artifact_path: String,
    pub total_items: usize,
    pub written_items: usize,
    pub skipped_accessions: Vec<String>,
    pub bytes_written: u64,
    pub finished_at: String,
    pub tool: String,
}
