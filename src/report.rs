//! Sequence report parsing and work item extraction.
//!
//! A sequence report is a tab separated table with one row per sequence of an
//! assembly. Only rows accepted by a caller supplied predicate become
//! [`WorkItem`]s, numbered in report order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::WorkItem;
use crate::error::SeqrepError;

const ACCESSION_COLUMN: &str = "accession";
const ROLE_COLUMN: &str = "sequence-role";
const REPLICON_TYPE_COLUMN: &str = "replicon-type";
const NAME_COLUMN: &str = "sequence-name";

// Any single token identifier, not only INSDC-shaped accessions.
static SEQUENCE_ACCESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub accession: String,
    pub name: Option<String>,
    pub role: String,
    pub replicon_type: String,
}

/// Source of report rows, in report order.
pub trait ReportSource {
    fn list_entries(&self) -> Result<Vec<ReportEntry>, SeqrepError>;
}

/// A sequence report already read into memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceReport {
    entries: Vec<ReportEntry>,
}

impl SequenceReport {
    pub fn parse(document: &str) -> Result<Self, SeqrepError> {
        let mut lines = document
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim_end_matches('\r')))
            .filter(|(_, line)| !line.trim().is_empty());

        let (header_line, header) = lines
            .next()
            .ok_or_else(|| SeqrepError::parse(1, "missing header row"))?;
        let columns = header
            .trim_start_matches('#')
            .split('\t')
            .map(|cell| cell.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();
        let find = |name: &str| {
            columns
                .iter()
                .position(|column| column == name)
                .ok_or_else(|| SeqrepError::parse(header_line, format!("missing column {name}")))
        };
        let accession_col = find(ACCESSION_COLUMN)?;
        let role_col = find(ROLE_COLUMN)?;
        let type_col = find(REPLICON_TYPE_COLUMN)?;
        let name_col = columns.iter().position(|column| column == NAME_COLUMN);

        let mut entries = Vec::new();
        for (line_no, line) in lines {
            let cells = line.split('\t').map(str::trim).collect::<Vec<_>>();
            if cells.len() < columns.len() {
                return Err(SeqrepError::parse(
                    line_no,
                    format!("expected {} cells, found {}", columns.len(), cells.len()),
                ));
            }
            let accession = cells[accession_col];
            if accession.is_empty() {
                return Err(SeqrepError::parse(line_no, "empty sequence accession"));
            }
            if !SEQUENCE_ACCESSION.is_match(accession) {
                return Err(SeqrepError::parse(
                    line_no,
                    format!("invalid sequence accession {accession:?}"),
                ));
            }
            entries.push(ReportEntry {
                accession: accession.to_string(),
                name: name_col
                    .map(|col| cells[col])
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
                role: cells[role_col].to_string(),
                replicon_type: cells[type_col].to_string(),
            });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Lazily yields the entries accepted by `predicate` as numbered work items.
    /// The iterator is cheap to clone, so the sequence can be replayed.
    pub fn work_items<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = WorkItem> + Clone + 'a
    where
        P: Fn(&ReportEntry) -> bool + Clone + 'a,
    {
        extract_work_items(&self.entries, predicate)
    }
}

impl ReportSource for SequenceReport {
    fn list_entries(&self) -> Result<Vec<ReportEntry>, SeqrepError> {
        Ok(self.entries.clone())
    }
}

pub fn extract_work_items<'a, P>(
    entries: &'a [ReportEntry],
    predicate: P,
) -> impl Iterator<Item = WorkItem> + Clone + 'a
where
    P: Fn(&ReportEntry) -> bool + Clone + 'a,
{
    entries
        .iter()
        .filter(move |entry| predicate(*entry))
        .enumerate()
        .map(|(index, entry)| WorkItem {
            index,
            accession: entry.accession.clone(),
        })
}

/// Report file previously downloaded into the local store.
#[derive(Debug, Clone)]
pub struct FileReportSource {
    path: PathBuf,
}

impl FileReportSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ReportSource for FileReportSource {
    fn list_entries(&self) -> Result<Vec<ReportEntry>, SeqrepError> {
        let content = fs::read_to_string(&self.path).map_err(|err| {
            SeqrepError::Filesystem(format!("read report {}: {err}", self.path.display()))
        })?;
        Ok(SequenceReport::parse(&content)?.entries)
    }
}

/// Decides which report rows denote chromosome level sequences.
/// Empty lists accept any value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
    #[serde(default = "default_replicon_types")]
    pub replicon_types: Vec<String>,
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self {
            roles: default_roles(),
            replicon_types: default_replicon_types(),
        }
    }
}

impl EntryFilter {
    pub fn matches(&self, entry: &ReportEntry) -> bool {
        matches_any(&self.roles, &entry.role)
            && matches_any(&self.replicon_types, &entry.replicon_type)
    }
}

fn matches_any(allowed: &[String], value: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|item| item.eq_ignore_ascii_case(value))
}

fn default_roles() -> Vec<String> {
    vec!["assembled-molecule".to_string()]
}

fn default_replicon_types() -> Vec<String> {
    vec!["Chromosome".to_string()]
}
