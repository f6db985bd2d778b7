use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum SeqrepError {
    #[error("invalid assembly accession: {0}")]
    InvalidAssemblyAccession(String),

    #[error("malformed sequence report at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("fetch of {accession} failed: {message}")]
    Fetch { accession: String, message: String },

    #[error("fetch of {accession} returned status {status}: {message}")]
    FetchStatus {
        accession: String,
        status: u16,
        message: String,
    },

    #[error("artifact write failed: {0}")]
    Write(String),

    #[error("resequencing protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("ENA request failed: {0}")]
    Http(String),

    #[error("ENA returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("failed to start thread: {0}")]
    Thread(String),

    #[error("artifact is locked by another run: {0}")]
    #[diagnostic(help("remove the lock file if no other seqrep-dl process is running"))]
    ArtifactLocked(PathBuf),
}

/// Coarse classification used when reporting why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Fetch,
    Write,
    ProtocolViolation,
    Other,
}

impl SeqrepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SeqrepError::Parse { .. } => ErrorKind::Parse,
            SeqrepError::Fetch { .. } | SeqrepError::FetchStatus { .. } => ErrorKind::Fetch,
            SeqrepError::Write(_) | SeqrepError::ArtifactLocked(_) => ErrorKind::Write,
            SeqrepError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            _ => ErrorKind::Other,
        }
    }

    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        SeqrepError::Parse {
            line,
            message: message.into(),
        }
    }
}
