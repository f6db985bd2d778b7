use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SeqrepError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct AssemblyAccession(String);

impl AssemblyAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Nine digit body of the accession, e.g. `000001405` for `GCA_000001405.10`.
    pub fn digits(&self) -> &str {
        let body = &self.0[4..];
        body.split('.').next().unwrap_or(body)
    }

    /// `GCA_000` and `GCA_000001` style directory names of the ENA assembly layout.
    pub fn directory_prefixes(&self) -> (String, String) {
        let prefix = &self.0[..4];
        let digits = self.digits();
        (
            format!("{prefix}{}", &digits[..3]),
            format!("{prefix}{}", &digits[..6]),
        )
    }
}

impl fmt::Display for AssemblyAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AssemblyAccession {
    type Err = SeqrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_prefixed = normalized.starts_with("GCA_") || normalized.starts_with("GCF_");
        let mut parts = normalized.get(4..).unwrap_or_default().split('.');
        let digits = parts.next().unwrap_or_default();
        let version = parts.next();
        let digits_ok = digits.len() == 9 && digits.chars().all(|ch| ch.is_ascii_digit());
        let version_ok = version
            .map(|v| !v.is_empty() && v.chars().all(|ch| ch.is_ascii_digit()))
            .unwrap_or(true);
        if !is_prefixed || !digits_ok || !version_ok || parts.next().is_some() {
            return Err(SeqrepError::InvalidAssemblyAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for AssemblyAccession {
    type Error = SeqrepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One sequence to fetch, positioned by its order in the sequence report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub index: usize,
    pub accession: String,
}

/// Outcome of one fetch. A failed fetch is carried as a value so it keeps its
/// slot in the ordered stream.
#[derive(Debug)]
pub struct FetchResult {
    pub index: usize,
    pub accession: String,
    pub outcome: Result<Vec<u8>, SeqrepError>,
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Stop the run on the first failed item.
    #[default]
    Abort,
    /// Write nothing for a failed item and carry on.
    Skip,
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Abort => write!(f, "abort"),
            ErrorPolicy::Skip => write!(f, "skip"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_assembly_accession_valid() {
        let acc: AssemblyAccession = " GCA_000001405.10 ".parse().unwrap();
        assert_eq!(acc.as_str(), "GCA_000001405.10");
        assert_eq!(acc.digits(), "000001405");
    }

    #[test]
    fn parse_assembly_accession_without_version() {
        let acc: AssemblyAccession = "GCF_000005845".parse().unwrap();
        assert_eq!(acc.digits(), "000005845");
    }

    #[test]
    fn parse_assembly_accession_invalid() {
        for value in ["ABC_000001405.1", "GCA_12345.1", "GCA_000001405.", "GCA_000001405.1.2"] {
            let err = value.parse::<AssemblyAccession>().unwrap_err();
            assert_matches!(err, SeqrepError::InvalidAssemblyAccession(_));
        }
    }

    #[test]
    fn deserialize_validates_accession() {
        let acc: AssemblyAccession = serde_json::from_str("\"GCA_000001405.10\"").unwrap();
        assert_eq!(acc.directory_prefixes().0, "GCA_000");
        assert!(serde_json::from_str::<AssemblyAccession>("\"GC\"").is_err());
        assert!(serde_json::from_str::<AssemblyAccession>("\"GCA_1\"").is_err());
    }

    #[test]
    fn directory_prefixes_follow_ena_layout() {
        let acc: AssemblyAccession = "GCA_000001405.10".parse().unwrap();
        let (outer, inner) = acc.directory_prefixes();
        assert_eq!(outer, "GCA_000");
        assert_eq!(inner, "GCA_000001");
    }
}
