use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{AssemblyAccession, ErrorPolicy};
use crate::ena::{DEFAULT_FASTA_BASE_URL, DEFAULT_REPORT_ROOT_URL, DEFAULT_REPORT_SUFFIX, EnaEndpoints};
use crate::error::SeqrepError;
use crate::pipeline::{DEFAULT_CONCURRENCY, DEFAULT_QUEUE_CAPACITY, PipelineSettings};
use crate::report::EntryFilter;

pub const DEFAULT_CONFIG_FILE: &str = "seqrep-dl.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub assembly: Option<String>,
    #[serde(default)]
    pub local_root: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub error_policy: Option<ErrorPolicy>,
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
    #[serde(default)]
    pub report_suffix: Option<String>,
    #[serde(default)]
    pub report_root_url: Option<String>,
    #[serde(default)]
    pub fasta_base_url: Option<String>,
    #[serde(default)]
    pub fasta_extension: Option<String>,
    #[serde(default)]
    pub filter: Option<EntryFilter>,
}

/// Values given on the command line; they win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub assembly: Option<String>,
    pub local_root: Option<String>,
    pub concurrency: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub error_policy: Option<ErrorPolicy>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub assembly: Option<AssemblyAccession>,
    pub local_root: Utf8PathBuf,
    pub pipeline: PipelineSettings,
    pub endpoints: EnaEndpoints,
    pub fasta_extension: String,
    pub filter: EntryFilter,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, SeqrepError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| SeqrepError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| SeqrepError::ConfigParse(err.to_string()))?
        };

        Self::resolve_config(config, overrides)
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, SeqrepError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(SeqrepError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let assembly = overrides
            .assembly
            .or(config.assembly)
            .map(|value| value.parse::<AssemblyAccession>())
            .transpose()?;

        let local_root = match overrides.local_root.or(config.local_root) {
            Some(root) => Utf8PathBuf::from(root),
            None => default_local_root()?,
        };

        let pipeline = PipelineSettings {
            concurrency: overrides
                .concurrency
                .or(config.concurrency)
                .unwrap_or(DEFAULT_CONCURRENCY),
            queue_capacity: overrides
                .queue_capacity
                .or(config.queue_capacity)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            error_policy: overrides
                .error_policy
                .or(config.error_policy)
                .unwrap_or_default(),
            grace_period: config
                .grace_period_secs
                .map(Duration::from_secs)
                .unwrap_or(crate::pipeline::DEFAULT_GRACE_PERIOD),
        };
        pipeline.validate()?;

        let endpoints = EnaEndpoints {
            report_root_url: config
                .report_root_url
                .unwrap_or_else(|| DEFAULT_REPORT_ROOT_URL.to_string()),
            report_suffix: config
                .report_suffix
                .unwrap_or_else(|| DEFAULT_REPORT_SUFFIX.to_string()),
            fasta_base_url: config
                .fasta_base_url
                .unwrap_or_else(|| DEFAULT_FASTA_BASE_URL.to_string()),
        };

        let fasta_extension = config
            .fasta_extension
            .map(|ext| ext.trim_start_matches('.').to_string())
            .unwrap_or_else(|| "fasta".to_string());
        if fasta_extension.is_empty() {
            return Err(SeqrepError::InvalidConfig(
                "fasta_extension must not be empty".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            assembly,
            local_root,
            pipeline,
            endpoints,
            fasta_extension,
            filter: config.filter.unwrap_or_default(),
        })
    }
}

pub fn default_local_root() -> Result<Utf8PathBuf, SeqrepError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("seqrep-dl")).ok()
        })
        .ok_or_else(|| SeqrepError::Filesystem("unable to resolve cache directory".to_string()))
}
