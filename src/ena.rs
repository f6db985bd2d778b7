use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::AssemblyAccession;
use crate::error::SeqrepError;

pub const DEFAULT_REPORT_ROOT_URL: &str = "https://ftp.ebi.ac.uk/pub/databases/ena/assembly";
pub const DEFAULT_FASTA_BASE_URL: &str = "https://www.ebi.ac.uk/ena/browser/api/fasta";
pub const DEFAULT_REPORT_SUFFIX: &str = "_sequence_report.txt";

/// One blocking retrieval of a sequence by accession.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, accession: &str) -> Result<Vec<u8>, SeqrepError>;
}

/// Retrieval of an assembly's sequence report into a local file.
pub trait ReportDownloader: Send + Sync {
    fn report_url(&self, assembly: &AssemblyAccession) -> String;

    fn download_report(
        &self,
        assembly: &AssemblyAccession,
        destination: &Path,
    ) -> Result<(), SeqrepError>;
}

#[derive(Debug, Clone)]
pub struct EnaEndpoints {
    pub report_root_url: String,
    pub report_suffix: String,
    pub fasta_base_url: String,
}

impl Default for EnaEndpoints {
    fn default() -> Self {
        Self {
            report_root_url: DEFAULT_REPORT_ROOT_URL.to_string(),
            report_suffix: DEFAULT_REPORT_SUFFIX.to_string(),
            fasta_base_url: DEFAULT_FASTA_BASE_URL.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct EnaHttpClient {
    client: Client,
    endpoints: EnaEndpoints,
}

impl EnaHttpClient {
    pub fn new(endpoints: EnaEndpoints) -> Result<Self, SeqrepError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("seqrep-dl/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SeqrepError::Http(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| SeqrepError::Http(err.to_string()))?;

        Ok(Self { client, endpoints })
    }

    pub fn fasta_url(&self, accession: &str) -> String {
        format!(
            "{}/{}",
            self.endpoints.fasta_base_url.trim_end_matches('/'),
            accession
        )
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, reqwest::Error>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        tracing::debug!(status, attempt, "retrying ENA request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        tracing::debug!(error = %err, attempt, "retrying ENA request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Fetcher for EnaHttpClient {
    fn fetch(&self, accession: &str) -> Result<Vec<u8>, SeqrepError> {
        let url = self.fasta_url(accession);
        let fetch_error = |message: String| SeqrepError::Fetch {
            accession: accession.to_string(),
            message,
        };
        let response = self
            .send_with_retries(|| self.client.get(&url))
            .map_err(|err| fetch_error(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "ENA request failed".to_string());
            return Err(SeqrepError::FetchStatus {
                accession: accession.to_string(),
                status,
                message,
            });
        }
        let body = response
            .bytes()
            .map_err(|err| fetch_error(err.to_string()))?;
        normalize_fasta(body.to_vec()).map_err(fetch_error)
    }
}

impl ReportDownloader for EnaHttpClient {
    fn report_url(&self, assembly: &AssemblyAccession) -> String {
        let (outer, inner) = assembly.directory_prefixes();
        format!(
            "{}/{outer}/{inner}/{}{}",
            self.endpoints.report_root_url.trim_end_matches('/'),
            assembly.as_str(),
            self.endpoints.report_suffix
        )
    }

    fn download_report(
        &self,
        assembly: &AssemblyAccession,
        destination: &Path,
    ) -> Result<(), SeqrepError> {
        let url = self.report_url(assembly);
        let mut response = self
            .send_with_retries(|| self.client.get(&url))
            .map_err(|err| SeqrepError::Http(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "ENA request failed".to_string());
            return Err(SeqrepError::HttpStatus { status, message });
        }
        let mut file =
            File::create(destination).map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| SeqrepError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Checks that a payload is FASTA and that it ends on a record boundary.
pub fn normalize_fasta(mut payload: Vec<u8>) -> Result<Vec<u8>, String> {
    let start = payload
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .ok_or_else(|| "empty response".to_string())?;
    if payload[start] != b'>' {
        return Err("response is not FASTA".to_string());
    }
    if payload.last() != Some(&b'\n') {
        payload.push(b'\n');
    }
    Ok(payload)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_url_uses_assembly_layout() {
        let client = EnaHttpClient::new(EnaEndpoints::default()).unwrap();
        let acc: AssemblyAccession = "GCA_000001405.10".parse().unwrap();
        assert_eq!(
            client.report_url(&acc),
            "https://ftp.ebi.ac.uk/pub/databases/ena/assembly/GCA_000/GCA_000001/GCA_000001405.10_sequence_report.txt"
        );
    }

    #[test]
    fn fasta_url_trims_trailing_slash() {
        let client = EnaHttpClient::new(EnaEndpoints {
            fasta_base_url: "http://localhost/fasta/".to_string(),
            ..EnaEndpoints::default()
        })
        .unwrap();
        assert_eq!(client.fasta_url("CM000663.2"), "http://localhost/fasta/CM000663.2");
    }

    #[test]
    fn normalize_appends_newline() {
        let payload = normalize_fasta(b">CM000663.2\nACGT".to_vec()).unwrap();
        assert_eq!(payload, b">CM000663.2\nACGT\n");
    }

    #[test]
    fn normalize_rejects_non_fasta() {
        assert!(normalize_fasta(b"<html>".to_vec()).is_err());
        assert!(normalize_fasta(b"  \n".to_vec()).is_err());
    }
}
