use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use super::{map_http_error, read_json, FileScanner, ScanFuture, ScanResult, ScanVerdict};

#[derive(Debug, Deserialize)]
struct HashResponse {
    verdict: ScanVerdict,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    #[serde(default)]
    file_name: String,
    status: ScanVerdict,
    #[serde(default)]
    engines_checked: Vec<String>,
}

/// File reputation client, hash lookups via `GET <base>/scan/<sha256>` and
/// full scans via a multipart `POST <base>/scan/file`.
pub struct FileScannerClient {
    client: reqwest::Client,
    base_url: String,
}

impl FileScannerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ScanResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_http_error)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl FileScanner for FileScannerClient {
    fn scan_file_hash<'a>(
        &'a self,
        file_name: &'a str,
        sha256: &'a str,
    ) -> ScanFuture<'a, ScanVerdict> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/scan/{sha256}", self.base_url))
                .send()
                .await
                .map_err(map_http_error)?;
            let response: HashResponse = read_json(response).await?;
            debug!(
                file_name = %file_name,
                sha256 = %sha256,
                verdict = ?response.verdict,
                "Received file hash reputation"
            );
            Ok(response.verdict)
        })
    }

    fn scan_file<'a>(&'a self, file_name: &'a str, bytes: &'a [u8]) -> ScanFuture<'a, ScanVerdict> {
        Box::pin(async move {
            let part = Part::bytes(bytes.to_vec()).file_name(file_name.to_string());
            let form = Form::new().part("file", part);
            let response = self
                .client
                .post(format!("{}/scan/file", self.base_url))
                .multipart(form)
                .send()
                .await
                .map_err(map_http_error)?;
            let response: FileResponse = read_json(response).await?;
            debug!(
                file_name = %file_name,
                reported_name = %response.file_name,
                engines = ?response.engines_checked,
                verdict = ?response.status,
                "Received file scan reputation"
            );
            Ok(response.status)
        })
    }

    fn name(&self) -> &str {
        "file_scanner"
    }
}

/// Scanner used when no file reputation service is configured, every file
/// is clean.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFileScanner;

impl FileScanner for NoopFileScanner {
    fn scan_file_hash<'a>(
        &'a self,
        _file_name: &'a str,
        _sha256: &'a str,
    ) -> ScanFuture<'a, ScanVerdict> {
        Box::pin(async { Ok(ScanVerdict::Clean) })
    }

    fn scan_file<'a>(&'a self, _file_name: &'a str, _bytes: &'a [u8]) -> ScanFuture<'a, ScanVerdict> {
        Box::pin(async { Ok(ScanVerdict::Clean) })
    }

    fn name(&self) -> &str {
        "noop"
    }
}
