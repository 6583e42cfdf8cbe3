use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{map_http_error, read_json, ScanFuture, UrlReport, UrlScanner};
use crate::scanner::ScanResult;

/// Body of a web filter answer. The grey flag is spelled `domain_gret` on
/// the wire.
#[derive(Debug, Deserialize)]
struct WebFilterResponse {
    response_code: i64,
    #[serde(default)]
    malicious_categories: Vec<String>,
    #[serde(default, rename = "domain_gret")]
    domain_grey: bool,
}

impl From<WebFilterResponse> for UrlReport {
    fn from(response: WebFilterResponse) -> Self {
        Self {
            status_code: response.response_code,
            status_message: response.malicious_categories,
            domain_grey: response.domain_grey,
        }
    }
}

/// URL reputation client for the web filter service.
///
/// Each lookup is a `GET <url>?url=<link>` authenticated by the `tkn`
/// header carrying the client id.
pub struct WebFilterClient {
    client: reqwest::Client,
    url: String,
    client_id: String,
}

impl WebFilterClient {
    pub fn new(url: impl Into<String>, client_id: impl Into<String>, timeout: Duration) -> ScanResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_http_error)?;
        Ok(Self {
            client,
            url: url.into(),
            client_id: client_id.into(),
        })
    }
}

impl UrlScanner for WebFilterClient {
    fn scan_url<'a>(&'a self, url: &'a str) -> ScanFuture<'a, Vec<UrlReport>> {
        Box::pin(async move {
            debug!(url = %url, service = %self.url, "Sending URL reputation request");
            let response = self
                .client
                .get(&self.url)
                .query(&[("url", url)])
                .header("tkn", &self.client_id)
                .header("Content-Type", "application/json")
                .send()
                .await
                .map_err(map_http_error)?;
            let response: WebFilterResponse = read_json(response).await?;
            let report = UrlReport::from(response);
            debug!(
                url = %url,
                status_code = report.status_code,
                categories = ?report.status_message,
                "Received URL reputation"
            );
            Ok(vec![report])
        })
    }

    fn name(&self) -> &str {
        "web_filter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{testing::serve_once, ScanError};

    fn client(addr: std::net::SocketAddr) -> WebFilterClient {
        WebFilterClient::new(
            format!("http://{addr}/check"),
            "client-1",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_scan_url_malicious() {
        let (addr, request) = serve_once(
            "200 OK",
            r#"{"response_code": 2, "malicious_categories": ["phishing"], "domain_gret": true}"#,
        )
        .await;

        let reports = client(addr).scan_url("http://evil.example/a b").await.unwrap();
        assert_eq!(
            reports,
            vec![UrlReport {
                status_code: 2,
                status_message: vec!["phishing".to_string()],
                domain_grey: true,
            }]
        );
        assert!(reports[0].is_malicious());

        let request = request.await.unwrap();
        assert!(request.starts_with("GET /check?url=http%3A%2F%2Fevil.example%2Fa+b HTTP/1.1"));
        assert!(request.contains("tkn: client-1"));
    }

    #[tokio::test]
    async fn test_scan_url_clean() {
        let (addr, _request) = serve_once("200 OK", r#"{"response_code": 0}"#).await;

        let reports = client(addr).scan_url("https://example.com").await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].is_malicious());
    }

    #[tokio::test]
    async fn test_scan_url_non_200() {
        let (addr, _request) = serve_once("500 Internal Server Error", "{}").await;

        let result = client(addr).scan_url("https://example.com").await;
        assert!(matches!(result, Err(ScanError::Status(500))));
    }

    #[tokio::test]
    async fn test_scan_url_bad_json() {
        let (addr, _request) = serve_once("200 OK", "not json").await;

        let result = client(addr).scan_url("https://example.com").await;
        assert!(matches!(result, Err(ScanError::Decode(_))));
    }
}
