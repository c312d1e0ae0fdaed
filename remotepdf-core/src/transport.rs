//! Network seam used by the fetch pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use crate::config::ViewerConfig;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("server responded with status {status}")]
    Status { status: u16 },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("connection interrupted: {0}")]
    Interrupted(String),
}

/// Whether a URL serves a PDF, judged from the headers of a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Pdf,
    NotPdf { content_type: Option<String> },
    Unreachable { message: String },
}

impl ProbeOutcome {
    pub fn from_headers(content_type: Option<&str>, content_disposition: Option<&str>) -> Self {
        let by_type = content_type
            .map(|value| value.to_ascii_lowercase().contains("application/pdf"))
            .unwrap_or(false);
        let by_name = content_disposition
            .map(|value| value.to_ascii_lowercase().contains(".pdf"))
            .unwrap_or(false);
        if by_type || by_name {
            ProbeOutcome::Pdf
        } else {
            ProbeOutcome::NotPdf {
                content_type: content_type.map(str::to_owned),
            }
        }
    }

    pub fn is_pdf(&self) -> bool {
        matches!(self, ProbeOutcome::Pdf)
    }
}

/// Body of an in-flight download.
#[async_trait]
pub trait DownloadBody: Send {
    /// Total size advertised by the server, if any.
    fn expected_len(&self) -> Option<u64>;
    /// Next chunk of the body, `None` once the body is complete.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues the request and resolves once a successful response head has
    /// arrived. Non-success statuses are errors.
    async fn start(&self, url: &Url) -> Result<Box<dyn DownloadBody>, TransportError>;
    async fn probe(&self, url: &Url) -> ProbeOutcome;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &ViewerConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }
}

struct HttpBody {
    response: reqwest::Response,
    expected: Option<u64>,
}

#[async_trait]
impl DownloadBody for HttpBody {
    fn expected_len(&self) -> Option<u64> {
        self.expected
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.response.chunk().await?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self), fields(url = %url))]
    async fn start(&self, url: &Url) -> Result<Box<dyn DownloadBody>, TransportError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        let expected = response.content_length().filter(|&len| len > 0);
        debug!(status = status.as_u16(), ?expected, "response head received");
        Ok(Box::new(HttpBody { response, expected }))
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn probe(&self, url: &Url) -> ProbeOutcome {
        match self.client.head(url.clone()).send().await {
            Ok(response) => {
                let outcome = outcome_from_header_map(response.headers());
                debug!(status = response.status().as_u16(), ?outcome, "probe finished");
                outcome
            }
            Err(err) => ProbeOutcome::Unreachable {
                message: err.to_string(),
            },
        }
    }
}

fn outcome_from_header_map(headers: &HeaderMap) -> ProbeOutcome {
    let header = move |name: HeaderName| headers.get(name).and_then(|value| value.to_str().ok());
    ProbeOutcome::from_headers(header(CONTENT_TYPE), header(CONTENT_DISPOSITION))
}

#[cfg(test)]
mod tests {
    use super::*;

    use reqwest::header::HeaderValue;

    #[test]
    fn content_type_marks_pdf() {
        assert!(ProbeOutcome::from_headers(Some("application/pdf"), None).is_pdf());
        assert!(
            ProbeOutcome::from_headers(Some("Application/PDF; charset=binary"), None).is_pdf()
        );
    }

    #[test]
    fn content_disposition_filename_marks_pdf() {
        let outcome = ProbeOutcome::from_headers(
            Some("application/octet-stream"),
            Some("attachment; filename=\"manual.pdf\""),
        );
        assert!(outcome.is_pdf());
    }

    #[test]
    fn other_documents_are_rejected() {
        assert_eq!(
            ProbeOutcome::from_headers(Some("text/html"), None),
            ProbeOutcome::NotPdf {
                content_type: Some("text/html".to_string())
            }
        );
        assert!(!ProbeOutcome::from_headers(None, None).is_pdf());
    }

    #[test]
    fn header_map_lookup_uses_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("binary/octet-stream"));
        assert!(!outcome_from_header_map(&headers).is_pdf());
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("inline; filename=report.PDF"),
        );
        assert!(outcome_from_header_map(&headers).is_pdf());
    }
}
