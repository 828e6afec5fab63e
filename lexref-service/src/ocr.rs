//! OCR extraction client.
//!
//! Text extraction runs in an external OCR service; this adapter ships the
//! raw document bytes over and gets page-marked text back. It never touches
//! ledger state: the orchestrator records the outcome.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::OcrConfig;
use crate::error::{OcrError, ServiceError, ServiceResult};

/// Extracted document text with page markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedText {
    pub pages: Vec<ExtractedPage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub number: i32,
    pub text: String,
}

/// Seam for the OCR stage so the orchestrator can be exercised without the
/// external service.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, filename: &str, content: &[u8]) -> ServiceResult<ExtractedText>;
}

/// HTTP client for the OCR service
pub struct OcrClient {
    client: Client,
    base_url: String,
}

impl OcrClient {
    pub fn new(config: &OcrConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build OCR client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct OcrRequest {
    filename: String,
    /// Base64-encoded document bytes
    content: String,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    pages: Vec<OcrPage>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    page: i32,
    text: String,
}

#[async_trait]
impl TextExtractor for OcrClient {
    async fn extract(&self, filename: &str, content: &[u8]) -> ServiceResult<ExtractedText> {
        let url = format!("{}/v1/ocr", self.base_url);

        let request = OcrRequest {
            filename: filename.to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(content),
        };

        debug!(filename = %filename, bytes = content.len(), "Requesting OCR extraction");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                ServiceError::Ocr(OcrError::Connection {
                    url: url.clone(),
                    source: e,
                })
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();

            return Err(ServiceError::Ocr(match status {
                415 => OcrError::UnsupportedFormat {
                    format: extension_of(filename),
                },
                422 => OcrError::CorruptDocument { message },
                _ => OcrError::Extraction { status, message },
            }));
        }

        let body: OcrResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Ocr(OcrError::InvalidResponse { source: e }))?;

        let pages: Vec<ExtractedPage> = body
            .pages
            .into_iter()
            .map(|p| ExtractedPage {
                number: p.page,
                text: p.text,
            })
            .filter(|p| !p.text.trim().is_empty())
            .collect();

        if pages.is_empty() {
            return Err(ServiceError::Ocr(OcrError::CorruptDocument {
                message: "no text could be extracted".to_string(),
            }));
        }

        Ok(ExtractedText { pages })
    }
}

fn extension_of(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_deserializes_with_page_markers() {
        let body = r#"{"pages": [{"page": 1, "text": "first"}, {"page": 2, "text": "second"}]}"#;
        let parsed: OcrResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.pages.len(), 2);
        assert_eq!(parsed.pages[1].page, 2);
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of("Ruling.PDF"), "pdf");
        assert_eq!(extension_of("scan"), "");
    }
}
