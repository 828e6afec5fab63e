//! OpenSearch-backed full-text index writer.
//!
//! Documents are indexed with `PUT /{index}/_doc/{chunk_id}`, which replaces
//! the existing document for that id, so replayed writes cannot duplicate.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{IndexEntry, IndexHit, IndexWriter, QueryRequest, normalize_base_url};
use crate::config::FullTextIndexConfig;
use crate::db::IndexBackend;
use crate::error::{IndexError, ServiceError, ServiceResult};

pub struct FullTextIndexWriter {
    client: Client,
    base_url: String,
    index: String,
}

impl FullTextIndexWriter {
    pub fn new(config: &FullTextIndexConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build full-text index client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: normalize_base_url(&config.base_url),
            index: config.index.clone(),
        })
    }

    /// Create the index with its mapping when it is missing. Called once at
    /// startup.
    pub async fn ensure_index(&self) -> ServiceResult<()> {
        let url = format!("{}/{}", self.base_url, self.index);

        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status().as_u16() != 404 {
            return Err(self.unexpected_status(response, "index check").await);
        }

        debug!(index = %self.index, "Creating full-text index");

        let body = json!({
            "mappings": {
                "properties": {
                    "document_id": { "type": "keyword" },
                    "ordinal": { "type": "integer" },
                    "page_number": { "type": "integer" },
                    "content": { "type": "text" }
                }
            }
        });

        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;

        if !response.status().is_success() {
            return Err(self.unexpected_status(response, "index create").await);
        }

        Ok(())
    }

    fn connection_error(&self, url: &str, source: reqwest::Error) -> ServiceError {
        ServiceError::Index(IndexError::Connection {
            backend: IndexBackend::FullText,
            url: url.to_string(),
            source,
        })
    }

    async fn unexpected_status(&self, response: reqwest::Response, op: &str) -> ServiceError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ServiceError::Index(IndexError::Write {
            backend: IndexBackend::FullText,
            status,
            message: format!("{op}: {body}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score")]
    score: f32,
}

#[async_trait]
impl IndexWriter for FullTextIndexWriter {
    fn backend(&self) -> IndexBackend {
        IndexBackend::FullText
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> ServiceResult<()> {
        for entry in entries {
            let url = format!("{}/{}/_doc/{}", self.base_url, self.index, entry.chunk_id);

            let body = json!({
                "document_id": entry.document_id,
                "ordinal": entry.ordinal,
                "page_number": entry.page_number,
                "content": entry.content,
            });

            let response = self
                .client
                .put(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| self.connection_error(&url, e))?;

            if !response.status().is_success() {
                return Err(self.unexpected_status(response, "doc upsert").await);
            }
        }

        debug!(index = %self.index, docs = entries.len(), "Documents upserted");
        Ok(())
    }

    async fn query(&self, request: &QueryRequest, limit: usize) -> ServiceResult<Vec<IndexHit>> {
        let url = format!("{}/{}/_search", self.base_url, self.index);

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "query": { "match": { "content": request.text } },
                "size": limit,
                "_source": false,
            }))
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Index(IndexError::Query {
                backend: IndexBackend::FullText,
                status,
                message: body,
            }));
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            ServiceError::Index(IndexError::InvalidResponse {
                backend: IndexBackend::FullText,
                source: e,
            })
        })?;

        Ok(body
            .hits
            .hits
            .into_iter()
            .map(|hit| IndexHit {
                chunk_id: hit.id,
                score: hit.score,
            })
            .collect())
    }
}
