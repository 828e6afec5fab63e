//! Qdrant-backed vector index writer.
//!
//! Lightweight HTTP client against the Qdrant REST API. Points are keyed by
//! chunk uuid, so an upsert replayed after a retry overwrites the same point
//! instead of duplicating it.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{IndexEntry, IndexHit, IndexWriter, QueryRequest, normalize_base_url};
use crate::config::VectorIndexConfig;
use crate::db::IndexBackend;
use crate::error::{IndexError, ServiceError, ServiceResult};

pub struct VectorIndexWriter {
    client: Client,
    base_url: String,
    collection: String,
}

impl VectorIndexWriter {
    pub fn new(config: &VectorIndexConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build vector index client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: normalize_base_url(&config.base_url),
            collection: config.collection.clone(),
        })
    }

    /// Create the collection when it is missing. Called once at startup;
    /// the vector size must match the embedding model's dimension.
    pub async fn ensure_collection(&self, vector_size: usize) -> ServiceResult<()> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status().as_u16() != 404 {
            return Err(self.unexpected_status(response, "collection check").await);
        }

        debug!(collection = %self.collection, vector_size, "Creating vector collection");

        let body = json!({
            "vectors": {
                "size": vector_size,
                "distance": "Cosine"
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
            return Err(self.unexpected_status(response, "collection create").await);
        }

        Ok(())
    }

    fn connection_error(&self, url: &str, source: reqwest::Error) -> ServiceError {
        ServiceError::Index(IndexError::Connection {
            backend: IndexBackend::Vector,
            url: url.to_string(),
            source,
        })
    }

    async fn unexpected_status(&self, response: reqwest::Response, op: &str) -> ServiceError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ServiceError::Index(IndexError::Write {
            backend: IndexBackend::Vector,
            status,
            message: format!("{op}: {body}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    id: String,
    score: f32,
}

#[async_trait]
impl IndexWriter for VectorIndexWriter {
    fn backend(&self) -> IndexBackend {
        IndexBackend::Vector
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> ServiceResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let points: Vec<_> = entries
            .iter()
            .map(|entry| {
                json!({
                    "id": entry.chunk_id,
                    "vector": entry.vector,
                    "payload": {
                        "document_id": entry.document_id,
                        "ordinal": entry.ordinal,
                        "page_number": entry.page_number,
                    }
                })
            })
            .collect();

        let url = format!(
            "{}/collections/{}/points?wait=true",
            self.base_url, self.collection
        );

        let response = self
            .client
            .put(&url)
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;

        if !response.status().is_success() {
            return Err(self.unexpected_status(response, "points upsert").await);
        }

        debug!(collection = %self.collection, points = entries.len(), "Points upserted");
        Ok(())
    }

    async fn query(&self, request: &QueryRequest, limit: usize) -> ServiceResult<Vec<IndexHit>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "vector": request.vector,
                "limit": limit,
                "with_payload": false,
            }))
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Index(IndexError::Query {
                backend: IndexBackend::Vector,
                status,
                message: body,
            }));
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            ServiceError::Index(IndexError::InvalidResponse {
                backend: IndexBackend::Vector,
                source: e,
            })
        })?;

        Ok(body
            .result
            .into_iter()
            .map(|point| IndexHit {
                chunk_id: point.id,
                score: point.score,
            })
            .collect())
    }
}
