//! Embedding generation client.
//!
//! Calls an OpenAI-style `/embeddings` endpoint with bounded batches. The
//! response is re-ordered by the service's `index` field and validated to
//! align one-to-one with the input batch, so the vector at position i always
//! belongs to the text at position i.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingsConfig;
use crate::error::{EmbeddingError, ServiceError, ServiceResult};

/// Seam for the embedding stage.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Embed a batch of texts, one vector per input, same order.
    async fn embed(&self, texts: &[String]) -> ServiceResult<Vec<Vec<f32>>>;
}

/// HTTP client for an OpenAI-compatible embedding API
pub struct OpenAiEmbeddingClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(config: &EmbeddingsConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build embedding client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingGenerator for OpenAiEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> ServiceResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        debug!(batch = texts.len(), model = %self.model, "Requesting embeddings");

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            ServiceError::Embedding(EmbeddingError::Connection {
                url: url.clone(),
                source: e,
            })
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();

            return Err(ServiceError::Embedding(match status {
                429 => EmbeddingError::RateLimited { message },
                400 if message.contains("maximum context length")
                    || message.contains("too large") =>
                {
                    EmbeddingError::InputTooLarge { message }
                }
                _ => EmbeddingError::Generation { status, message },
            }));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Embedding(EmbeddingError::InvalidResponse { source: e }))?;

        align_vectors(body, texts.len()).map_err(ServiceError::Embedding)
    }
}

/// Order response vectors by their `index` field and require exactly one per
/// input text.
fn align_vectors(body: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if body.data.len() != expected {
        return Err(EmbeddingError::Misaligned {
            expected,
            got: body.data.len(),
        });
    }

    let mut ordered: Vec<Option<Vec<f32>>> = vec![None; expected];
    for item in body.data {
        if item.index >= expected || ordered[item.index].is_some() {
            return Err(EmbeddingError::Misaligned {
                expected,
                got: expected + 1,
            });
        }
        ordered[item.index] = Some(item.embedding);
    }

    // Every slot is filled: lengths matched and indexes were unique.
    Ok(ordered.into_iter().map(|v| v.unwrap()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_response_is_realigned() {
        let body: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [
                {"index": 1, "embedding": [2.0]},
                {"index": 0, "embedding": [1.0]},
                {"index": 2, "embedding": [3.0]}
            ]}"#,
        )
        .unwrap();

        let vectors = align_vectors(body, 3).unwrap();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0], vec![3.0]]);
    }

    #[test]
    fn short_response_is_rejected() {
        let body: EmbeddingResponse =
            serde_json::from_str(r#"{"data": [{"index": 0, "embedding": [1.0]}]}"#).unwrap();
        let err = align_vectors(body, 2).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::Misaligned {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn duplicate_indexes_are_rejected() {
        let body: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [
                {"index": 0, "embedding": [1.0]},
                {"index": 0, "embedding": [9.0]}
            ]}"#,
        )
        .unwrap();
        assert!(align_vectors(body, 2).is_err());
    }
}
