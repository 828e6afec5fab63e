use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::RetryPolicy;

/// Service configuration, loaded once at startup from an optional `config.*`
/// file layered with `LEXREF__`-prefixed environment variables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub ocr: OcrConfig,

    #[serde(default)]
    pub embeddings: EmbeddingsConfig,

    #[serde(default)]
    pub vector_index: VectorIndexConfig,

    #[serde(default)]
    pub fulltext_index: FullTextIndexConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional intake directory. When set, files placed here are enqueued
    /// automatically; failures are moved to a `failed/` subdirectory.
    #[serde(default)]
    pub intake_dir: Option<PathBuf>,
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent claim/advance workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Idle sleep between claim attempts when no work is eligible
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Failed attempts tolerated before a document is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Chunk window in words
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between consecutive chunks in words
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Chunk texts per embedding API call
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,

    #[serde(default = "default_max_document_size")]
    pub max_document_size_bytes: u64,
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

/// OCR service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_url")]
    pub base_url: String,

    #[serde(default = "default_ocr_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Embedding API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_embeddings_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector dimension; must match the vector index collection
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    #[serde(default = "default_embeddings_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Vector index (Qdrant) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VectorIndexConfig {
    #[serde(default = "default_vector_url")]
    pub base_url: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_index_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Full-text index (OpenSearch) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FullTextIndexConfig {
    #[serde(default = "default_fulltext_url")]
    pub base_url: String,

    #[serde(default = "default_index_name")]
    pub index: String,

    #[serde(default = "default_index_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Load configuration from `config.*` (optional) plus environment overrides,
/// e.g. `LEXREF__PIPELINE__WORKER_COUNT=4`.
pub fn load() -> Result<Config, config::ConfigError> {
    ConfigBuilder::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("LEXREF")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_worker_count() -> usize {
    2
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_chunk_size() -> usize {
    512
}

fn default_chunk_overlap() -> usize {
    64
}

fn default_embed_batch_size() -> usize {
    16
}

fn default_max_document_size() -> u64 {
    50 * 1024 * 1024
}

fn default_ocr_url() -> String {
    "http://localhost:8884".to_string()
}

fn default_ocr_timeout_secs() -> u64 {
    120
}

fn default_embeddings_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    1536
}

fn default_embeddings_timeout_secs() -> u64 {
    60
}

fn default_vector_url() -> String {
    "http://localhost:6333".to_string()
}

fn default_collection() -> String {
    "lexref-chunks".to_string()
}

fn default_fulltext_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_index_name() -> String {
    "lexref-chunks".to_string()
}

fn default_index_timeout_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            intake_dir: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            poll_interval_secs: default_poll_interval_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            embed_batch_size: default_embed_batch_size(),
            max_document_size_bytes: default_max_document_size(),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            base_url: default_ocr_url(),
            request_timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: default_embeddings_url(),
            api_key: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            request_timeout_secs: default_embeddings_timeout_secs(),
        }
    }
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            base_url: default_vector_url(),
            collection: default_collection(),
            request_timeout_secs: default_index_timeout_secs(),
        }
    }
}

impl Default for FullTextIndexConfig {
    fn default() -> Self {
        Self {
            base_url: default_fulltext_url(),
            index: default_index_name(),
            request_timeout_secs: default_index_timeout_secs(),
        }
    }
}
