use thiserror::Error;

use crate::db::IndexBackend;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Text extraction failed")]
    Ocr(#[from] OcrError),

    #[error("Embedding error")]
    Embedding(#[from] EmbeddingError),

    #[error("Index write error")]
    Index(#[from] IndexError),

    #[error("Document processing failed")]
    Processing(#[from] ProcessingError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Ledger (SQLite) errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),
}

/// OCR extraction errors
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("Connection failed to OCR service at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unsupported document format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Document could not be parsed: {message}")]
    CorruptDocument { message: String },

    #[error("Extraction failed (status {status}): {message}")]
    Extraction { status: u16, message: String },

    #[error("Invalid response from OCR service")]
    InvalidResponse {
        #[source]
        source: reqwest::Error,
    },
}

/// Embedding API errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Connection failed to embedding service at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Embedding quota exceeded: {message}")]
    RateLimited { message: String },

    #[error("Embedding input too large: {message}")]
    InputTooLarge { message: String },

    #[error("Embedding generation failed (status {status}): {message}")]
    Generation { status: u16, message: String },

    #[error("Embedding batch misaligned: expected {expected} vectors, got {got}")]
    Misaligned { expected: usize, got: usize },

    #[error("Invalid response from embedding service")]
    InvalidResponse {
        #[source]
        source: reqwest::Error,
    },
}

/// Index backend errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Connection failed to {backend} index at {url}")]
    Connection {
        backend: IndexBackend,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend} index write failed (status {status}): {message}")]
    Write {
        backend: IndexBackend,
        status: u16,
        message: String,
    },

    #[error("{backend} index query failed (status {status}): {message}")]
    Query {
        backend: IndexBackend,
        status: u16,
        message: String,
    },

    #[error("Invalid response from {backend} index")]
    InvalidResponse {
        backend: IndexBackend,
        #[source]
        source: reqwest::Error,
    },
}

/// Document processing errors
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Document {document_id} has no extracted text recorded")]
    MissingExtraction { document_id: String },

    #[error("Document {document_id} produced no chunks")]
    NoChunks { document_id: String },

    #[error("Processing cancelled for document {document_id}")]
    Cancelled { document_id: String },

    #[error("File too large: {size} bytes (max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("IO error")]
    Io(#[source] std::io::Error),
}

/// How the orchestrator should treat a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying with backoff: network errors, timeouts, quota, 5xx.
    Transient,
    /// Retrying cannot help: malformed input, unsupported format, oversized content.
    Permanent,
}

/// 429 and 5xx responses are retryable, other client errors are not.
fn status_failure_kind(status: u16) -> FailureKind {
    if status == 429 || status >= 500 {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

impl ServiceError {
    /// Classify this error for the retry decision. Stage adapters report typed
    /// errors; the orchestrator is the only caller of this method.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ServiceError::Database(_) => FailureKind::Transient,
            ServiceError::Ocr(e) => e.failure_kind(),
            ServiceError::Embedding(e) => e.failure_kind(),
            ServiceError::Index(e) => e.failure_kind(),
            ServiceError::Processing(e) => e.failure_kind(),
            ServiceError::DocumentNotFound { .. }
            | ServiceError::Config { .. }
            | ServiceError::Internal { .. } => FailureKind::Permanent,
        }
    }
}

impl OcrError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OcrError::Connection { .. } | OcrError::InvalidResponse { .. } => {
                FailureKind::Transient
            }
            OcrError::UnsupportedFormat { .. } | OcrError::CorruptDocument { .. } => {
                FailureKind::Permanent
            }
            OcrError::Extraction { status, .. } => status_failure_kind(*status),
        }
    }
}

impl EmbeddingError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EmbeddingError::Connection { .. }
            | EmbeddingError::RateLimited { .. }
            | EmbeddingError::InvalidResponse { .. } => FailureKind::Transient,
            EmbeddingError::InputTooLarge { .. } | EmbeddingError::Misaligned { .. } => {
                FailureKind::Permanent
            }
            EmbeddingError::Generation { status, .. } => status_failure_kind(*status),
        }
    }
}

impl IndexError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            IndexError::Connection { .. } | IndexError::InvalidResponse { .. } => {
                FailureKind::Transient
            }
            IndexError::Write { status, .. } | IndexError::Query { status, .. } => {
                status_failure_kind(*status)
            }
        }
    }
}

impl ProcessingError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProcessingError::Io(_) => FailureKind::Transient,
            ProcessingError::MissingExtraction { .. }
            | ProcessingError::NoChunks { .. }
            | ProcessingError::Cancelled { .. }
            | ProcessingError::FileTooLarge { .. } => FailureKind::Permanent,
        }
    }
}

/// Render an error with its full source chain for ledger records and logs.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
