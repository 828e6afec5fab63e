//! Ledger model structs.
//!
//! This module contains the data structures for ledger records and the
//! processing state machine they move through.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Processing state for documents.
///
/// States advance monotonically forward through the pipeline. `Failed` is the
/// parked-for-retry state (the stage to resume from is kept alongside it),
/// `Indexed`, `Degraded`, and `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Enqueued, waiting for a worker to claim it
    Queued,
    /// OCR extraction in progress
    OcrRunning,
    /// Extracted text persisted
    OcrDone,
    /// Chunk creation in progress
    Chunking,
    /// Chunks persisted
    ChunkingDone,
    /// Embedding generation in progress
    Embedding,
    /// All chunk embeddings persisted
    EmbeddingDone,
    /// Dual-index writes in progress
    Indexing,
    /// Every chunk written to both backends
    Indexed,
    /// Transient failure, parked until the retry becomes eligible
    Failed,
    /// One backend fully written, the other exhausted its retries
    Degraded,
    /// Exhausted retries or hit a non-retryable error
    DeadLettered,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Queued => "queued",
            ProcessingState::OcrRunning => "ocr_running",
            ProcessingState::OcrDone => "ocr_done",
            ProcessingState::Chunking => "chunking",
            ProcessingState::ChunkingDone => "chunking_done",
            ProcessingState::Embedding => "embedding",
            ProcessingState::EmbeddingDone => "embedding_done",
            ProcessingState::Indexing => "indexing",
            ProcessingState::Indexed => "indexed",
            ProcessingState::Failed => "failed",
            ProcessingState::Degraded => "degraded",
            ProcessingState::DeadLettered => "dead_lettered",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ocr_running" => ProcessingState::OcrRunning,
            "ocr_done" => ProcessingState::OcrDone,
            "chunking" => ProcessingState::Chunking,
            "chunking_done" => ProcessingState::ChunkingDone,
            "embedding" => ProcessingState::Embedding,
            "embedding_done" => ProcessingState::EmbeddingDone,
            "indexing" => ProcessingState::Indexing,
            "indexed" => ProcessingState::Indexed,
            "failed" => ProcessingState::Failed,
            "degraded" => ProcessingState::Degraded,
            "dead_lettered" => ProcessingState::DeadLettered,
            _ => ProcessingState::Queued,
        }
    }

    /// No further transitions happen out of a terminal state except an
    /// explicit re-enqueue of a dead-lettered document.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingState::Indexed | ProcessingState::Degraded | ProcessingState::DeadLettered
        )
    }

    /// States a worker holds while actively executing a stage.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProcessingState::OcrRunning
                | ProcessingState::Chunking
                | ProcessingState::Embedding
                | ProcessingState::Indexing
        )
    }

    /// Durable checkpoints a claim can start a stage from.
    pub fn is_checkpoint(&self) -> bool {
        matches!(
            self,
            ProcessingState::Queued
                | ProcessingState::OcrDone
                | ProcessingState::ChunkingDone
                | ProcessingState::EmbeddingDone
        )
    }

    /// Running stage -> the state committed when the stage finishes.
    pub fn on_success(&self) -> Option<ProcessingState> {
        match self {
            ProcessingState::OcrRunning => Some(ProcessingState::OcrDone),
            ProcessingState::Chunking => Some(ProcessingState::ChunkingDone),
            ProcessingState::Embedding => Some(ProcessingState::EmbeddingDone),
            ProcessingState::Indexing => Some(ProcessingState::Indexed),
            _ => None,
        }
    }

    /// Checkpoint -> the running state a claim moves the document into.
    pub fn next_running(&self) -> Option<ProcessingState> {
        match self {
            ProcessingState::Queued => Some(ProcessingState::OcrRunning),
            ProcessingState::OcrDone => Some(ProcessingState::Chunking),
            ProcessingState::ChunkingDone => Some(ProcessingState::Embedding),
            ProcessingState::EmbeddingDone => Some(ProcessingState::Indexing),
            _ => None,
        }
    }

    /// Running stage -> the checkpoint a failed or interrupted stage retries from.
    pub fn retry_checkpoint(&self) -> Option<ProcessingState> {
        match self {
            ProcessingState::OcrRunning => Some(ProcessingState::Queued),
            ProcessingState::Chunking => Some(ProcessingState::OcrDone),
            ProcessingState::Embedding => Some(ProcessingState::ChunkingDone),
            ProcessingState::Indexing => Some(ProcessingState::EmbeddingDone),
            _ => None,
        }
    }
}

/// The two independently-failing retrieval backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    Vector,
    FullText,
}

impl IndexBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexBackend::Vector => "vector",
            IndexBackend::FullText => "fulltext",
        }
    }
}

impl std::fmt::Display for IndexBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-chunk, per-backend write status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexWriteStatus {
    /// Not yet attempted for this backend
    #[default]
    Pending,
    /// Durably written; never re-sent
    Written,
    /// Last attempt failed; eligible for retry
    Failed,
}

impl IndexWriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexWriteStatus::Pending => "pending",
            IndexWriteStatus::Written => "written",
            IndexWriteStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "written" => IndexWriteStatus::Written,
            "failed" => IndexWriteStatus::Failed,
            _ => IndexWriteStatus::Pending,
        }
    }
}

/// Document ledger record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub blob_ref: String,
    pub content_hash: String,
    pub state: ProcessingState,
    /// Checkpoint to resume from while `state` is `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<ProcessingState>,
    /// Failed attempts so far; the successful attempt is `retry_count + 1`
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let state_str: String = row.get(4)?;
        let resume_state_str: Option<String> = row.get(5)?;
        let retry_count: i64 = row.get(6)?;
        let next_retry_at_str: Option<String> = row.get(7)?;
        let created_at_str: String = row.get(9)?;
        let updated_at_str: String = row.get(10)?;
        let chunk_count: i64 = row.get(11)?;

        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            blob_ref: row.get(2)?,
            content_hash: row.get(3)?,
            state: ProcessingState::from_str(&state_str),
            resume_state: resume_state_str.as_deref().map(ProcessingState::from_str),
            retry_count: retry_count as u32,
            next_retry_at: next_retry_at_str.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }),
            last_error: row.get(8)?,
            chunk_count: chunk_count as usize,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

/// Chunk ledger record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Position within the document; unique per document, assigned in page order
    pub ordinal: i32,
    pub page_number: i32,
    /// Byte offsets into the extracted page text
    pub start_offset: i64,
    pub end_offset: i64,
    pub content: String,
    pub vector_status: IndexWriteStatus,
    pub fulltext_status: IndexWriteStatus,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let vector_status_str: String = row.get(7)?;
        let fulltext_status_str: String = row.get(8)?;
        let created_at_str: String = row.get(9)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            ordinal: row.get(2)?,
            page_number: row.get(3)?,
            start_offset: row.get(4)?,
            end_offset: row.get(5)?,
            content: row.get(6)?,
            vector_status: IndexWriteStatus::from_str(&vector_status_str),
            fulltext_status: IndexWriteStatus::from_str(&fulltext_status_str),
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    pub fn status_for(&self, backend: IndexBackend) -> IndexWriteStatus {
        match backend {
            IndexBackend::Vector => self.vector_status,
            IndexBackend::FullText => self.fulltext_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_strings() {
        let states = [
            ProcessingState::Queued,
            ProcessingState::OcrRunning,
            ProcessingState::OcrDone,
            ProcessingState::Chunking,
            ProcessingState::ChunkingDone,
            ProcessingState::Embedding,
            ProcessingState::EmbeddingDone,
            ProcessingState::Indexing,
            ProcessingState::Indexed,
            ProcessingState::Failed,
            ProcessingState::Degraded,
            ProcessingState::DeadLettered,
        ];
        for state in states {
            assert_eq!(ProcessingState::from_str(state.as_str()), state);
        }
    }

    #[test]
    fn pipeline_advances_through_every_stage() {
        let mut state = ProcessingState::Queued;
        let mut visited = vec![state];
        while let Some(running) = state.next_running() {
            let done = running.on_success().unwrap();
            visited.push(running);
            visited.push(done);
            state = done;
        }
        assert_eq!(state, ProcessingState::Indexed);
        assert_eq!(visited.len(), 9);
    }

    #[test]
    fn running_stages_retry_from_their_entry_checkpoint() {
        for running in [
            ProcessingState::OcrRunning,
            ProcessingState::Chunking,
            ProcessingState::Embedding,
            ProcessingState::Indexing,
        ] {
            let checkpoint = running.retry_checkpoint().unwrap();
            assert!(checkpoint.is_checkpoint());
            assert_eq!(checkpoint.next_running(), Some(running));
        }
    }

    #[test]
    fn terminal_states_have_no_successor() {
        for state in [
            ProcessingState::Indexed,
            ProcessingState::Degraded,
            ProcessingState::DeadLettered,
        ] {
            assert!(state.is_terminal());
            assert_eq!(state.next_running(), None);
            assert_eq!(state.on_success(), None);
        }
    }

    #[test]
    fn write_status_round_trips() {
        for status in [
            IndexWriteStatus::Pending,
            IndexWriteStatus::Written,
            IndexWriteStatus::Failed,
        ] {
            assert_eq!(IndexWriteStatus::from_str(status.as_str()), status);
        }
    }
}
