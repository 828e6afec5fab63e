//! Document ledger operations.
//!
//! All state-machine mutations go through this module. Every transition is a
//! conditional update (compare-and-set on the state column) so concurrent
//! workers can never observe or produce an inconsistent intermediate state.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{Document, ProcessingState};
use crate::error::{DatabaseError, ServiceResult};
use crate::ocr::ExtractedText;

const DOCUMENT_COLUMNS: &str = "d.id, d.filename, d.blob_ref, d.content_hash, d.state, \
     d.resume_state, d.retry_count, d.next_retry_at, d.last_error, d.created_at, d.updated_at, \
     (SELECT COUNT(*) FROM chunks WHERE document_id = d.id) as chunk_count";

impl Database {
    /// Insert a new ledger row at `Queued`.
    pub fn insert_document(&self, doc: &Document) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            INSERT INTO documents (id, filename, blob_ref, content_hash, state, resume_state, retry_count, next_retry_at, last_error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                doc.id,
                doc.filename,
                doc.blob_ref,
                doc.content_hash,
                doc.state.as_str(),
                doc.resume_state.map(|s| s.as_str()),
                doc.retry_count as i64,
                doc.next_retry_at.map(|t| t.to_rfc3339()),
                doc.last_error,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE d.id = ?1"),
            params![id],
            Document::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Check whether a document with the given content hash already exists.
    /// Dead-lettered documents are ignored so a re-upload can start fresh.
    pub fn get_document_by_hash(&self, content_hash: &str) -> ServiceResult<Option<String>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            "SELECT id FROM documents WHERE content_hash = ?1 AND state != 'dead_lettered' \
             ORDER BY created_at ASC LIMIT 1",
            params![content_hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// List all documents, oldest first.
    pub fn list_documents(&self) -> ServiceResult<Vec<Document>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents d ORDER BY d.created_at ASC"
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map([], Document::from_row)
            .map_err(DatabaseError::Query)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(docs)
    }

    /// Atomically claim the next eligible document.
    ///
    /// Eligible rows are checkpoint states (`Queued`, `OcrDone`,
    /// `ChunkingDone`, `EmbeddingDone`) and `Failed` rows whose retry delay
    /// has elapsed at `now`. The claim is a conditional transition into the
    /// stage's running state; if the conditional update misses (another
    /// process won the row) no document is returned.
    pub fn claim_next(&self, now: DateTime<Utc>) -> ServiceResult<Option<Document>> {
        let claimed_id = {
            let conn = self.conn.lock().unwrap();

            let candidate: Option<(String, String, Option<String>)> = conn
                .query_row(
                    "SELECT id, state, resume_state FROM documents \
                     WHERE state IN ('queued', 'ocr_done', 'chunking_done', 'embedding_done') \
                        OR (state = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1) \
                     ORDER BY created_at ASC LIMIT 1",
                    params![now.to_rfc3339()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(DatabaseError::Query)?;

            let Some((id, state_str, resume_str)) = candidate else {
                return Ok(None);
            };

            let state = ProcessingState::from_str(&state_str);
            let checkpoint = if state == ProcessingState::Failed {
                resume_str
                    .as_deref()
                    .map(ProcessingState::from_str)
                    .unwrap_or(ProcessingState::Queued)
            } else {
                state
            };
            let Some(running) = checkpoint.next_running() else {
                return Ok(None);
            };

            let rows = conn
                .execute(
                    "UPDATE documents SET state = ?1, resume_state = NULL, next_retry_at = NULL, updated_at = ?2 \
                     WHERE id = ?3 AND state = ?4",
                    params![running.as_str(), now.to_rfc3339(), id, state_str],
                )
                .map_err(DatabaseError::Query)?;

            if rows == 0 {
                return Ok(None);
            }
            id
        };

        self.get_document(&claimed_id)
    }

    /// Record a state transition as a compare-and-set on the state column.
    /// Returns false when the document was no longer in `expected` state.
    pub fn record_transition(
        &self,
        document_id: &str,
        expected: ProcessingState,
        next: ProcessingState,
    ) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                params![
                    next.as_str(),
                    Utc::now().to_rfc3339(),
                    document_id,
                    expected.as_str()
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Park a document in `Failed` with retry bookkeeping. `resume` is the
    /// checkpoint the retried stage starts from once `next_retry_at` elapses.
    pub fn record_failure(
        &self,
        document_id: &str,
        expected: ProcessingState,
        resume: ProcessingState,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET state = 'failed', resume_state = ?1, retry_count = ?2, \
                 next_retry_at = ?3, last_error = ?4, updated_at = ?5 \
                 WHERE id = ?6 AND state = ?7",
                params![
                    resume.as_str(),
                    retry_count as i64,
                    next_retry_at.to_rfc3339(),
                    error,
                    Utc::now().to_rfc3339(),
                    document_id,
                    expected.as_str()
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Move a document to `DeadLettered` with the recorded reason.
    pub fn mark_dead_lettered(
        &self,
        document_id: &str,
        expected: ProcessingState,
        reason: &str,
    ) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET state = 'dead_lettered', resume_state = NULL, \
                 next_retry_at = NULL, last_error = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND state = ?4",
                params![
                    reason,
                    Utc::now().to_rfc3339(),
                    document_id,
                    expected.as_str()
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Move a document to `Degraded`: one backend fully written, the other
    /// exhausted its retries. The document stays queryable.
    pub fn mark_degraded(
        &self,
        document_id: &str,
        expected: ProcessingState,
        reason: &str,
    ) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET state = 'degraded', resume_state = NULL, \
                 next_retry_at = NULL, last_error = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND state = ?4",
                params![
                    reason,
                    Utc::now().to_rfc3339(),
                    document_id,
                    expected.as_str()
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Cancel a document from any non-terminal state. In-flight workers
    /// discard their results when the subsequent transition misses.
    pub fn cancel_document(&self, document_id: &str, reason: &str) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET state = 'dead_lettered', resume_state = NULL, \
                 next_retry_at = NULL, last_error = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND state NOT IN ('indexed', 'degraded', 'dead_lettered')",
                params![reason, Utc::now().to_rfc3339(), document_id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Map documents stranded in a running state by a crash back to the
    /// checkpoint the interrupted stage started from. Called once on startup,
    /// before any worker claims.
    pub fn requeue_in_flight(&self) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let mut total = 0;
        for running in [
            ProcessingState::OcrRunning,
            ProcessingState::Chunking,
            ProcessingState::Embedding,
            ProcessingState::Indexing,
        ] {
            let checkpoint = running
                .retry_checkpoint()
                .expect("running states always have a retry checkpoint");
            total += conn
                .execute(
                    "UPDATE documents SET state = ?1, updated_at = ?2 WHERE state = ?3",
                    params![checkpoint.as_str(), now, running.as_str()],
                )
                .map_err(DatabaseError::Query)?;
        }

        Ok(total)
    }

    /// Reset a dead-lettered document to `Queued` for another attempt.
    pub fn reenqueue_document(&self, document_id: &str) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET state = 'queued', resume_state = NULL, retry_count = 0, \
                 next_retry_at = NULL, last_error = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND state = 'dead_lettered'",
                params![Utc::now().to_rfc3339(), document_id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Persist OCR output so `OcrDone` is a durable checkpoint.
    pub fn save_extraction(
        &self,
        document_id: &str,
        extracted: &ExtractedText,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let pages_json =
            serde_json::to_string(extracted).map_err(DatabaseError::Serialization)?;

        conn.execute(
            "INSERT OR REPLACE INTO extractions (document_id, pages, created_at) VALUES (?1, ?2, ?3)",
            params![document_id, pages_json, Utc::now().to_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Load the persisted OCR output for a document.
    pub fn get_extraction(&self, document_id: &str) -> ServiceResult<Option<ExtractedText>> {
        let conn = self.conn.lock().unwrap();

        let pages_json: Option<String> = conn
            .query_row(
                "SELECT pages FROM extractions WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        match pages_json {
            Some(json) => {
                let extracted =
                    serde_json::from_str(&json).map_err(DatabaseError::Serialization)?;
                Ok(Some(extracted))
            }
            None => Ok(None),
        }
    }
}
