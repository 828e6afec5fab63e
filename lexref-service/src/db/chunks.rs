//! Chunk ledger operations: inserts, embedding blobs, and per-backend write
//! status tracking used for idempotent resumption.

use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{Chunk, IndexBackend, IndexWriteStatus};
use crate::error::{DatabaseError, ServiceResult};

const CHUNK_COLUMNS: &str = "id, document_id, ordinal, page_number, start_offset, end_offset, \
     content, vector_status, fulltext_status, created_at";

/// Status column for a backend. Only ever interpolated from these two
/// constants, never from input.
fn status_column(backend: IndexBackend) -> &'static str {
    match backend {
        IndexBackend::Vector => "vector_status",
        IndexBackend::FullText => "fulltext_status",
    }
}

impl Database {
    /// Insert chunks for a document. Re-running after a partial insert is a
    /// no-op for ordinals already present.
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        for chunk in chunks {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO chunks (id, document_id, ordinal, page_number, start_offset, end_offset, content, vector_status, fulltext_status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    chunk.id,
                    chunk.document_id,
                    chunk.ordinal,
                    chunk.page_number,
                    chunk.start_offset,
                    chunk.end_offset,
                    chunk.content,
                    chunk.vector_status.as_str(),
                    chunk.fulltext_status.as_str(),
                    chunk.created_at.to_rfc3339(),
                ],
            )
            .map_err(DatabaseError::Query)?;
        }

        Ok(())
    }

    /// Get a chunk by ID
    pub fn get_chunk(&self, chunk_id: &str) -> ServiceResult<Option<Chunk>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"),
            params![chunk_id],
            Chunk::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Get all chunks for a document in ordinal order.
    pub fn get_chunks(&self, document_id: &str) -> ServiceResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ?1 ORDER BY ordinal"
            ))
            .map_err(DatabaseError::Query)?;

        let chunks = stmt
            .query_map(params![document_id], Chunk::from_row)
            .map_err(DatabaseError::Query)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(chunks)
    }

    /// Get count of chunks for a document
    pub fn chunk_count(&self, document_id: &str) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;
        Ok(count as usize)
    }

    /// Chunks for a document that don't have embeddings yet, in ordinal order.
    /// Used for resumable embedding generation.
    pub fn get_chunks_without_embeddings(&self, document_id: &str) -> ServiceResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks c \
                 WHERE c.document_id = ?1 \
                   AND NOT EXISTS (SELECT 1 FROM chunk_embeddings e WHERE e.chunk_id = c.id) \
                 ORDER BY c.ordinal"
            ))
            .map_err(DatabaseError::Query)?;

        let chunks = stmt
            .query_map(params![document_id], Chunk::from_row)
            .map_err(DatabaseError::Query)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(chunks)
    }

    /// Store a chunk embedding as an f32 little-endian blob.
    pub fn insert_embedding(&self, chunk_id: &str, embedding: &[f32]) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let embedding_bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();

        conn.execute(
            "INSERT OR REPLACE INTO chunk_embeddings (chunk_id, embedding) VALUES (?1, ?2)",
            params![chunk_id, embedding_bytes],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Load a chunk embedding.
    pub fn get_embedding(&self, chunk_id: &str) -> ServiceResult<Option<Vec<f32>>> {
        let conn = self.conn.lock().unwrap();

        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM chunk_embeddings WHERE chunk_id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        Ok(blob.map(|bytes| {
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        }))
    }

    /// Chunks not yet `Written` for the given backend, in ordinal order.
    /// Checked before invoking a writer so completed writes are never re-sent.
    pub fn get_chunks_pending_index(
        &self,
        document_id: &str,
        backend: IndexBackend,
    ) -> ServiceResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks \
                 WHERE document_id = ?1 AND {} != 'written' ORDER BY ordinal",
                status_column(backend)
            ))
            .map_err(DatabaseError::Query)?;

        let chunks = stmt
            .query_map(params![document_id], Chunk::from_row)
            .map_err(DatabaseError::Query)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(chunks)
    }

    /// Count of chunks not yet `Written` for the given backend.
    pub fn unwritten_count(
        &self,
        document_id: &str,
        backend: IndexBackend,
    ) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM chunks WHERE document_id = ?1 AND {} != 'written'",
                    status_column(backend)
                ),
                params![document_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        Ok(count as usize)
    }

    /// Record the outcome of an index write for one chunk and backend.
    pub fn mark_chunk_status(
        &self,
        chunk_id: &str,
        backend: IndexBackend,
        status: IndexWriteStatus,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            &format!(
                "UPDATE chunks SET {} = ?1 WHERE id = ?2",
                status_column(backend)
            ),
            params![status.as_str(), chunk_id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }
}
