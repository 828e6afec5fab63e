//! Ledger schema migrations.
//!
//! This module contains all schema setup for the job ledger. Migrations are
//! idempotent and run on every open.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all ledger migrations.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Document ledger rows: one per document, holding the state machine
        -- value, retry bookkeeping, and the next-eligible-retry timestamp.
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            blob_ref TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued',
            resume_state TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_documents_state ON documents(state);
        CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(content_hash);

        -- Extracted text per document, persisted so OcrDone is a durable
        -- checkpoint and chunking can resume without re-running OCR.
        CREATE TABLE IF NOT EXISTS extractions (
            document_id TEXT PRIMARY KEY,
            pages TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Chunks with per-backend write status. The (document_id, ordinal)
        -- uniqueness makes re-chunking after a crash a no-op.
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            page_number INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            content TEXT NOT NULL,
            vector_status TEXT NOT NULL DEFAULT 'pending',
            fulltext_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(document_id, ordinal),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

        -- Chunk embeddings, stored so the indexing stage can retry without
        -- re-embedding. f32 little-endian blobs.
        CREATE TABLE IF NOT EXISTS chunk_embeddings (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        );
    "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    Ok(())
}
