//! Document ingestion and dual-index synchronization backend for the legal
//! reference platform.
//!
//! An uploaded document moves through a per-document state machine: OCR text
//! extraction, chunking, embedding, and writes into two independently-failing
//! retrieval backends (vector similarity and full-text). The job ledger is
//! the single source of truth for processing state; a pool of workers claims
//! documents with atomic conditional transitions and retries transient
//! failures with exponential backoff. The HTTP layer that fronts this crate
//! lives elsewhere; [`service::IngestService::enqueue_document`] and
//! [`search::SearchService::search`] are its integration points.

pub mod backoff;
pub mod blob;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod intake;
pub mod ocr;
pub mod search;
pub mod service;
