//! Background worker pool for document ingestion.
//!
//! Each worker runs an independent claim/advance loop; contention between
//! workers is scoped to individual ledger row updates, so there is no global
//! lock over the pipeline.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::service::IngestService;

impl IngestService {
    /// Start the ingestion worker pool. Called once on startup, after stale
    /// claims from a previous run have been requeued.
    pub fn start_ingest_workers(
        service: Arc<IngestService>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..service.config.pipeline.worker_count.max(1))
            .map(|worker| {
                let service = service.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(service, worker, shutdown).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(service: Arc<IngestService>, worker: usize, shutdown: CancellationToken) {
    info!(worker, "Ingestion worker started");
    let poll_interval = service.config.pipeline.poll_interval();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match service.db.claim_next(Utc::now()) {
            Ok(Some(doc)) => {
                info!(worker, doc_id = %doc.id, state = %doc.state.as_str(), "Claimed document");
                service.process_document(&doc).await;
            }
            Ok(None) => {
                // No eligible work, sleep before checking again
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            Err(e) => {
                error!(worker, error = %e, "Failed to claim next document");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    info!(worker, "Ingestion worker stopped");
}
