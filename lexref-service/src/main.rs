use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use lexref_service::blob::BlobStore;
use lexref_service::config;
use lexref_service::db::Database;
use lexref_service::embedding::{EmbeddingGenerator, OpenAiEmbeddingClient};
use lexref_service::index::{FullTextIndexWriter, IndexWriter, VectorIndexWriter};
use lexref_service::intake;
use lexref_service::ocr::{OcrClient, TextExtractor};
use lexref_service::service::IngestService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        "Starting lexref ingestion service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(config::load()?);
    std::fs::create_dir_all(&config.storage.data_dir)?;

    // Initialize the job ledger
    let db_path = config.storage.data_dir.join("lexref.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Ledger initialized");

    let blobs = Arc::new(BlobStore::open(&config.storage.data_dir)?);

    // Stage collaborators
    let extractor: Arc<dyn TextExtractor> = Arc::new(OcrClient::new(&config.ocr)?);
    let embedder: Arc<dyn EmbeddingGenerator> =
        Arc::new(OpenAiEmbeddingClient::new(&config.embeddings)?);

    let vector_index = Arc::new(VectorIndexWriter::new(&config.vector_index)?);
    vector_index
        .ensure_collection(config.embeddings.dimension)
        .await?;
    info!(
        url = %config.vector_index.base_url,
        collection = %config.vector_index.collection,
        "Vector index ready"
    );

    let fulltext_index = Arc::new(FullTextIndexWriter::new(&config.fulltext_index)?);
    fulltext_index.ensure_index().await?;
    info!(
        url = %config.fulltext_index.base_url,
        index = %config.fulltext_index.index,
        "Full-text index ready"
    );

    // Documents stranded mid-stage by a previous run become claimable again.
    let requeued = db.requeue_in_flight()?;
    if requeued > 0 {
        info!(count = requeued, "Requeued in-flight documents from previous run");
    }

    let vector_index: Arc<dyn IndexWriter> = vector_index;
    let fulltext_index: Arc<dyn IndexWriter> = fulltext_index;
    let service = Arc::new(IngestService::new(
        config.clone(),
        db,
        blobs,
        extractor,
        embedder,
        vector_index,
        fulltext_index,
    ));

    let shutdown = CancellationToken::new();
    let mut workers = IngestService::start_ingest_workers(service.clone(), shutdown.clone());

    if let Some(intake_dir) = &config.storage.intake_dir {
        workers.push(intake::start_intake_worker(
            service.clone(),
            intake_dir.clone(),
            shutdown.clone(),
        ));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping workers");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lexref_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
