//! Cancellation token management for in-flight document processing.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::service::IngestService;

impl IngestService {
    /// Register a cancellation token for a document being processed.
    pub(crate) fn register_processing_token(&self, document_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.processing_cancellation_tokens
            .insert(document_id.to_string(), token.clone());
        token
    }

    /// Signal the in-flight worker for a document, if any.
    pub(crate) fn cancel_processing_token(&self, document_id: &str) -> bool {
        if let Some((_, token)) = self.processing_cancellation_tokens.remove(document_id) {
            token.cancel();
            info!(doc_id = %document_id, "Processing cancellation triggered");
            true
        } else {
            false
        }
    }

    /// Remove a cancellation token when processing completes normally.
    pub(crate) fn unregister_processing_token(&self, document_id: &str) {
        self.processing_cancellation_tokens.remove(document_id);
    }
}
