//! Filesystem blob store and content hashing.
//!
//! Raw document bytes are stored once on enqueue and read back only by the
//! OCR stage. Blob references are paths relative to the store root so the
//! data directory can be relocated.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::{ProcessingError, ServiceResult};

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the store under `<data_dir>/blobs`, creating it if needed.
    pub fn open(data_dir: &std::path::Path) -> ServiceResult<Self> {
        let root = data_dir.join("blobs");
        std::fs::create_dir_all(&root).map_err(ProcessingError::Io)?;
        Ok(Self { root })
    }

    /// Store document bytes, returning the blob reference.
    pub fn put(&self, document_id: &str, filename: &str, content: &[u8]) -> ServiceResult<String> {
        let blob_ref = format!("{}_{}", document_id, sanitize_filename(filename));
        std::fs::write(self.root.join(&blob_ref), content).map_err(ProcessingError::Io)?;
        Ok(blob_ref)
    }

    /// Read document bytes back by blob reference.
    pub fn get(&self, blob_ref: &str) -> ServiceResult<Vec<u8>> {
        std::fs::read(self.root.join(blob_ref))
            .map_err(ProcessingError::Io)
            .map_err(Into::into)
    }
}

/// Compute SHA-256 hash of a byte slice, returning a hex string.
/// Used for upload duplicate detection.
pub fn compute_content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Sanitize a string for use as a filename
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let blob_ref = store.put("doc-1", "ruling 42.pdf", b"%PDF-1.7").unwrap();
        assert_eq!(blob_ref, "doc-1_ruling_42.pdf");
        assert_eq!(store.get(&blob_ref).unwrap(), b"%PDF-1.7");
    }

    #[test]
    fn missing_blob_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        assert!(store.get("doc-9_gone.pdf").is_err());
    }

    #[test]
    fn content_hash_matches_known_digest() {
        // SHA-256 of "hello world"
        assert_eq!(
            compute_content_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_filename("a/b\\c:d.pdf"), "a_b_c_d.pdf");
        assert_eq!(sanitize_filename("  spaced name.pdf"), "spaced_name.pdf");
    }
}
