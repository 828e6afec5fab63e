//! Intake directory watcher.
//!
//! Recursively polls a configured directory for new document files and
//! enqueues them for ingestion. Successfully enqueued files are deleted
//! (their bytes now live in the blob store); duplicates are deleted as well;
//! failed files are moved to a `failed/` subdirectory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ProcessingError, ServiceError, ServiceResult};
use crate::service::IngestService;

/// File extensions the OCR service accepts
const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "tif", "tiff", "png", "jpg", "jpeg"];

/// Directory to skip when scanning (case-insensitive)
const FAILED_DIRECTORY: &str = "failed";

/// Interval between directory scans (in seconds)
const POLL_INTERVAL_SECS: u64 = 10;

/// Start the intake worker. Called once on startup when an intake directory
/// is configured.
pub fn start_intake_worker(
    service: Arc<IngestService>,
    intake_dir: PathBuf,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(path = %intake_dir.display(), "Intake worker started");

        if let Err(e) = std::fs::create_dir_all(intake_dir.join(FAILED_DIRECTORY)) {
            error!(error = %e, "Failed to create intake failed directory, worker stopping");
            return;
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match scan_and_process_one(&service, &intake_dir) {
                Ok(Some(filename)) => {
                    info!(file = %filename, "Intake processed file");
                    // Continue immediately to check for more files
                    continue;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Intake scan error");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!("Intake worker stopped");
    })
}

/// Scan the directory and process one file (sorted by path for determinism).
fn scan_and_process_one(
    service: &IngestService,
    intake_dir: &Path,
) -> ServiceResult<Option<String>> {
    let mut files = Vec::new();
    collect_files_recursive(intake_dir, intake_dir, &mut files)
        .map_err(|e| ServiceError::Processing(ProcessingError::Io(e)))?;

    if files.is_empty() {
        return Ok(None);
    }

    files.sort();
    let file_path = &files[0];
    let display_path = file_path
        .strip_prefix(intake_dir)
        .unwrap_or(file_path)
        .display()
        .to_string();

    debug!(file = %display_path, "Processing intake file");

    let filename = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document")
        .to_string();

    let enqueued = std::fs::read(file_path)
        .map_err(|e| ServiceError::Processing(ProcessingError::Io(e)))
        .and_then(|content| service.enqueue_document(&content, &filename));

    match enqueued {
        Ok(document) => {
            debug!(file = %display_path, doc_id = %document.id, "Intake file enqueued");
            if let Err(e) = std::fs::remove_file(file_path) {
                warn!(file = %display_path, error = %e, "Failed to delete enqueued file");
            }
            Ok(Some(display_path))
        }
        Err(e) => {
            error!(file = %display_path, error = %e, "Intake enqueue failed");
            move_to_failed(file_path, intake_dir);
            // Return Ok so the worker continues with the next file
            Ok(Some(display_path))
        }
    }
}

/// Recursively collect supported files, skipping the failed/ directory.
fn collect_files_recursive(
    dir: &Path,
    base_dir: &Path,
    files: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    let entries = std::fs::read_dir(dir)?;

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && path.parent() == Some(base_dir)
                && name.eq_ignore_ascii_case(FAILED_DIRECTORY)
            {
                continue;
            }
            collect_files_recursive(&path, base_dir, files)?;
        } else if path.is_file() && is_supported_format(&path) {
            files.push(path);
        }
    }

    Ok(())
}

/// Move a file to the failed/ directory, preserving its relative path.
fn move_to_failed(file_path: &Path, base_dir: &Path) {
    let relative = file_path.strip_prefix(base_dir).unwrap_or(file_path);
    let dest = base_dir.join(FAILED_DIRECTORY).join(relative);

    if let Some(parent) = dest.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(dest = %parent.display(), error = %e, "Failed to create directory in failed/");
        return;
    }

    if let Err(e) = std::fs::rename(file_path, &dest) {
        warn!(
            file = %file_path.display(),
            dest = %dest.display(),
            error = %e,
            "Failed to move file to failed/"
        );
    }
}

/// Check if a file has a supported extension.
fn is_supported_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_formats_match_the_ocr_service() {
        assert!(is_supported_format(&PathBuf::from("scan.pdf")));
        assert!(is_supported_format(&PathBuf::from("scan.PDF")));
        assert!(is_supported_format(&PathBuf::from("exhibit.tiff")));
        assert!(is_supported_format(&PathBuf::from("exhibit.jpg")));

        assert!(!is_supported_format(&PathBuf::from("notes.docx")));
        assert!(!is_supported_format(&PathBuf::from("notes.txt")));
        assert!(!is_supported_format(&PathBuf::from("scan")));
    }

    #[test]
    fn scan_skips_the_failed_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("failed")).unwrap();
        std::fs::create_dir_all(dir.path().join("batch1")).unwrap();
        std::fs::write(dir.path().join("batch1/a.pdf"), b"a").unwrap();
        std::fs::write(dir.path().join("failed/b.pdf"), b"b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();

        let mut files = Vec::new();
        collect_files_recursive(dir.path(), dir.path(), &mut files).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("batch1/a.pdf"));
    }

    #[test]
    fn failed_files_keep_their_relative_path() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("batch2")).unwrap();
        let src = dir.path().join("batch2/bad.pdf");
        std::fs::write(&src, b"broken").unwrap();

        move_to_failed(&src, dir.path());
        assert!(!src.exists());
        assert!(dir.path().join("failed/batch2/bad.pdf").exists());
    }
}
