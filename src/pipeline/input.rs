//! Input resolution: turn a user-supplied path or URL into a [`SourceDocument`].
//!
//! The pipeline works on bytes end to end: uploads arrive as a body and the
//! queue hands workers a shared `Arc<[u8]>`. The CLI reads the file (or
//! downloads the URL) into memory first. Payload checks run before pdfium is
//! bound, so an empty upload or an HTML error page is invalid input.

use crate::error::PipelineError;
use crate::model::SourceDocument;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const PDF_MAGIC: &[u8] = b"%PDF";

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Reject payloads that cannot possibly be a PDF.
///
/// Empty bytes are [`PipelineError::EmptyPayload`]; anything not starting
/// with `%PDF` is [`PipelineError::NotAPdf`]. Both are invalid input.
pub fn validate_payload(bytes: &[u8]) -> Result<(), PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyPayload);
    }
    if !bytes.starts_with(PDF_MAGIC) {
        let magic = bytes.iter().take(PDF_MAGIC.len()).copied().collect();
        return Err(PipelineError::NotAPdf { magic });
    }
    Ok(())
}

/// Load a local file or download a URL into a [`SourceDocument`].
///
/// The payload is validated with [`validate_payload`] before returning.
pub async fn load_source(input: &str, timeout_secs: u64) -> Result<SourceDocument, PipelineError> {
    let doc = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(Path::new(input)).await?
    };
    validate_payload(doc.bytes())?;
    Ok(doc)
}

async fn read_local(path: &Path) -> Result<SourceDocument, PipelineError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| PipelineError::FileNotFound {
            path: PathBuf::from(path),
        })?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(SourceDocument::new(bytes, filename))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<SourceDocument, PipelineError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| PipelineError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {}s", timeout_secs))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    info!("Downloaded {} bytes", bytes.len());

    Ok(SourceDocument::new(bytes.to_vec(), filename_from_url(url)))
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    (!last.is_empty() && last.contains('.')).then(|| last.to_string())
}
