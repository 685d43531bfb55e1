//! Page splitting: decompose PDF bytes into one raster image per page.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations, preventing the Tokio worker
//! threads from stalling during CPU-heavy rendering.
//!
//! ## All or nothing
//!
//! A split either returns every page or an error. A page that fails to
//! render fails the whole document: a silent gap would shift every later
//! page's content under the wrong `page_index`.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Scanned pages are sometimes saved at poster size. `max_rendered_pixels`
//! caps the longest edge regardless of physical size, keeping the median
//! filter and Sauvola window cost bounded per page.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{PageImage, SourceDocument};
use crate::pipeline::input::validate_payload;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Anything that can turn a document into its ordered page images.
///
/// Implementations must return pages `0..N` in order, or an error; never a
/// partial sequence.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn split(&self, doc: &SourceDocument) -> Result<Vec<PageImage>, PipelineError>;
}

/// [`PageSource`] backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumSplitter {
    dpi: u32,
    max_pixels: u32,
    lib_path: Option<PathBuf>,
}

impl PdfiumSplitter {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
            lib_path: config.pdfium_lib_path.clone(),
        }
    }

    /// Bind to pdfium once to surface a missing library at startup rather
    /// than on the first upload.
    pub fn check_binding(&self) -> Result<(), PipelineError> {
        bind_pdfium(self.lib_path.as_deref()).map(|_| ())
    }
}

#[async_trait]
impl PageSource for PdfiumSplitter {
    async fn split(&self, doc: &SourceDocument) -> Result<Vec<PageImage>, PipelineError> {
        validate_payload(doc.bytes())?;

        let bytes = doc.shared_bytes();
        let dpi = self.dpi;
        let max_pixels = self.max_pixels;
        let lib_path = self.lib_path.clone();

        tokio::task::spawn_blocking(move || {
            split_blocking(&bytes, dpi, max_pixels, lib_path.as_deref())
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Split task panicked: {}", e)))?
    }
}

fn bind_pdfium(lib_path: Option<&Path>) -> Result<Pdfium, PipelineError> {
    let bindings = match lib_path {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

/// Blocking implementation of page splitting.
fn split_blocking(
    bytes: &[u8],
    dpi: u32,
    max_pixels: u32,
    lib_path: Option<&Path>,
) -> Result<Vec<PageImage>, PipelineError> {
    let pdfium = bind_pdfium(lib_path)?;

    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| PipelineError::InvalidDocument {
            detail: format!("{:?}", e),
        })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if total_pages == 0 {
        return Err(PipelineError::EmptyDocument);
    }
    info!("PDF loaded: {} pages", total_pages);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(total_pages);

    for idx in 0..total_pages {
        let render_failed = |e: PdfiumError| PipelineError::InvalidDocument {
            detail: format!("page {} could not be rendered: {:?}", idx, e),
        };

        let page = pages.get(idx as u16).map_err(render_failed)?;
        let bitmap = page.render_with_config(&render_config).map_err(render_failed)?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx,
            image.width(),
            image.height()
        );

        results.push(PageImage {
            page_index: idx,
            image,
        });
    }

    Ok(results)
}
