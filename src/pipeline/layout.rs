//! Page layout: positioned text spans and embedded images, read via pdfium.
//!
//! Extractors never talk to pdfium directly. They consume [`PageLayout`]s
//! produced by a [`LayoutSource`]; the default source is
//! [`PdfiumLayoutSource`], and tests inject fixture layouts instead.
//!
//! pdfium wraps a C++ library with thread-local state, so every call runs
//! inside `tokio::task::spawn_blocking` with its own `Pdfium` instance.
//!
//! All geometry is converted to PDF points with a top-left origin (y grows
//! downwards) before leaving this module.

use crate::config::PageSelection;
use crate::error::{ItemError, PipelineError};
use crate::model::Rect;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Images smaller than this on either side (points) are treated as
/// decoration and dropped.
const MIN_FIGURE_SIDE: f32 = 16.0;

/// A run of text sharing one baseline and font.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub bbox: Rect,
}

/// A raster image placed on the page.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub bbox: Rect,
    pub image: DynamicImage,
}

/// Everything the extractors need from one page.
#[derive(Debug, Clone)]
pub struct PageLayout {
    /// 1-based page number.
    pub page: u32,
    pub width: f32,
    pub height: f32,
    /// Spans in content-stream order.
    pub spans: Vec<TextSpan>,
    pub images: Vec<PageImage>,
}

/// Layout of the selected pages. A page that could not be read is an
/// `Err` entry; the other pages are unaffected.
#[derive(Debug)]
pub struct DocumentLayout {
    pub page_count: usize,
    pub pages: Vec<Result<PageLayout, ItemError>>,
}

/// Source of page layouts.
#[async_trait]
pub trait LayoutSource: Send + Sync {
    /// Read the selected pages of `pdf`. Only document-level failures
    /// (unreadable file, wrong password) are `Err`.
    async fn load(
        &self,
        pdf: &Path,
        pages: &PageSelection,
        password: Option<&str>,
    ) -> Result<DocumentLayout, PipelineError>;
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Bind pdfium: `PDFIUM_LIB_PATH` (a library file or the directory holding
/// it) first, then the system library search path.
pub fn bind_pdfium() -> Result<Pdfium, PipelineError> {
    if let Ok(configured) = std::env::var("PDFIUM_LIB_PATH") {
        let path = PathBuf::from(&configured);
        let lib = if path.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(&path)
        } else {
            path
        };
        let bindings = Pdfium::bind_to_library(&lib)
            .map_err(|e| PipelineError::PdfiumUnavailable(format!("{}: {e:?}", lib.display())))?;
        return Ok(Pdfium::new(bindings));
    }
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| PipelineError::PdfiumUnavailable(format!("{e:?}")))
}

fn open_error(path: &Path, password: Option<&str>, e: PdfiumError) -> PipelineError {
    let detail = format!("{e:?}");
    if detail.to_lowercase().contains("password") {
        if password.is_some() {
            PipelineError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            PipelineError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        PipelineError::CorruptPdf {
            path: path.to_path_buf(),
            detail,
        }
    }
}

/// Reads layouts with pdfium.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumLayoutSource;

#[async_trait]
impl LayoutSource for PdfiumLayoutSource {
    async fn load(
        &self,
        pdf: &Path,
        pages: &PageSelection,
        password: Option<&str>,
    ) -> Result<DocumentLayout, PipelineError> {
        let path = pdf.to_path_buf();
        let selection = pages.clone();
        let password = password.map(str::to_string);

        tokio::task::spawn_blocking(move || load_blocking(&path, &selection, password.as_deref()))
            .await
            .map_err(|e| PipelineError::Internal(format!("Layout task panicked: {e}")))?
    }
}

fn load_blocking(
    path: &Path,
    selection: &PageSelection,
    password: Option<&str>,
) -> Result<DocumentLayout, PipelineError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, password)
        .map_err(|e| open_error(path, password, e))?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    let indices = selection.to_indices(page_count);
    info!("PDF loaded: {} pages, {} selected", page_count, indices.len());

    let mut out = Vec::with_capacity(indices.len());
    for idx in indices {
        let page_no = idx as u32 + 1;
        let layout = pages
            .get(idx as u16)
            .map_err(|e| format!("{e:?}"))
            .and_then(|page| read_page(&page, page_no));
        match layout {
            Ok(layout) => {
                debug!(
                    "Page {}: {} spans, {} images",
                    page_no,
                    layout.spans.len(),
                    layout.images.len()
                );
                out.push(Ok(layout));
            }
            Err(detail) => {
                warn!("Page {} could not be read: {}", page_no, detail);
                out.push(Err(ItemError::Extraction {
                    page: page_no,
                    detail,
                }));
            }
        }
    }

    Ok(DocumentLayout {
        page_count,
        pages: out,
    })
}

/// Convert a pdfium rectangle (bottom-left origin) to a top-left [`Rect`].
fn to_top_left(rect: &PdfRect, page_height: f32) -> Rect {
    Rect::new(
        rect.left().value,
        page_height - rect.top().value,
        rect.right().value,
        page_height - rect.bottom().value,
    )
}

fn read_page(page: &PdfPage, page_no: u32) -> Result<PageLayout, String> {
    let width = page.width().value;
    let height = page.height().value;
    if width <= 0.0 || height <= 0.0 {
        return Err(format!("degenerate page size {width}x{height}"));
    }

    let text = page.text().map_err(|e| format!("text layer: {e:?}"))?;
    let spans = text
        .segments()
        .iter()
        .filter_map(|segment| {
            let content = segment.text();
            if content.trim().is_empty() {
                return None;
            }
            Some(TextSpan {
                text: content,
                bbox: to_top_left(&segment.bounds(), height),
            })
        })
        .collect();

    let mut images = Vec::new();
    for object in page.objects().iter() {
        let Some(image_object) = object.as_image_object() else {
            continue;
        };
        let bbox = match object.bounds() {
            Ok(quad) => to_top_left(&quad.to_rect(), height),
            Err(e) => {
                debug!("Page {}: image without bounds skipped: {:?}", page_no, e);
                continue;
            }
        };
        if bbox.width() < MIN_FIGURE_SIDE || bbox.height() < MIN_FIGURE_SIDE {
            continue;
        }
        match image_object.get_raw_image() {
            Ok(image) => images.push(PageImage { bbox, image }),
            Err(e) => debug!("Page {}: image data unreadable: {:?}", page_no, e),
        }
    }

    Ok(PageLayout {
        page: page_no,
        width,
        height,
        spans,
        images,
    })
}

// ── Metadata ─────────────────────────────────────────────────────────────

/// Document-level metadata, read without any model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

/// Read document metadata from a PDF.
pub async fn extract_metadata(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, PipelineError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(str::to_string);

    tokio::task::spawn_blocking(move || extract_metadata_blocking(&path, pwd.as_deref()))
        .await
        .map_err(|e| PipelineError::Internal(format!("Metadata task panicked: {e}")))?
}

fn extract_metadata_blocking(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, PipelineError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| open_error(pdf_path, password, e))?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata
            .get(tag)
            .map(|t| t.value().to_string())
            .filter(|v| !v.is_empty())
    };

    Ok(DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        creation_date: get_meta(PdfDocumentMetadataTagType::CreationDate),
        modification_date: get_meta(PdfDocumentMetadataTagType::ModificationDate),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdfium_rect_flips_to_top_left() {
        let rect = PdfRect::new_from_values(700.0, 72.0, 720.0, 300.0);
        let r = to_top_left(&rect, 792.0);
        assert_eq!(r.left, 72.0);
        assert_eq!(r.right, 300.0);
        assert_eq!(r.top, 72.0);
        assert_eq!(r.bottom, 92.0);
    }

    #[test]
    fn password_errors_are_classified() {
        let path = Path::new("x.pdf");
        let e = open_error(path, None, PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError));
        assert!(matches!(e, PipelineError::PasswordRequired { .. }));
        let e = open_error(
            path,
            Some("pw"),
            PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError),
        );
        assert!(matches!(e, PipelineError::WrongPassword { .. }));
        let e = open_error(path, None, PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::FormatError));
        assert!(matches!(e, PipelineError::CorruptPdf { .. }));
    }
}
