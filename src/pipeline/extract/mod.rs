//! Extract stage: page layouts → raw table, text and image records.
//!
//! Deterministic and model-free. Per page:
//!
//! 1. group spans into lines ([`lines`])
//! 2. detect tables; their lines are consumed ([`table`])
//! 3. place figures; lines printed on top of a figure are consumed and the
//!    first line just below it becomes the caption
//! 4. split what is left into heading and body blocks ([`text`])
//!
//! Partitions are written per page, tables and images first and text last,
//! so the text partition marks a page as done for a resumed run. A page
//! that fails contributes zero records and an [`ItemError::Extraction`].

pub mod lines;
pub mod table;
pub mod text;

use crate::config::{PageSelection, Stage};
use crate::error::{ItemError, PipelineError};
use crate::model::{Coordinates, RawRecord, RecordContent, RecordKind};
use crate::pipeline::encode::encode_png;
use crate::pipeline::layout::{LayoutSource, PageLayout};
use crate::pipeline::StageContext;
use crate::report::{ItemOutcome, StageReport};
use crate::store::{partition, StageStore};
use lines::{group_lines, median_line_height, Line};
use std::path::Path;
use std::time::Instant;
use table::TableExtractor;
use text::TextExtractor;
use tracing::{debug, info};

pub use table::DetectedTable;
pub use text::TextBlock;

/// A figure record plus the PNG it points at.
#[derive(Debug, Clone)]
pub struct Figure {
    pub record: RawRecord,
    pub png: Vec<u8>,
}

/// Records extracted from one page.
#[derive(Debug, Clone, Default)]
pub struct PageRecords {
    pub tables: Vec<RawRecord>,
    pub text: Vec<RawRecord>,
    pub figures: Vec<Figure>,
}

/// Both extractors with their tuning.
#[derive(Debug, Clone, Default)]
pub struct Extractors {
    pub tables: TableExtractor,
    pub text: TextExtractor,
}

fn caption_below(lines: &[Line], figure: &crate::model::Rect, line_height: f32) -> Option<usize> {
    lines.iter().position(|l| {
        let below = l.bbox.top >= figure.bottom - 2.0 && l.bbox.top <= figure.bottom + line_height * 2.5;
        let horizontal = l.bbox.left < figure.right && figure.left < l.bbox.right;
        below && horizontal
    })
}

impl Extractors {
    /// Extract every record on one page.
    pub fn extract_page(&self, layout: &PageLayout) -> Result<PageRecords, ItemError> {
        let page = layout.page;
        let coords = |rect| Coordinates::from_rect(page, rect, layout.width, layout.height);
        let lines = group_lines(&layout.spans);
        let line_height = median_line_height(&lines);
        let mut consumed = vec![false; lines.len()];

        let mut out = PageRecords::default();

        for (index, table) in self.tables.detect(&lines, line_height).into_iter().enumerate() {
            for &l in &table.lines {
                consumed[l] = true;
            }
            out.tables.push(RawRecord {
                kind: RecordKind::Table,
                page,
                index: index as u32,
                coordinates: coords(table.bbox),
                content: RecordContent::Table {
                    header: table.header,
                    rows: table.rows,
                },
            });
        }

        let mut images: Vec<_> = layout.images.iter().collect();
        images.sort_by(|a, b| a.bbox.top.total_cmp(&b.bbox.top).then(a.bbox.left.total_cmp(&b.bbox.left)));
        for (index, image) in images.into_iter().enumerate() {
            for (i, line) in lines.iter().enumerate() {
                let (cx, cy) = ((line.bbox.left + line.bbox.right) / 2.0, line.bbox.center_y());
                let inside = (image.bbox.left..=image.bbox.right).contains(&cx)
                    && (image.bbox.top..=image.bbox.bottom).contains(&cy);
                if inside {
                    consumed[i] = true;
                }
            }
            let caption = caption_below(&lines, &image.bbox, line_height)
                .filter(|&i| !consumed[i])
                .map(|i| lines[i].text.clone());
            let png = encode_png(&image.image).map_err(|e| ItemError::Extraction {
                page,
                detail: format!("figure {index}: {e}"),
            })?;
            out.figures.push(Figure {
                record: RawRecord {
                    kind: RecordKind::Image,
                    page,
                    index: index as u32,
                    coordinates: coords(image.bbox),
                    content: RecordContent::Image {
                        image_path: StageStore::figure_path(page, index as u32),
                        caption,
                    },
                },
                png,
            });
        }

        for (index, block) in self.text.extract(&lines, &consumed, line_height).into_iter().enumerate() {
            out.text.push(RawRecord {
                kind: RecordKind::Text,
                page,
                index: index as u32,
                coordinates: coords(block.bbox),
                content: RecordContent::Text {
                    block: block.kind,
                    lines: block.lines,
                },
            });
        }

        debug!(
            "Page {}: {} tables, {} text blocks, {} figures",
            page,
            out.tables.len(),
            out.text.len(),
            out.figures.len()
        );
        Ok(out)
    }
}

async fn persist_page(store: &StageStore, page: u32, records: &PageRecords) -> Result<(), PipelineError> {
    for figure in &records.figures {
        if let RecordContent::Image { image_path, .. } = &figure.record.content {
            store.write_bytes(image_path, &figure.png).await?;
        }
    }
    let images: Vec<RawRecord> = records.figures.iter().map(|f| f.record.clone()).collect();
    store.write_raw(RecordKind::Image, page, &images).await?;
    store.write_raw(RecordKind::Table, page, &records.tables).await?;
    store.write_raw(RecordKind::Text, page, &records.text).await
}

/// Run the extract stage over the selected pages of `pdf`.
pub async fn run(
    ctx: &StageContext,
    source: &dyn LayoutSource,
    extractors: &Extractors,
    pdf: &Path,
    pages: &PageSelection,
    password: Option<&str>,
) -> Result<StageReport, PipelineError> {
    let start = Instant::now();
    let mut report = StageReport::new(Stage::Extract);
    let layout = source.load(pdf, pages, password).await?;
    ctx.progress.on_stage_start(Stage::Extract, layout.pages.len());

    for page_layout in layout.pages {
        let page = match &page_layout {
            Ok(l) => l.page,
            Err(ItemError::Extraction { page, .. }) => *page,
            Err(_) => 0,
        };
        let item = format!("page {page}");

        if ctx.store.exists(partition("raw", RecordKind::Text.dir_name(), page)) {
            report.record_skip();
            continue;
        }
        if ctx.is_cancelled() {
            let cancelled = ItemError::Cancelled { item: item.clone() };
            ctx.settle(Stage::Extract, &mut report, &ItemOutcome::<()>::failed(&item, cancelled));
            continue;
        }

        let outcome = match page_layout.and_then(|l| extractors.extract_page(&l)) {
            Ok(records) => {
                persist_page(&ctx.store, page, &records).await?;
                report.add_produced("table", records.tables.len());
                report.add_produced("text", records.text.len());
                report.add_produced("image", records.figures.len());
                ItemOutcome::ok(&item, ())
            }
            Err(e) => ItemOutcome::failed(&item, e),
        };
        ctx.settle(Stage::Extract, &mut report, &outcome);
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Extracted {} pages ({} failed, {} skipped) in {}ms",
        report.succeeded, report.failed, report.skipped, report.duration_ms
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockKind, Rect};
    use crate::pipeline::layout::{PageImage, TextSpan};
    use image::{DynamicImage, Rgba, RgbaImage};

    fn span(text: &str, left: f32, top: f32) -> TextSpan {
        TextSpan {
            text: text.into(),
            bbox: Rect::new(left, top, left + 6.0 * text.len() as f32, top + 10.0),
        }
    }

    fn layout() -> PageLayout {
        PageLayout {
            page: 2,
            width: 612.0,
            height: 792.0,
            spans: vec![
                span("SCHEDULE OF BENEFITS", 72.0, 80.0),
                span("Benefit", 72.0, 110.0),
                span("Limit", 300.0, 110.0),
                span("Room", 72.0, 124.0),
                span("$200", 300.0, 124.0),
                span("Surgery", 72.0, 138.0),
                span("$5,000", 300.0, 138.0),
                span("Axis label", 120.0, 250.0),
                span("Figure 1: Claims flow", 72.0, 405.0),
                span("Claims are paid within 30 days.", 72.0, 450.0),
            ],
            images: vec![PageImage {
                bbox: Rect::new(72.0, 200.0, 400.0, 400.0),
                image: DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]))),
            }],
        }
    }

    #[test]
    fn page_yields_tables_text_and_figures() {
        let records = Extractors::default().extract_page(&layout()).unwrap();
        assert_eq!(records.tables.len(), 1);
        assert_eq!(records.figures.len(), 1);

        match &records.figures[0].record.content {
            RecordContent::Image { image_path, caption } => {
                assert_eq!(image_path, "images/figures/p0002-00.png");
                assert_eq!(caption.as_deref(), Some("Figure 1: Claims flow"));
            }
            other => panic!("unexpected content {other:?}"),
        }

        let texts: Vec<String> = records.text.iter().filter_map(|r| r.text()).collect();
        assert!(texts.iter().all(|t| !t.contains("Axis label")));
        assert!(texts.iter().all(|t| !t.contains("$5,000")));
        assert!(matches!(
            records.text[0].content,
            RecordContent::Text {
                block: BlockKind::Heading,
                ..
            }
        ));
        for r in records.tables.iter().chain(&records.text) {
            assert_eq!(r.coordinates.page, 2);
            assert_eq!(r.coordinates.layout_width, 612.0);
        }
    }

    #[tokio::test]
    async fn persisted_page_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::pipeline::testing::context(dir.path());
        let records = Extractors::default().extract_page(&layout()).unwrap();
        persist_page(&ctx.store, 2, &records).await.unwrap();
        assert!(ctx.store.exists("images/figures/p0002-00.png"));
        assert_eq!(ctx.store.read_raw(RecordKind::Table).await.unwrap(), records.tables);
        assert_eq!(ctx.store.read_raw(RecordKind::Image).await.unwrap().len(), 1);
    }
}
