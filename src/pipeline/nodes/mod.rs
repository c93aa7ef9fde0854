//! Build-nodes stage: records → retrievable nodes at every granularity.
//!
//! Pure and deterministic: the same persisted records always produce the
//! same nodes with the same ids, so the stage is simply rebuilt instead of
//! resumed. Pages are processed in order because a page's leading text
//! inherits the last section title of the page before it.
//!
//! | Source            | Nodes                                  |
//! |-------------------|----------------------------------------|
//! | text records      | `section` → `paragraph` → `sentence`   |
//! | enriched tables   | `table_full` → `table_row`             |
//! | enriched images   | `image`                                |

pub mod segment;
pub mod table;
pub mod text;

use crate::config::Stage;
use crate::error::PipelineError;
use crate::model::{
    node_id, sort_nodes, EnrichedRecord, Node, NodeMetadata, NodePosition, NodeType, RawRecord, RecordContent, RecordKind,
};
use crate::pipeline::StageContext;
use crate::report::{ItemOutcome, StageReport};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

pub use table::TableNodeBuilder;
pub use text::TextNodeBuilder;

/// Identity shared by every node of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub document_id: String,
    pub source_file: String,
}

impl DocumentInfo {
    pub fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            document_id: self.document_id.clone(),
            source_file: self.source_file.clone(),
            ..NodeMetadata::default()
        }
    }

    pub fn node_id(&self, node_type: NodeType, page: u32, position: &NodePosition) -> String {
        node_id(&self.document_id, node_type, page, position)
    }
}

/// Inputs for one page.
#[derive(Debug, Clone, Default)]
pub struct PageInputs {
    pub text: Vec<RawRecord>,
    pub tables: Vec<EnrichedRecord>,
    pub images: Vec<EnrichedRecord>,
}

/// Both builders with their tuning.
#[derive(Debug, Clone, Default)]
pub struct NodeBuilders {
    pub tables: TableNodeBuilder,
    pub text: TextNodeBuilder,
}

/// The `image` node for an enriched figure: `"<title>: <description>"`.
pub fn image_node(doc: &DocumentInfo, enriched: &EnrichedRecord) -> Node {
    let record = &enriched.record;
    let image_path = match &record.content {
        RecordContent::Image { image_path, .. } => Some(image_path.clone()),
        _ => None,
    };
    let position = NodePosition(vec![record.index]);
    Node {
        id: doc.node_id(NodeType::Image, record.page, &position),
        node_type: NodeType::Image,
        text: format!("{}: {}", enriched.title.trim(), enriched.generated_description.trim()),
        page: record.page,
        position,
        coordinates: record.coordinates.clone(),
        parent_id: None,
        embedding: None,
        metadata: NodeMetadata {
            image_path,
            enrichment_status: Some(enriched.enrichment_status),
            ..doc.metadata()
        },
    }
}

impl NodeBuilders {
    /// Build every node of one page, in document order. Returns the nodes
    /// and the section title to carry into the next page.
    pub fn build_page(
        &self,
        doc: &DocumentInfo,
        page: u32,
        inputs: &PageInputs,
        inherited_title: Option<String>,
    ) -> (Vec<Node>, Option<String>) {
        let mut text_records = inputs.text.clone();
        text_records.sort_by_key(|r| r.index);
        let built = self.text.build(doc, page, &text_records, inherited_title);

        let mut nodes = built.nodes;
        for table in &inputs.tables {
            nodes.extend(self.tables.build(doc, table));
        }
        nodes.extend(inputs.images.iter().map(|image| image_node(doc, image)));
        sort_nodes(&mut nodes);
        (nodes, built.last_title)
    }
}

async fn page_inputs(ctx: &StageContext) -> Result<BTreeMap<u32, PageInputs>, PipelineError> {
    let mut pages: BTreeMap<u32, PageInputs> = BTreeMap::new();
    for record in ctx.store.read_raw(RecordKind::Text).await? {
        pages.entry(record.page).or_default().text.push(record);
    }
    for record in ctx.store.read_enriched(RecordKind::Table).await? {
        pages.entry(record.record.page).or_default().tables.push(record);
    }
    for record in ctx.store.read_enriched(RecordKind::Image).await? {
        pages.entry(record.record.page).or_default().images.push(record);
    }
    Ok(pages)
}

/// Run the build-nodes stage over everything extract and enrich persisted.
pub async fn run(ctx: &StageContext, builders: &NodeBuilders) -> Result<StageReport, PipelineError> {
    let start = Instant::now();
    let mut report = StageReport::new(Stage::BuildNodes);
    let pages = page_inputs(ctx).await?;
    ctx.progress.on_stage_start(Stage::BuildNodes, pages.len());

    let doc = DocumentInfo {
        document_id: ctx.document_id.clone(),
        source_file: ctx.source_file.clone(),
    };
    let mut title: Option<String> = None;
    for (page, inputs) in &pages {
        let (nodes, last_title) = builders.build_page(&doc, *page, inputs, title.take());
        title = last_title;

        let mut by_type: BTreeMap<NodeType, Vec<Node>> = BTreeMap::new();
        for node in nodes {
            by_type.entry(node.node_type).or_default().push(node);
        }
        for (node_type, nodes) in &by_type {
            ctx.store.write_nodes(*node_type, *page, nodes).await?;
            report.add_produced(node_type.as_str(), nodes.len());
        }
        debug!("Page {}: {} node types written", page, by_type.len());
        ctx.settle(Stage::BuildNodes, &mut report, &ItemOutcome::ok(format!("page {page}"), ()));
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Built {} nodes from {} pages in {}ms",
        report.produced.values().sum::<usize>(),
        report.succeeded,
        report.duration_ms
    );
    Ok(report)
}

/// Every persisted node of the document, in document order.
pub async fn load_all(ctx: &StageContext) -> Result<Vec<Node>, PipelineError> {
    let mut nodes = Vec::new();
    for node_type in NodeType::ALL {
        nodes.extend(ctx.store.read_nodes(node_type).await?);
    }
    sort_nodes(&mut nodes);
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockKind, Coordinates, EnrichmentStatus, Rect, TextLine};

    fn text_record(page: u32, index: u32, block: BlockKind, text: &str, top: f32) -> RawRecord {
        let bbox = Rect::new(72.0, top, 500.0, top + 10.0);
        RawRecord {
            kind: RecordKind::Text,
            page,
            index,
            coordinates: Coordinates::from_rect(page, bbox, 612.0, 792.0),
            content: RecordContent::Text {
                block,
                lines: vec![TextLine {
                    text: text.into(),
                    bbox,
                    gap_before: 0.0,
                }],
            },
        }
    }

    fn image(page: u32) -> EnrichedRecord {
        EnrichedRecord {
            record: RawRecord {
                kind: RecordKind::Image,
                page,
                index: 0,
                coordinates: Coordinates::from_rect(page, Rect::new(72.0, 300.0, 300.0, 500.0), 612.0, 792.0),
                content: RecordContent::Image {
                    image_path: "images/figures/p0002-00.png".into(),
                    caption: None,
                },
            },
            title: "Claims flow".into(),
            generated_description: "Three steps from notice to payment.".into(),
            enrichment_status: EnrichmentStatus::Ok,
            column_headers: Vec::new(),
            error_detail: None,
        }
    }

    #[test]
    fn image_node_text_and_path() {
        let doc = DocumentInfo {
            document_id: "doc".into(),
            source_file: "doc.pdf".into(),
        };
        let node = image_node(&doc, &image(2));
        assert_eq!(node.text, "Claims flow: Three steps from notice to payment.");
        assert_eq!(node.metadata.image_path.as_deref(), Some("images/figures/p0002-00.png"));
        assert_eq!(node.id, "doc::image::p2::0");
    }

    #[tokio::test]
    async fn stage_carries_section_title_across_pages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::pipeline::testing::context(dir.path());
        ctx.store
            .write_raw(
                RecordKind::Text,
                1,
                &[
                    text_record(1, 0, BlockKind::Heading, "EXCLUSIONS", 80.0),
                    text_record(1, 1, BlockKind::Body, "War is excluded.", 100.0),
                ],
            )
            .await
            .unwrap();
        ctx.store
            .write_raw(
                RecordKind::Text,
                2,
                &[text_record(2, 0, BlockKind::Body, "Self-inflicted injury is excluded.", 80.0)],
            )
            .await
            .unwrap();
        ctx.store.write_enriched(RecordKind::Image, 2, &[image(2)]).await.unwrap();

        let report = run(&ctx, &NodeBuilders::default()).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.produced["image"], 1);

        let sections = ctx.store.read_nodes(NodeType::Section).await.unwrap();
        let page2 = sections.iter().find(|n| n.page == 2).unwrap();
        assert_eq!(page2.metadata.section_title.as_deref(), Some("EXCLUSIONS"));

        let all = load_all(&ctx).await.unwrap();
        let pages: Vec<u32> = all.iter().map(|n| n.page).collect();
        assert!(pages.windows(2).all(|w| w[0] <= w[1]));
        assert!(all.iter().all(|n| n.coordinates.page == n.page));
    }
}
