//! Records that flow between stages.
//!
//! ```text
//! extract ──▶ RawRecord ──▶ enrich ──▶ EnrichedRecord ──▶ build_nodes ──▶ Node
//!                  └──────────────(text records)─────────────────┘
//! ```
//!
//! Every type here is plain data with serde derives; each stage persists its
//! output through [`crate::store::StageStore`] so a later run can resume.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ── Geometry ─────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in page points, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left: left.min(right),
            top: top.min(bottom),
            right: left.max(right),
            bottom: top.max(bottom),
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn center_y(&self) -> f32 {
        (self.top + self.bottom) / 2.0
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Union of a non-empty set of rectangles.
    pub fn union_all<'a>(rects: impl IntoIterator<Item = &'a Rect>) -> Option<Rect> {
        rects.into_iter().fold(None, |acc, r| match acc {
            None => Some(*r),
            Some(a) => Some(a.union(r)),
        })
    }

    /// True when `self` lies inside `outer`, with `slack` points of tolerance.
    pub fn within(&self, outer: &Rect, slack: f32) -> bool {
        self.left >= outer.left - slack
            && self.right <= outer.right + slack
            && self.top >= outer.top - slack
            && self.bottom <= outer.bottom + slack
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }
}

/// Coordinate convention for [`Coordinates::points`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSystem {
    /// PDF points (1/72 inch), origin top-left, y grows downwards.
    #[default]
    PointSpaceTopLeft,
}

/// Location of a record or node on its source page.
///
/// Points are the four corners of the bounding box, clockwise from the
/// top-left, so a viewer can draw a highlight without knowing the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub page: u32,
    pub points: Vec<(f32, f32)>,
    pub system: CoordinateSystem,
    pub layout_width: f32,
    pub layout_height: f32,
}

impl Coordinates {
    pub fn from_rect(page: u32, rect: Rect, layout_width: f32, layout_height: f32) -> Self {
        Self {
            page,
            points: vec![
                (rect.left, rect.top),
                (rect.right, rect.top),
                (rect.right, rect.bottom),
                (rect.left, rect.bottom),
            ],
            system: CoordinateSystem::PointSpaceTopLeft,
            layout_width,
            layout_height,
        }
    }

    /// Bounding rectangle of the stored points.
    pub fn rect(&self) -> Rect {
        let mut r = Rect {
            left: f32::MAX,
            top: f32::MAX,
            right: f32::MIN,
            bottom: f32::MIN,
        };
        for &(x, y) in &self.points {
            r.left = r.left.min(x);
            r.right = r.right.max(x);
            r.top = r.top.min(y);
            r.bottom = r.bottom.max(y);
        }
        if self.points.is_empty() {
            Rect::default()
        } else {
            r
        }
    }

    /// Bounding union of several coordinates on the same page.
    pub fn union(&self, other: &Coordinates) -> Coordinates {
        Coordinates::from_rect(
            self.page,
            self.rect().union(&other.rect()),
            self.layout_width,
            self.layout_height,
        )
    }
}

// ── Raw records ──────────────────────────────────────────────────────────

/// Kind of content a raw record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Table,
    Text,
    Image,
}

impl RecordKind {
    /// Directory name used for persisted partitions.
    pub fn dir_name(&self) -> &'static str {
        match self {
            RecordKind::Table => "tables",
            RecordKind::Text => "text",
            RecordKind::Image => "images",
        }
    }
}

/// Whether a text block is a heading or body text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Heading,
    Body,
}

/// One visual line inside a text block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub bbox: Rect,
    /// Vertical gap above this line, in multiples of the page's median line
    /// height. Zero for the first line of a block.
    pub gap_before: f32,
}

/// Payload of a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordContent {
    /// A detected table. `header` is the first table row; `rows` are the
    /// data rows below it, empty rows already removed.
    Table {
        header: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    /// A contiguous block of text.
    Text {
        block: BlockKind,
        lines: Vec<TextLine>,
    },
    /// A figure, stored as PNG relative to the document's output directory.
    /// `caption` is the text line directly below the figure, when one exists.
    Image {
        image_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

/// Unit emitted by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: RecordKind,
    pub page: u32,
    /// Order of this record among records of the same kind on its page.
    pub index: u32,
    pub coordinates: Coordinates,
    pub content: RecordContent,
}

impl RawRecord {
    /// Stable key used for resume bookkeeping and progress events.
    pub fn key(&self) -> String {
        format!("{}:p{}:{}", self.kind.dir_name(), self.page, self.index)
    }

    /// Plain text of a text record, lines joined by newlines.
    pub fn text(&self) -> Option<String> {
        match &self.content {
            RecordContent::Text { lines, .. } => Some(
                lines
                    .iter()
                    .map(|l| l.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    }
}

// ── Enriched records ─────────────────────────────────────────────────────

/// Outcome of a model-generated description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// Description produced by the generation backend.
    Ok,
    /// Retries exhausted; description is the deterministic fallback.
    Failed,
    /// Generation disabled for this run; description is the fallback.
    Skipped,
}

/// A raw record plus its model-generated description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub record: RawRecord,
    pub title: String,
    pub generated_description: String,
    pub enrichment_status: EnrichmentStatus,
    /// Column headers after enrichment; tables only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

// ── Nodes ────────────────────────────────────────────────────────────────

/// Granularity of a retrievable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    TableFull,
    TableRow,
    Section,
    Paragraph,
    Sentence,
    Image,
}

impl NodeType {
    pub const ALL: [NodeType; 6] = [
        NodeType::TableFull,
        NodeType::TableRow,
        NodeType::Section,
        NodeType::Paragraph,
        NodeType::Sentence,
        NodeType::Image,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::TableFull => "table_full",
            NodeType::TableRow => "table_row",
            NodeType::Section => "section",
            NodeType::Paragraph => "paragraph",
            NodeType::Sentence => "sentence",
            NodeType::Image => "image",
        }
    }

    /// Vector-store namespace holding nodes of this type.
    pub fn namespace(&self) -> &'static str {
        match self {
            NodeType::TableFull => "table_full",
            NodeType::TableRow => "table_rows",
            NodeType::Section => "sections",
            NodeType::Paragraph => "paragraphs",
            NodeType::Sentence => "sentences",
            NodeType::Image => "images",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.namespace() == s)
            .ok_or_else(|| format!("unknown node type '{s}'"))
    }
}

/// Position of a node within its page, as a path of ordinals
/// (e.g. section 1, paragraph 0, sentence 2 => `[1, 0, 2]`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodePosition(pub Vec<u32>);

impl fmt::Display for NodePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Build a node id from its identity components.
///
/// The id is a pure function of its inputs, so rebuilding nodes from the same
/// document yields the same ids and re-indexing overwrites instead of
/// duplicating.
pub fn node_id(document_id: &str, node_type: NodeType, page: u32, position: &NodePosition) -> String {
    format!("{document_id}::{node_type}::p{page}::{position}")
}

/// Free-form, type-specific metadata carried by a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub document_id: String,
    pub source_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_status: Option<EnrichmentStatus>,
}

/// A retrievable unit of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub text: String,
    pub page: u32,
    pub position: NodePosition,
    pub coordinates: Coordinates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: NodeMetadata,
}

impl Node {
    /// Document order: page, then top edge on the page, then the coarser
    /// granularity, then position. Sentences and rows share their parent's
    /// box, so they land right after it.
    pub fn document_order(&self, other: &Node) -> Ordering {
        self.page
            .cmp(&other.page)
            .then_with(|| self.coordinates.rect().top.total_cmp(&other.coordinates.rect().top))
            .then_with(|| self.node_type.cmp(&other.node_type))
            .then_with(|| self.position.cmp(&other.position))
    }
}

/// Sort nodes into document order.
pub fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(Node::document_order);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_union_and_within() {
        let a = Rect::new(10.0, 10.0, 50.0, 20.0);
        let b = Rect::new(30.0, 25.0, 80.0, 40.0);
        let u = a.union(&b);
        assert_eq!(u, Rect::new(10.0, 10.0, 80.0, 40.0));
        assert!(a.within(&u, 0.0));
        assert!(!u.within(&a, 0.5));
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn coordinates_roundtrip_rect() {
        let r = Rect::new(72.0, 100.0, 300.0, 140.0);
        let c = Coordinates::from_rect(3, r, 612.0, 792.0);
        assert_eq!(c.points.len(), 4);
        assert_eq!(c.rect(), r);
        assert_eq!(c.page, 3);
    }

    #[test]
    fn node_ids_are_deterministic() {
        let pos = NodePosition(vec![1, 0, 2]);
        let a = node_id("policy-ab12cd34", NodeType::Sentence, 3, &pos);
        let b = node_id("policy-ab12cd34", NodeType::Sentence, 3, &pos);
        assert_eq!(a, b);
        assert_eq!(a, "policy-ab12cd34::sentence::p3::1.0.2");
        assert_ne!(a, node_id("policy-ab12cd34", NodeType::Paragraph, 3, &pos));
    }

    fn node_at(node_type: NodeType, top: f32, position: Vec<u32>) -> Node {
        let position = NodePosition(position);
        Node {
            id: node_id("doc", node_type, 2, &position),
            node_type,
            text: String::new(),
            page: 2,
            position,
            coordinates: Coordinates::from_rect(2, Rect::new(72.0, top, 500.0, top + 20.0), 612.0, 792.0),
            parent_id: None,
            embedding: None,
            metadata: NodeMetadata::default(),
        }
    }

    #[test]
    fn prose_above_a_table_sorts_first() {
        let mut nodes = vec![
            node_at(NodeType::TableRow, 300.0, vec![0, 1]),
            node_at(NodeType::TableFull, 300.0, vec![0]),
            node_at(NodeType::Sentence, 100.0, vec![0, 0, 0]),
            node_at(NodeType::TableRow, 300.0, vec![0, 0]),
            node_at(NodeType::Paragraph, 100.0, vec![0, 0]),
            node_at(NodeType::Paragraph, 500.0, vec![0, 1]),
        ];
        sort_nodes(&mut nodes);
        let order: Vec<(NodeType, f32)> = nodes.iter().map(|n| (n.node_type, n.coordinates.rect().top)).collect();
        assert_eq!(
            order,
            vec![
                (NodeType::Paragraph, 100.0),
                (NodeType::Sentence, 100.0),
                (NodeType::TableFull, 300.0),
                (NodeType::TableRow, 300.0),
                (NodeType::TableRow, 300.0),
                (NodeType::Paragraph, 500.0),
            ]
        );
        assert_eq!(nodes[3].position.0, vec![0, 0]);
    }

    #[test]
    fn node_type_parses_namespace_and_name() {
        assert_eq!("table_rows".parse::<NodeType>().unwrap(), NodeType::TableRow);
        assert_eq!("table_row".parse::<NodeType>().unwrap(), NodeType::TableRow);
        assert!("chapters".parse::<NodeType>().is_err());
    }

    #[test]
    fn record_content_tagged_json() {
        let content = RecordContent::Table {
            header: vec!["Plan".into(), "Limit".into()],
            rows: vec![vec!["A".into(), "$100".into()]],
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "table");
    }
}
