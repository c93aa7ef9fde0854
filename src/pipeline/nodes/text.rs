//! Text records → section, paragraph and sentence nodes.
//!
//! A page's text records arrive in reading order. Each heading record opens
//! a section; its text is the section's first paragraph so nothing on the
//! page is lost from the hierarchy. Body text before the first heading joins
//! an untitled section that inherits the title of the last heading on the
//! previous page.
//!
//! Paragraphs break inside a body block on a vertical gap or a first-line
//! indent. Sentences share their paragraph's coordinates: sub-line geometry
//! is not recoverable from extracted text.

use super::segment::split_sentences;
use super::DocumentInfo;
use crate::model::{
    BlockKind, Coordinates, Node, NodeMetadata, NodePosition, NodeType, RawRecord, Rect, RecordContent, TextLine,
};
use crate::pipeline::normalize::join_lines;

/// Splits text records into the three text granularities.
#[derive(Debug, Clone)]
pub struct TextNodeBuilder {
    /// Gap above a line, in line heights, that starts a new paragraph. Default: 0.8.
    pub paragraph_gap: f32,
    /// Extra left offset, in points, that marks a first-line indent. Default: 8.
    pub indent: f32,
}

impl Default for TextNodeBuilder {
    fn default() -> Self {
        Self {
            paragraph_gap: 0.8,
            indent: 8.0,
        }
    }
}

struct ParagraphDraft {
    text: String,
    rect: Rect,
}

struct SectionDraft {
    title: Option<String>,
    paragraphs: Vec<ParagraphDraft>,
}

/// Nodes built from one page of text, plus the title to carry forward.
#[derive(Debug, Clone, Default)]
pub struct TextNodes {
    pub nodes: Vec<Node>,
    pub last_title: Option<String>,
}

impl TextNodeBuilder {
    /// Group a body block's lines into paragraphs.
    pub fn paragraphs<'a>(&self, lines: &'a [TextLine]) -> Vec<Vec<&'a TextLine>> {
        let block_left = lines.iter().map(|l| l.bbox.left).fold(f32::INFINITY, f32::min);
        let mut out: Vec<Vec<&TextLine>> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let indented = line.bbox.left - block_left > self.indent;
            let prev_flush = i > 0 && lines[i - 1].bbox.left - block_left <= self.indent / 2.0;
            let starts_new = i == 0 || line.gap_before > self.paragraph_gap || (indented && prev_flush);
            match out.last_mut() {
                Some(current) if !starts_new => current.push(line),
                _ => out.push(vec![line]),
            }
        }
        out
    }

    fn draft(line_group: &[&TextLine]) -> Option<ParagraphDraft> {
        let text = join_lines(&line_group.iter().map(|l| l.text.as_str()).collect::<Vec<_>>());
        if text.is_empty() {
            return None;
        }
        let rect = Rect::union_all(line_group.iter().map(|l| &l.bbox))?;
        Some(ParagraphDraft { text, rect })
    }

    /// Build text nodes for one page. `records` must be the page's text
    /// records in index order.
    pub fn build(
        &self,
        doc: &DocumentInfo,
        page: u32,
        records: &[RawRecord],
        inherited_title: Option<String>,
    ) -> TextNodes {
        let mut sections: Vec<SectionDraft> = Vec::new();
        let mut layout = (0.0f32, 0.0f32);

        for record in records {
            let RecordContent::Text { block, lines } = &record.content else {
                continue;
            };
            layout = (record.coordinates.layout_width, record.coordinates.layout_height);
            match block {
                BlockKind::Heading => {
                    let refs: Vec<&TextLine> = lines.iter().collect();
                    if let Some(heading) = Self::draft(&refs) {
                        sections.push(SectionDraft {
                            title: Some(heading.text.clone()),
                            paragraphs: vec![heading],
                        });
                    }
                }
                BlockKind::Body => {
                    let drafts: Vec<ParagraphDraft> = self
                        .paragraphs(lines)
                        .iter()
                        .filter_map(|group| Self::draft(group))
                        .collect();
                    if drafts.is_empty() {
                        continue;
                    }
                    if sections.is_empty() {
                        sections.push(SectionDraft {
                            title: inherited_title.clone(),
                            paragraphs: Vec::new(),
                        });
                    }
                    if let Some(section) = sections.last_mut() {
                        section.paragraphs.extend(drafts);
                    }
                }
            }
        }

        let last_title = sections
            .iter()
            .rev()
            .find_map(|s| s.title.clone())
            .or(inherited_title);

        let coords = |rect: Rect| Coordinates::from_rect(page, rect, layout.0, layout.1);
        let mut nodes = Vec::new();
        for (s, section) in sections.iter().enumerate() {
            let Some(section_rect) = Rect::union_all(section.paragraphs.iter().map(|p| &p.rect)) else {
                continue;
            };
            let metadata = NodeMetadata {
                section_title: section.title.clone(),
                ..doc.metadata()
            };
            let section_pos = NodePosition(vec![s as u32]);
            let section_id = doc.node_id(NodeType::Section, page, &section_pos);
            nodes.push(Node {
                id: section_id.clone(),
                node_type: NodeType::Section,
                text: section
                    .paragraphs
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
                page,
                position: section_pos,
                coordinates: coords(section_rect),
                parent_id: None,
                embedding: None,
                metadata: metadata.clone(),
            });

            for (p, paragraph) in section.paragraphs.iter().enumerate() {
                let paragraph_pos = NodePosition(vec![s as u32, p as u32]);
                let paragraph_id = doc.node_id(NodeType::Paragraph, page, &paragraph_pos);
                let paragraph_coords = coords(paragraph.rect);
                nodes.push(Node {
                    id: paragraph_id.clone(),
                    node_type: NodeType::Paragraph,
                    text: paragraph.text.clone(),
                    page,
                    position: paragraph_pos,
                    coordinates: paragraph_coords.clone(),
                    parent_id: Some(section_id.clone()),
                    embedding: None,
                    metadata: metadata.clone(),
                });

                for (k, sentence) in split_sentences(&paragraph.text).into_iter().enumerate() {
                    let pos = NodePosition(vec![s as u32, p as u32, k as u32]);
                    nodes.push(Node {
                        id: doc.node_id(NodeType::Sentence, page, &pos),
                        node_type: NodeType::Sentence,
                        text: sentence,
                        page,
                        position: pos,
                        coordinates: paragraph_coords.clone(),
                        parent_id: Some(paragraph_id.clone()),
                        embedding: None,
                        metadata: metadata.clone(),
                    });
                }
            }
        }

        TextNodes { nodes, last_title }
    }
}
