//! Enriched tables → one `table_full` node plus one `table_row` node per row.

use super::DocumentInfo;
use crate::model::{EnrichedRecord, Node, NodeMetadata, NodePosition, NodeType, RecordContent};
use crate::pipeline::enrich::table::column_headers;
use crate::pipeline::normalize::{collapse_whitespace, markdown_table};

#[derive(Debug, Clone, Default)]
pub struct TableNodeBuilder;

impl TableNodeBuilder {
    /// Text of the `table_full` node: title, caption, then the GFM table.
    /// The caption is left out when it is the table itself (the fallback).
    pub fn full_text(title: &str, description: &str, markdown: &str) -> String {
        let description = description.trim();
        if description.is_empty() || description == markdown.trim() {
            format!("## {title}\n\n{markdown}")
        } else {
            format!("## {title}\n\n{description}\n\n{markdown}")
        }
    }

    /// Text of one `table_row` node: `"<title> | <header>: <cell> | ..."`.
    /// Blank cells are left out.
    pub fn row_text(title: &str, headers: &[String], row: &[String]) -> String {
        let mut parts = vec![title.to_string()];
        for (i, cell) in row.iter().enumerate() {
            let cell = collapse_whitespace(cell);
            if cell.is_empty() {
                continue;
            }
            let header = headers.get(i).cloned().unwrap_or_else(|| format!("Column_{}", i + 1));
            parts.push(format!("{header}: {cell}"));
        }
        parts.join(" | ")
    }

    /// Build the nodes for one enriched table. Non-table records yield nothing.
    pub fn build(&self, doc: &DocumentInfo, enriched: &EnrichedRecord) -> Vec<Node> {
        let record = &enriched.record;
        let RecordContent::Table { header, rows } = &record.content else {
            return Vec::new();
        };
        let headers = if enriched.column_headers.is_empty() {
            column_headers(header)
        } else {
            enriched.column_headers.clone()
        };
        let title = enriched.title.trim();
        let markdown = markdown_table(&headers, rows);

        let metadata = NodeMetadata {
            table_title: Some(title.to_string()),
            column_headers: headers.clone(),
            enrichment_status: Some(enriched.enrichment_status),
            ..doc.metadata()
        };

        let table_pos = NodePosition(vec![record.index]);
        let table_id = doc.node_id(NodeType::TableFull, record.page, &table_pos);
        let mut nodes = Vec::with_capacity(rows.len() + 1);
        nodes.push(Node {
            id: table_id.clone(),
            node_type: NodeType::TableFull,
            text: Self::full_text(title, &enriched.generated_description, &markdown),
            page: record.page,
            position: table_pos,
            coordinates: record.coordinates.clone(),
            parent_id: None,
            embedding: None,
            metadata: metadata.clone(),
        });

        for (r, row) in rows.iter().enumerate() {
            let pos = NodePosition(vec![record.index, r as u32]);
            nodes.push(Node {
                id: doc.node_id(NodeType::TableRow, record.page, &pos),
                node_type: NodeType::TableRow,
                text: Self::row_text(title, &headers, row),
                page: record.page,
                position: pos,
                coordinates: record.coordinates.clone(),
                parent_id: Some(table_id.clone()),
                embedding: None,
                metadata: NodeMetadata {
                    row_index: Some(r as u32),
                    ..metadata.clone()
                },
            });
        }
        nodes
    }
}
