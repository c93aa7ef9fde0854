//! Table detection from column-aligned lines.
//!
//! A table is a run of consecutive lines that each split into two or more
//! cells whose left edges fall on the column anchors set by the first line
//! of the run (the header). A single-cell line that starts inside a later
//! column continues the previous row's cell, which is how wrapped cell text
//! comes out of most policy schedules.

use super::lines::{split_cells, Cell, Line};
use crate::model::Rect;

/// A detected table before it becomes a record.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedTable {
    pub header: Vec<String>,
    /// Data rows with empty rows removed.
    pub rows: Vec<Vec<String>>,
    pub bbox: Rect,
    /// Indices (into the page's lines) consumed by the table.
    pub lines: Vec<usize>,
}

/// Detects tables on one page.
#[derive(Debug, Clone)]
pub struct TableExtractor {
    /// Data rows required below the header. Default: 2.
    pub min_data_rows: usize,
    /// Columns required in the header. Default: 2.
    pub min_columns: usize,
    /// Horizontal gap separating cells, in line heights. Default: 1.2.
    pub cell_gap: f32,
    /// Largest vertical gap between rows, in line heights. Default: 2.5.
    pub max_row_gap: f32,
}

impl Default for TableExtractor {
    fn default() -> Self {
        Self {
            min_data_rows: 2,
            min_columns: 2,
            cell_gap: 1.2,
            max_row_gap: 2.5,
        }
    }
}

/// Column whose anchor is the last one at or left of `x`.
fn column_of(anchors: &[f32], x: f32, tol: f32) -> usize {
    anchors.iter().rposition(|a| *a <= x + tol).unwrap_or(0)
}

/// Place cells into columns; `None` when two cells land in one column or
/// the order is not left to right.
fn assign(cells: &[Cell], anchors: &[f32], tol: f32) -> Option<Vec<String>> {
    let mut row = vec![String::new(); anchors.len()];
    let mut last: Option<usize> = None;
    for cell in cells {
        let col = column_of(anchors, cell.left, tol);
        if last.is_some_and(|l| col <= l) {
            return None;
        }
        row[col] = cell.text.clone();
        last = Some(col);
    }
    Some(row)
}

fn append_cell(row: &mut [String], col: usize, text: &str) {
    let cell = &mut row[col];
    if !cell.is_empty() {
        cell.push(' ');
    }
    cell.push_str(text);
}

impl TableExtractor {
    /// Find tables among a page's lines, top to bottom.
    pub fn detect(&self, lines: &[Line], line_height: f32) -> Vec<DetectedTable> {
        let gap = (line_height * self.cell_gap).max(6.0);
        let tol = (line_height * 0.6).max(3.0);
        let cells: Vec<Vec<Cell>> = lines.iter().map(|l| split_cells(l, gap)).collect();

        let mut tables = Vec::new();
        let mut i = 0;
        while i < lines.len() {
            if cells[i].len() < self.min_columns {
                i += 1;
                continue;
            }
            let anchors: Vec<f32> = cells[i].iter().map(|c| c.left).collect();
            let Some(header) = assign(&cells[i], &anchors, tol) else {
                i += 1;
                continue;
            };

            let mut grid = vec![header];
            let mut members = vec![i];
            let mut last = i;
            let mut j = i + 1;
            while j < lines.len() {
                let vgap = lines[j].bbox.top - lines[last].bbox.bottom;
                if vgap > line_height * self.max_row_gap {
                    break;
                }
                let row_cells = &cells[j];
                if row_cells.len() >= 2 {
                    match assign(row_cells, &anchors, tol) {
                        Some(row) => grid.push(row),
                        None => break,
                    }
                } else if let [only] = row_cells.as_slice() {
                    let col = column_of(&anchors, only.left, tol);
                    if col == 0 {
                        break;
                    }
                    if let Some(prev) = grid.last_mut() {
                        append_cell(prev, col, &only.text);
                    }
                } else {
                    break;
                }
                members.push(j);
                last = j;
                j += 1;
            }

            let header = grid.remove(0);
            let rows: Vec<Vec<String>> = grid
                .into_iter()
                .filter(|r| r.iter().any(|c| !c.trim().is_empty()))
                .collect();

            if rows.len() >= self.min_data_rows {
                let bbox = Rect::union_all(members.iter().map(|&m| &lines[m].bbox)).unwrap_or_default();
                tables.push(DetectedTable {
                    header,
                    rows,
                    bbox,
                    lines: members,
                });
                i = j;
            } else {
                i += 1;
            }
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::lines::group_lines;
    use crate::pipeline::layout::TextSpan;

    fn row(y: f32, cells: &[(&str, f32)]) -> Vec<TextSpan> {
        cells
            .iter()
            .map(|(t, x)| TextSpan {
                text: t.to_string(),
                bbox: Rect::new(*x, y, x + 6.0 * t.len() as f32, y + 10.0),
            })
            .collect()
    }

    fn page(rows: Vec<Vec<TextSpan>>) -> Vec<Line> {
        group_lines(&rows.into_iter().flatten().collect::<Vec<_>>())
    }

    #[test]
    fn detects_header_and_rows() {
        let lines = page(vec![
            row(100.0, &[("Benefits under the plan are listed below.", 72.0)]),
            row(130.0, &[("Benefit", 72.0), ("Plan A", 250.0), ("Plan B", 380.0)]),
            row(144.0, &[("Room", 72.0), ("$200", 250.0), ("$300", 380.0)]),
            row(158.0, &[("Surgery", 72.0), ("$5,000", 250.0), ("$8,000", 380.0)]),
            row(172.0, &[("per day", 250.0)]),
            row(200.0, &[("Claims must be filed within 30 days.", 72.0)]),
        ]);
        let tables = TableExtractor::default().detect(&lines, 10.0);
        assert_eq!(tables.len(), 1);
        let t = &tables[0];
        assert_eq!(t.header, vec!["Benefit", "Plan A", "Plan B"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[1], vec!["Surgery", "$5,000 per day", "$8,000"]);
        assert_eq!(t.lines, vec![1, 2, 3, 4]);
        assert_eq!(t.bbox.top, 130.0);
    }

    #[test]
    fn prose_is_not_a_table() {
        let lines = page(vec![
            row(100.0, &[("The insurer will pay the benefit.", 72.0)]),
            row(114.0, &[("Exclusions apply as stated.", 72.0)]),
        ]);
        assert!(TableExtractor::default().detect(&lines, 10.0).is_empty());
    }

    #[test]
    fn header_with_single_row_is_rejected() {
        let lines = page(vec![
            row(100.0, &[("Plan", 72.0), ("Limit", 250.0)]),
            row(114.0, &[("A", 72.0), ("$100", 250.0)]),
        ]);
        assert!(TableExtractor::default().detect(&lines, 10.0).is_empty());
    }

    #[test]
    fn large_vertical_gap_ends_table() {
        let lines = page(vec![
            row(100.0, &[("Plan", 72.0), ("Limit", 250.0)]),
            row(114.0, &[("A", 72.0), ("$100", 250.0)]),
            row(128.0, &[("B", 72.0), ("$200", 250.0)]),
            row(300.0, &[("C", 72.0), ("$300", 250.0)]),
        ]);
        let tables = TableExtractor::default().detect(&lines, 10.0);
        assert_eq!(tables[0].rows.len(), 2);
    }
}
