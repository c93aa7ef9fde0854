//! Text blocks: runs of lines outside tables and figures.
//!
//! Blocks break at headings and at large vertical gaps. Within a block,
//! every line keeps its gap to the line above (in line heights) so the node
//! builder can recover paragraph boundaries later.

use super::lines::Line;
use crate::model::{BlockKind, Rect, TextLine};
use once_cell::sync::Lazy;
use regex::Regex;

/// A block of lines before it becomes a record.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub kind: BlockKind,
    pub lines: Vec<TextLine>,
    pub bbox: Rect,
}

/// Splits a page's free-standing lines into heading and body blocks.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    /// Lines taller than this multiple of the median are headings. Default: 1.2.
    pub heading_height_ratio: f32,
    /// Longest line, in words, that can be a heading. Default: 12.
    pub max_heading_words: usize,
    /// Vertical gap that ends a block, in line heights. Default: 2.0.
    pub block_gap: f32,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self {
            heading_height_ratio: 1.2,
            max_heading_words: 12,
            block_gap: 2.0,
        }
    }
}

static RE_NUMBERED_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d+)*\.?|[A-Z]\.|(?i:section|part|article|schedule|chapter)\s+[\dIVXA-Z]+[.:]?)\s+\p{Lu}")
        .unwrap()
});

impl TextExtractor {
    /// True when the line reads as a heading.
    pub fn is_heading(&self, line: &Line, line_height: f32) -> bool {
        let text = line.text.trim();
        let words = text.split_whitespace().count();
        if words == 0 || words > self.max_heading_words {
            return false;
        }
        if line.bbox.height() > line_height * self.heading_height_ratio {
            return true;
        }
        if text.ends_with(['.', ',', ';']) {
            return false;
        }
        let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
        let all_caps = letters.len() >= 3 && letters.iter().all(|c| c.is_uppercase());
        all_caps || RE_NUMBERED_HEADING.is_match(text)
    }

    /// Build blocks from `lines`, skipping those flagged in `excluded`.
    pub fn extract(&self, lines: &[Line], excluded: &[bool], line_height: f32) -> Vec<TextBlock> {
        let mut blocks: Vec<TextBlock> = Vec::new();
        let mut prev_bottom: Option<f32> = None;

        for (idx, line) in lines.iter().enumerate() {
            if excluded.get(idx).copied().unwrap_or(false) {
                // text on either side of a table or figure never shares a block
                prev_bottom = None;
                continue;
            }
            let kind = if self.is_heading(line, line_height) {
                BlockKind::Heading
            } else {
                BlockKind::Body
            };
            let gap = prev_bottom
                .map(|b| ((line.bbox.top - b) / line_height).max(0.0))
                .unwrap_or(f32::INFINITY);

            let continues = blocks
                .last()
                .is_some_and(|b| b.kind == kind && gap <= self.block_gap && prev_bottom.is_some());

            let text_line = TextLine {
                text: line.text.clone(),
                bbox: line.bbox,
                gap_before: if continues { gap } else { 0.0 },
            };
            match blocks.last_mut() {
                Some(block) if continues => {
                    block.bbox = block.bbox.union(&line.bbox);
                    block.lines.push(text_line);
                }
                _ => blocks.push(TextBlock {
                    kind,
                    lines: vec![text_line],
                    bbox: line.bbox,
                }),
            }
            prev_bottom = Some(line.bbox.bottom);
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, top: f32, height: f32) -> Line {
        Line {
            text: text.into(),
            bbox: Rect::new(72.0, top, 500.0, top + height),
            spans: Vec::new(),
        }
    }

    #[test]
    fn heading_rules() {
        let x = TextExtractor::default();
        assert!(x.is_heading(&line("GENERAL EXCLUSIONS", 0.0, 10.0), 10.0));
        assert!(x.is_heading(&line("3.2 Waiting Periods", 0.0, 10.0), 10.0));
        assert!(x.is_heading(&line("Section 4 Claims", 0.0, 10.0), 10.0));
        assert!(x.is_heading(&line("Eligibility", 0.0, 14.0), 10.0));
        assert!(!x.is_heading(&line("Eligibility", 0.0, 10.0), 10.0));
        assert!(!x.is_heading(&line("1. The insurer pays.", 0.0, 10.0), 10.0));
    }

    #[test]
    fn blocks_split_on_headings_and_gaps() {
        let lines = vec![
            line("1. Definitions", 100.0, 10.0),
            line("Accident means a sudden", 114.0, 10.0),
            line("unforeseen event.", 126.0, 10.0),
            line("Hospital means a licensed facility.", 140.0, 10.0),
            line("Far away body text.", 200.0, 10.0),
        ];
        let blocks = TextExtractor::default().extract(&lines, &[false; 5], 10.0);
        let kinds: Vec<(BlockKind, usize)> = blocks.iter().map(|b| (b.kind, b.lines.len())).collect();
        assert_eq!(
            kinds,
            vec![(BlockKind::Heading, 1), (BlockKind::Body, 3), (BlockKind::Body, 1)]
        );
        let body = &blocks[1];
        assert_eq!(body.lines[0].gap_before, 0.0);
        assert!((body.lines[1].gap_before - 0.2).abs() < 1e-4);
        assert!((body.lines[2].gap_before - 0.4).abs() < 1e-4);
        assert_eq!(body.bbox.top, 114.0);
        assert_eq!(body.bbox.bottom, 150.0);
    }

    #[test]
    fn excluded_lines_break_blocks() {
        let lines = vec![
            line("Before the table.", 100.0, 10.0),
            line("Plan A $100", 114.0, 10.0),
            line("After the table.", 128.0, 10.0),
        ];
        let blocks = TextExtractor::default().extract(&lines, &[false, true, false], 10.0);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].lines[0].text, "After the table.");
    }
}
