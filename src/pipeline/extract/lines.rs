//! Group positioned spans into visual lines and split lines into cells.

use crate::model::Rect;
use crate::pipeline::layout::TextSpan;
use crate::pipeline::normalize::clean_text;

/// Fallback line height (points) for pages with no measurable text.
const DEFAULT_LINE_HEIGHT: f32 = 10.0;

/// One visual line: spans sharing a vertical band, left to right.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub text: String,
    pub bbox: Rect,
    pub spans: Vec<TextSpan>,
}

/// A horizontally separated run of spans inside a line.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub text: String,
    pub left: f32,
    pub right: f32,
}

fn vertical_overlap(a: &Rect, b: &Rect) -> f32 {
    (a.bottom.min(b.bottom) - a.top.max(b.top)).max(0.0)
}

/// Join spans left to right, inserting a space where the glyphs do not touch.
fn join_spans(spans: &[TextSpan]) -> String {
    let mut out = String::new();
    let mut prev_right: Option<f32> = None;
    for span in spans {
        let text = clean_text(&span.text);
        if text.is_empty() {
            continue;
        }
        if let Some(right) = prev_right {
            let touching = span.bbox.left - right < span.bbox.height() * 0.15;
            if !touching && !out.ends_with(' ') {
                out.push(' ');
            }
        }
        out.push_str(&text);
        prev_right = Some(span.bbox.right);
    }
    out
}

/// Group spans into lines, top to bottom.
///
/// A span joins the current line when it overlaps the line's vertical band
/// by at least half of the smaller height.
pub fn group_lines(spans: &[TextSpan]) -> Vec<Line> {
    let mut sorted: Vec<&TextSpan> = spans.iter().filter(|s| !s.text.trim().is_empty()).collect();
    sorted.sort_by(|a, b| {
        a.bbox
            .center_y()
            .total_cmp(&b.bbox.center_y())
            .then(a.bbox.left.total_cmp(&b.bbox.left))
    });

    let mut groups: Vec<(Rect, Vec<TextSpan>)> = Vec::new();
    for span in sorted {
        if let Some((band, members)) = groups.last_mut() {
            let min_h = band.height().min(span.bbox.height()).max(0.1);
            if vertical_overlap(band, &span.bbox) >= min_h * 0.5 {
                *band = band.union(&span.bbox);
                members.push(span.clone());
                continue;
            }
        }
        groups.push((span.bbox, vec![span.clone()]));
    }

    groups
        .into_iter()
        .filter_map(|(bbox, mut spans)| {
            spans.sort_by(|a, b| a.bbox.left.total_cmp(&b.bbox.left));
            let text = join_spans(&spans);
            (!text.is_empty()).then_some(Line { text, bbox, spans })
        })
        .collect()
}

/// Median line height of a page.
pub fn median_line_height(lines: &[Line]) -> f32 {
    let mut heights: Vec<f32> = lines.iter().map(|l| l.bbox.height()).filter(|h| *h > 0.0).collect();
    if heights.is_empty() {
        return DEFAULT_LINE_HEIGHT;
    }
    heights.sort_by(f32::total_cmp);
    heights[heights.len() / 2]
}

/// Split a line into cells wherever the horizontal gap between adjacent
/// spans exceeds `min_gap` points.
pub fn split_cells(line: &Line, min_gap: f32) -> Vec<Cell> {
    let mut cells: Vec<(Vec<TextSpan>, f32, f32)> = Vec::new();
    for span in &line.spans {
        if let Some((members, _, right)) = cells.last_mut() {
            if span.bbox.left - *right <= min_gap {
                *right = right.max(span.bbox.right);
                members.push(span.clone());
                continue;
            }
        }
        cells.push((vec![span.clone()], span.bbox.left, span.bbox.right));
    }
    cells
        .into_iter()
        .map(|(spans, left, right)| Cell {
            text: join_spans(&spans),
            left,
            right,
        })
        .filter(|c| !c.text.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(text: &str, left: f32, top: f32, right: f32) -> TextSpan {
        TextSpan {
            text: text.into(),
            bbox: Rect::new(left, top, right, top + 10.0),
        }
    }

    #[test]
    fn spans_on_same_band_form_one_line() {
        let spans = vec![
            span("world", 110.0, 101.0, 150.0),
            span("Hello", 72.0, 100.0, 105.0),
            span("Next line", 72.0, 114.0, 140.0),
        ];
        let lines = group_lines(&spans);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Hello world");
        assert_eq!(lines[1].text, "Next line");
        assert_eq!(lines[0].bbox.top, 100.0);
    }

    #[test]
    fn touching_spans_join_without_space() {
        let spans = vec![span("hospi", 72.0, 100.0, 100.0), span("tal", 100.5, 100.0, 115.0)];
        assert_eq!(group_lines(&spans)[0].text, "hospital");
    }

    #[test]
    fn cells_split_on_wide_gaps() {
        let spans = vec![
            span("Plan A", 72.0, 100.0, 110.0),
            span("In-patient", 200.0, 100.0, 250.0),
            span("cover", 253.0, 100.0, 280.0),
            span("$1,000", 400.0, 100.0, 430.0),
        ];
        let line = &group_lines(&spans)[0];
        let cells = split_cells(line, 12.0);
        let texts: Vec<&str> = cells.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["Plan A", "In-patient cover", "$1,000"]);
        assert_eq!(cells[1].left, 200.0);
    }

    #[test]
    fn median_height_defaults_when_empty() {
        assert_eq!(median_line_height(&[]), DEFAULT_LINE_HEIGHT);
    }
}
