//! Deterministic text cleanup for extracted spans, lines and table cells.
//!
//! pdfium hands back text exactly as the content stream encodes it:
//! ligature glyphs, soft hyphens, zero-width joiners, non-breaking spaces,
//! and words split across line ends. Every rule here is a pure
//! `&str -> String` function so each can be tested alone, and so the node
//! builders' containment checks see one canonical whitespace form.
//!
//! ## Rule order
//!
//! Invisible characters go first (a soft hyphen must not survive to look
//! like a line-end hyphen), then ligatures and space variants, then
//! whitespace collapsing.

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean one span or cell: rules 1-3, trimmed.
pub fn clean_text(input: &str) -> String {
    let s = remove_invisible_chars(input);
    let s = expand_ligatures(&s);
    let s = normalise_spaces(&s);
    collapse_whitespace(&s)
}

/// Join the lines of one paragraph into running text, repairing words
/// hyphenated across a line break.
pub fn join_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines {
        let line = clean_text(line.as_ref());
        if line.is_empty() {
            continue;
        }
        if out.is_empty() {
            out.push_str(&line);
        } else if ends_with_split_word(&out) && starts_lowercase(&line) {
            out.pop();
            out.push_str(&line);
        } else {
            out.push(' ');
            out.push_str(&line);
        }
    }
    out
}

// ── Rule 1: Remove invisible Unicode characters ──────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 2: Expand typographic ligatures ─────────────────────────────────

fn expand_ligatures(input: &str) -> String {
    if !input.chars().any(|c| ('\u{FB00}'..='\u{FB06}').contains(&c)) {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len() + 8);
    for c in input.chars() {
        match c {
            '\u{FB00}' => out.push_str("ff"),
            '\u{FB01}' => out.push_str("fi"),
            '\u{FB02}' => out.push_str("fl"),
            '\u{FB03}' => out.push_str("ffi"),
            '\u{FB04}' => out.push_str("ffl"),
            '\u{FB05}' | '\u{FB06}' => out.push_str("st"),
            other => out.push(other),
        }
    }
    out
}

// ── Rule 3: Normalise space variants and collapse runs ───────────────────

static RE_SPACE_VARIANTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{00A0}\u{2000}-\u{200A}\u{202F}\u{205F}\u{3000}\t\r\n]").unwrap());

fn normalise_spaces(input: &str) -> String {
    RE_SPACE_VARIANTS.replace_all(input, " ").to_string()
}

/// Collapse every whitespace run to a single space and trim.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Rule 4: De-hyphenation across line breaks ────────────────────────────

fn ends_with_split_word(s: &str) -> bool {
    let mut rev = s.chars().rev();
    matches!(
        (rev.next(), rev.next()),
        (Some('-'), Some(c)) if c.is_alphabetic()
    )
}

fn starts_lowercase(s: &str) -> bool {
    s.chars().next().is_some_and(char::is_lowercase)
}

// ── Table rendering ──────────────────────────────────────────────────────

fn escape_cell(cell: &str) -> String {
    collapse_whitespace(cell).replace('|', "\\|")
}

/// Render a header and rows as a GFM table. Short rows are padded.
pub fn markdown_table(header: &[String], rows: &[Vec<String>]) -> String {
    let columns = rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0)
        .max(1);

    let render_row = |cells: &[String]| {
        let mut line = String::from("|");
        for i in 0..columns {
            let cell = cells.get(i).map(|c| escape_cell(c)).unwrap_or_default();
            line.push(' ');
            line.push_str(&cell);
            line.push_str(" |");
        }
        line
    };

    let mut out = vec![render_row(header)];
    out.push(
        std::iter::once("|")
            .chain(std::iter::repeat_n(" --- |", columns))
            .collect(),
    );
    out.extend(rows.iter().map(|r| render_row(r)));
    out.join("\n")
}
