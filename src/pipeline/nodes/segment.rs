//! Sentence segmentation.
//!
//! Word-based: a word ending in `.`, `!` or `?` (optionally followed by a
//! closing quote or bracket) ends a sentence when the next word opens a new
//! one. Policy text is full of periods that do not end sentences, so known
//! abbreviations, single-letter initials and list ordinals never split.
//!
//! The output always satisfies `sentences.join(" ") == collapse_whitespace(text)`.

use crate::pipeline::normalize::collapse_whitespace;
use once_cell::sync::Lazy;
use regex::Regex;

const ABBREVIATIONS: &[&str] = &[
    "e.g.", "i.e.", "etc.", "vs.", "viz.", "cf.", "approx.", "incl.", "excl.", "max.", "min.", "no.", "nos.",
    "art.", "sec.", "cl.", "para.", "p.", "pp.", "fig.", "figs.", "mr.", "mrs.", "ms.", "dr.", "st.", "jr.",
    "sr.", "inc.", "ltd.", "co.", "corp.", "dept.", "est.", "jan.", "feb.", "mar.", "apr.", "jun.", "jul.",
    "aug.", "sep.", "sept.", "oct.", "nov.", "dec.", "u.s.", "u.k.", "a.m.", "p.m.",
];

static RE_ORDINAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?(?:\d+(?:\.\d+)*|[a-zA-Z]|[ivxlcIVXLC]+)[.)]$").unwrap());

fn strip_closers(word: &str) -> &str {
    word.trim_end_matches(['"', '\'', ')', ']', '”', '’'])
}

fn ends_with_terminal(word: &str) -> bool {
    strip_closers(word).ends_with(['.', '!', '?'])
}

fn is_abbreviation(word: &str) -> bool {
    let core = strip_closers(word)
        .trim_start_matches(['(', '[', '"', '\'', '“', '‘'])
        .to_lowercase();
    ABBREVIATIONS.contains(&core.as_str())
}

/// `J.` or `A.` inside a name.
fn is_initial(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some(c), Some('.'), None) if c.is_uppercase()
    )
}

fn opens_sentence(word: &str) -> bool {
    word.chars()
        .find(|c| !matches!(c, '"' | '\'' | '(' | '[' | '“' | '‘'))
        .is_some_and(|c| c.is_uppercase() || c.is_ascii_digit())
}

/// Split `text` into sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    let flat = collapse_whitespace(text);
    let words: Vec<&str> = flat.split(' ').filter(|w| !w.is_empty()).collect();
    let mut sentences = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for (i, word) in words.iter().enumerate() {
        current.push(word);
        let Some(next) = words.get(i + 1) else {
            break;
        };
        if !ends_with_terminal(word) || !opens_sentence(next) {
            continue;
        }
        let trailing_dot = strip_closers(word).ends_with('.');
        if trailing_dot && (is_abbreviation(word) || is_initial(word)) {
            continue;
        }
        // "1." or "(a)" leading a list item is not a sentence on its own
        if current.len() == 1 && RE_ORDINAL.is_match(word) {
            continue;
        }
        sentences.push(current.join(" "));
        current.clear();
    }
    if !current.is_empty() {
        sentences.push(current.join(" "));
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminal_punctuation() {
        let s = split_sentences("Cover starts today. Claims are paid in 30 days! Is that all? Yes.");
        assert_eq!(
            s,
            vec!["Cover starts today.", "Claims are paid in 30 days!", "Is that all?", "Yes."]
        );
    }

    #[test]
    fn abbreviations_and_initials_do_not_split() {
        let text = "Outpatient care, e.g. Physiotherapy, is covered. Signed by J. Smith on behalf of Acme Ltd. The end.";
        let s = split_sentences(text);
        assert_eq!(
            s,
            vec![
                "Outpatient care, e.g. Physiotherapy, is covered.",
                "Signed by J. Smith on behalf of Acme Ltd. The end."
            ]
        );
    }

    #[test]
    fn list_ordinals_stay_with_their_item() {
        let s = split_sentences("1. The insured must notify us. 2. Claims need receipts.");
        assert_eq!(s, vec!["1. The insured must notify us.", "2. Claims need receipts."]);
    }

    #[test]
    fn lowercase_continuation_does_not_split() {
        let s = split_sentences("Limits apply per approx. three visits. Done.");
        assert_eq!(s, vec!["Limits apply per approx. three visits.", "Done."]);
    }

    #[test]
    fn rejoining_reproduces_text() {
        let text = "  A  sentence.\nAnother (quoted \"one.\") Final ";
        let joined = split_sentences(text).join(" ");
        assert_eq!(joined, collapse_whitespace(text));
        assert!(split_sentences("   ").is_empty());
    }
}
