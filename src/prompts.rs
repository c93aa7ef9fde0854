//! Prompts for the enrichment stage and parsing of their replies.
//!
//! Every prompt lives here so wording changes never touch retry or
//! persistence code, and so tests can inspect prompts without a model.
//!
//! Both prompts end with a blank line followed by the content block; the
//! model sees instructions first and the material last.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// System prompt for table summaries.
pub const TABLE_SYSTEM_PROMPT: &str = r#"You analyse tables extracted from insurance and benefit policy documents.

Rules:
1. Describe what the table lists and how its columns relate, in plain language.
2. Quote amounts, limits and percentages exactly as written.
3. Do not invent rows, columns or values that are not in the table.
4. Reply with ONLY a JSON object, no markdown fences, no commentary:
   {"title": "<short descriptive title>", "summary": "<2-4 sentence summary>"}"#;

/// System prompt for figure descriptions.
pub const IMAGE_SYSTEM_PROMPT: &str = r#"You describe figures extracted from insurance and benefit policy documents.

Rules:
1. Describe what the figure shows: chart type, axes, labelled values, or diagram steps.
2. Transcribe any legible text or numbers exactly.
3. If the image is decorative (logo, divider, photo without information), say so briefly.
4. Reply with ONLY a JSON object, no markdown fences, no commentary:
   {"title": "<short descriptive title>", "description": "<2-4 sentence description>"}"#;

/// User prompt for one table, rendered as GFM.
pub fn table_prompt(page: u32, table_markdown: &str) -> String {
    format!(
        "Summarise the table below, extracted from page {page}.\n\n{}",
        table_markdown.trim()
    )
}

/// User prompt for one figure. The image travels as an attachment.
pub fn image_prompt(page: u32, caption: Option<&str>) -> String {
    let context = caption
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("none");
    format!(
        "Describe the attached figure from page {page}. Text printed next to it is given as context.\n\nContext: {context}"
    )
}

// ── Reply parsing ────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*)\n```\s*$").unwrap());

/// Strip an outer markdown fence that models add despite being told not to.
pub fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    match RE_OUTER_FENCES.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

/// Fields a reply may carry. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DescriptionReply {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "description")]
    pub summary: Option<String>,
}

/// Parse a model reply into title + text.
///
/// Takes the substring from the first `{` to the last `}` so leading chatter
/// is tolerated. A reply with no JSON at all is used verbatim as the text.
/// Returns `None` when nothing usable remains.
pub fn parse_description(reply: &str) -> Option<DescriptionReply> {
    let body = strip_fences(reply);
    if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
        if start < end {
            if let Ok(parsed) = serde_json::from_str::<DescriptionReply>(&body[start..=end]) {
                let summary = parsed.summary.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
                let title = parsed.title.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
                return summary.map(|summary| DescriptionReply {
                    title,
                    summary: Some(summary),
                });
            }
        }
    }
    let plain = body.trim();
    if plain.is_empty() || plain.starts_with('{') {
        None
    } else {
        Some(DescriptionReply {
            title: None,
            summary: Some(plain.to_string()),
        })
    }
}
