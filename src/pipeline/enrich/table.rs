//! Table summaries.

use super::{describe, fallback_outcome, EnrichSettings, RecordEnricher};
use crate::backend::{GenerationRequest, ModelBackend};
use crate::error::ItemError;
use crate::model::{EnrichedRecord, EnrichmentStatus, RawRecord, RecordContent, RecordKind};
use crate::pipeline::normalize::{clean_text, markdown_table};
use crate::prompts::{table_prompt, TABLE_SYSTEM_PROMPT};
use crate::report::ItemOutcome;
use async_trait::async_trait;
use std::sync::Arc;

/// Header row with blanks replaced by `Column_<n>` (1-based).
pub fn column_headers(header: &[String]) -> Vec<String> {
    header
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = clean_text(h);
            if h.is_empty() {
                format!("Column_{}", i + 1)
            } else {
                h
            }
        })
        .collect()
}

pub fn fallback_title(page: u32) -> String {
    format!("Table on page {page}")
}

/// Summarises tables with the generation backend.
pub struct TableEnricher {
    backend: Arc<dyn ModelBackend>,
    settings: EnrichSettings,
}

impl TableEnricher {
    pub fn new(backend: Arc<dyn ModelBackend>, settings: EnrichSettings) -> Self {
        Self { backend, settings }
    }

    /// Deterministic rendering: fallback title, headers, markdown as the description.
    pub fn fallback(&self, record: &RawRecord, headers: Vec<String>, markdown: String) -> EnrichedRecord {
        EnrichedRecord {
            record: record.clone(),
            title: fallback_title(record.page),
            generated_description: markdown,
            enrichment_status: EnrichmentStatus::Skipped,
            column_headers: headers,
            error_detail: None,
        }
    }
}

#[async_trait]
impl RecordEnricher for TableEnricher {
    fn kind(&self) -> RecordKind {
        RecordKind::Table
    }

    async fn enrich(&self, record: &RawRecord) -> ItemOutcome<EnrichedRecord> {
        let RecordContent::Table { header, rows } = &record.content else {
            return ItemOutcome::failed(
                record.key(),
                ItemError::Enrichment {
                    item: record.key(),
                    attempts: 0,
                    detail: "record is not a table".into(),
                },
            );
        };
        let headers = column_headers(header);
        let markdown = markdown_table(&headers, rows);
        let fallback = self.fallback(record, headers.clone(), markdown.clone());

        if !self.settings.use_llm {
            return fallback_outcome(record, fallback, None);
        }

        let request = GenerationRequest {
            system: TABLE_SYSTEM_PROMPT.to_string(),
            prompt: table_prompt(record.page, &markdown),
            image: None,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        match describe(self.backend.as_ref(), &self.settings.retry, &record.key(), &request).await {
            Ok(reply) => ItemOutcome::ok(
                record.key(),
                EnrichedRecord {
                    record: record.clone(),
                    title: reply.title.unwrap_or_else(|| fallback_title(record.page)),
                    generated_description: reply.summary.unwrap_or_default(),
                    enrichment_status: EnrichmentStatus::Ok,
                    column_headers: headers,
                    error_detail: None,
                },
            ),
            Err(failure) => fallback_outcome(record, fallback, Some(failure)),
        }
    }
}
