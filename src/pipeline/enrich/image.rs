//! Figure descriptions.

use super::{describe, fallback_outcome, DescribeError, EnrichSettings, RecordEnricher};
use crate::backend::{GenerationRequest, ModelBackend};
use crate::error::ItemError;
use crate::model::{EnrichedRecord, EnrichmentStatus, RawRecord, RecordContent, RecordKind};
use crate::pipeline::encode::png_image_data;
use crate::prompts::{image_prompt, IMAGE_SYSTEM_PROMPT};
use crate::report::ItemOutcome;
use crate::store::StageStore;
use async_trait::async_trait;
use std::sync::Arc;

pub const FALLBACK_DESCRIPTION: &str = "Image extracted from document";

pub fn fallback_title(page: u32) -> String {
    format!("Figure on page {page}")
}

/// Describes figures with a vision-capable generation backend.
pub struct ImageEnricher {
    backend: Arc<dyn ModelBackend>,
    settings: EnrichSettings,
    store: StageStore,
}

impl ImageEnricher {
    /// `store` resolves the figure paths recorded at extraction.
    pub fn new(backend: Arc<dyn ModelBackend>, settings: EnrichSettings, store: StageStore) -> Self {
        Self {
            backend,
            settings,
            store,
        }
    }

    pub fn fallback(&self, record: &RawRecord, caption: Option<&str>) -> EnrichedRecord {
        let description = match caption.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => format!("{FALLBACK_DESCRIPTION}: {c}"),
            None => FALLBACK_DESCRIPTION.to_string(),
        };
        EnrichedRecord {
            record: record.clone(),
            title: fallback_title(record.page),
            generated_description: description,
            enrichment_status: EnrichmentStatus::Skipped,
            column_headers: Vec::new(),
            error_detail: None,
        }
    }
}

#[async_trait]
impl RecordEnricher for ImageEnricher {
    fn kind(&self) -> RecordKind {
        RecordKind::Image
    }

    async fn enrich(&self, record: &RawRecord) -> ItemOutcome<EnrichedRecord> {
        let RecordContent::Image { image_path, caption } = &record.content else {
            return ItemOutcome::failed(
                record.key(),
                ItemError::Enrichment {
                    item: record.key(),
                    attempts: 0,
                    detail: "record is not an image".into(),
                },
            );
        };
        let fallback = self.fallback(record, caption.as_deref());
        if !self.settings.use_llm {
            return fallback_outcome(record, fallback, None);
        }

        let png = match tokio::fs::read(self.store.resolve(image_path)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let failure = DescribeError {
                    attempts: 0,
                    detail: format!("figure '{image_path}' unreadable: {e}"),
                };
                return fallback_outcome(record, fallback, Some(failure));
            }
        };

        let request = GenerationRequest {
            system: IMAGE_SYSTEM_PROMPT.to_string(),
            prompt: image_prompt(record.page, caption.as_deref()),
            image: Some(png_image_data(&png)),
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
                    column_headers: Vec::new(),
                    error_detail: None,
                },
            ),
            Err(failure) => fallback_outcome(record, fallback, Some(failure)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::model::{Coordinates, Rect};
    use crate::retry::RetryPolicy;

    fn record(caption: Option<&str>) -> RawRecord {
        RawRecord {
            kind: RecordKind::Image,
            page: 3,
            index: 0,
            coordinates: Coordinates::from_rect(3, Rect::new(72.0, 200.0, 400.0, 400.0), 612.0, 792.0),
            content: RecordContent::Image {
                image_path: StageStore::figure_path(3, 0),
                caption: caption.map(str::to_string),
            },
        }
    }

    fn enricher(dir: &std::path::Path, use_llm: bool) -> ImageEnricher {
        ImageEnricher::new(
            Arc::new(LocalBackend::new("extractive")),
            EnrichSettings {
                use_llm,
                temperature: 0.0,
                max_tokens: 64,
                retry: RetryPolicy::none(),
            },
            StageStore::new(dir, "doc"),
        )
    }

    #[tokio::test]
    async fn describes_stored_figure() {
        let dir = tempfile::tempdir().unwrap();
        let e = enricher(dir.path(), true);
        e.store
            .write_bytes(StageStore::figure_path(3, 0), b"\x89PNG fake")
            .await
            .unwrap();
        let r = e.enrich(&record(Some("Figure 2: Claims process"))).await.value.unwrap();
        assert_eq!(r.enrichment_status, EnrichmentStatus::Ok);
        assert_eq!(r.title, "Figure");
        assert!(r.generated_description.contains("Claims process"));
    }

    #[tokio::test]
    async fn missing_figure_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = enricher(dir.path(), true).enrich(&record(None)).await;
        assert!(matches!(outcome.error, Some(ItemError::Enrichment { attempts: 0, .. })));
        let r = outcome.value.unwrap();
        assert_eq!(r.enrichment_status, EnrichmentStatus::Failed);
        assert_eq!(r.title, "Figure on page 3");
        assert_eq!(r.generated_description, FALLBACK_DESCRIPTION);
    }
}
