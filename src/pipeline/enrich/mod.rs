//! Enrich stage: raw tables and figures → titled, described records.
//!
//! Each record kind has a [`RecordEnricher`]. Records are dispatched
//! concurrently (bounded by `concurrency`) and every call goes through
//! [`retry_transient`]. An enricher never fails the stage: when retries run
//! out the record keeps a deterministic fallback description with status
//! `failed`, and the failure is reported alongside it.
//!
//! Output is written per (kind, page) as soon as every record of that page
//! has settled, so an interrupted run keeps finished pages.

pub mod image;
pub mod table;

use crate::backend::{GenerationRequest, ModelBackend};
use crate::config::Stage;
use crate::error::{ItemError, PipelineError};
use crate::model::{EnrichedRecord, EnrichmentStatus, RawRecord, RecordKind};
use crate::pipeline::StageContext;
use crate::prompts::{parse_description, DescriptionReply};
use crate::report::{ItemOutcome, StageReport};
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::partition;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub use image::ImageEnricher;
pub use table::TableEnricher;

/// Generation settings shared by the enrichers.
#[derive(Debug, Clone)]
pub struct EnrichSettings {
    /// When false, records get their fallback with status `skipped`.
    pub use_llm: bool,
    pub temperature: f32,
    pub max_tokens: usize,
    pub retry: RetryPolicy,
}

/// Turns one raw record into an enriched record.
#[async_trait]
pub trait RecordEnricher: Send + Sync {
    /// Record kind this enricher consumes.
    fn kind(&self) -> RecordKind;

    /// Enrich one record. Failures degrade to the fallback.
    async fn enrich(&self, record: &RawRecord) -> ItemOutcome<EnrichedRecord>;
}

/// A failed description request.
#[derive(Debug, Clone, PartialEq)]
pub struct DescribeError {
    pub attempts: u32,
    pub detail: String,
}

/// Ask the backend for a `{title, summary}` reply, with retries.
pub async fn describe(
    backend: &dyn ModelBackend,
    retry: &RetryPolicy,
    label: &str,
    request: &GenerationRequest,
) -> Result<DescriptionReply, DescribeError> {
    let retried = retry_transient(retry, label, || backend.generate(request)).await;
    let attempts = retried.attempts;
    match retried.result {
        Ok(generation) => {
            debug!(
                "{}: {} in / {} out tokens",
                label, generation.input_tokens, generation.output_tokens
            );
            parse_description(&generation.text).ok_or_else(|| DescribeError {
                attempts,
                detail: "reply held no usable description".into(),
            })
        }
        Err(e) => Err(DescribeError {
            attempts,
            detail: e.to_string(),
        }),
    }
}

/// Outcome for a record whose description came from the fallback.
pub fn fallback_outcome(
    record: &RawRecord,
    fallback: EnrichedRecord,
    failure: Option<DescribeError>,
) -> ItemOutcome<EnrichedRecord> {
    let item = record.key();
    match failure {
        None => ItemOutcome::ok(item, fallback),
        Some(f) => {
            let error = ItemError::Enrichment {
                item: item.clone(),
                attempts: f.attempts,
                detail: f.detail.clone(),
            };
            let degraded = EnrichedRecord {
                enrichment_status: EnrichmentStatus::Failed,
                error_detail: Some(f.detail),
                ..fallback
            };
            ItemOutcome::degraded(item, degraded, error)
        }
    }
}

type PageKey = (RecordKind, u32);

/// Records still to enrich.
struct Pending {
    work: Vec<(Arc<dyn RecordEnricher>, RawRecord)>,
    per_page: BTreeMap<PageKey, usize>,
    /// Records on pages an earlier run already wrote.
    skipped: usize,
}

async fn pending(ctx: &StageContext, enrichers: &[Arc<dyn RecordEnricher>]) -> Result<Pending, PipelineError> {
    let mut out = Pending {
        work: Vec::new(),
        per_page: BTreeMap::new(),
        skipped: 0,
    };
    for enricher in enrichers {
        let kind = enricher.kind();
        for record in ctx.store.read_raw(kind).await? {
            if ctx.store.exists(partition("enriched", kind.dir_name(), record.page)) {
                out.skipped += 1;
                continue;
            }
            *out.per_page.entry((kind, record.page)).or_default() += 1;
            out.work.push((enricher.clone(), record));
        }
    }
    Ok(out)
}

/// Generation calls the stage would make.
pub async fn planned_calls(
    ctx: &StageContext,
    enrichers: &[Arc<dyn RecordEnricher>],
    use_llm: bool,
) -> Result<usize, PipelineError> {
    if !use_llm {
        return Ok(0);
    }
    Ok(pending(ctx, enrichers).await?.work.len())
}

/// Run the enrich stage.
pub async fn run(ctx: &StageContext, enrichers: &[Arc<dyn RecordEnricher>]) -> Result<StageReport, PipelineError> {
    let start = Instant::now();
    let mut report = StageReport::new(Stage::Enrich);
    let Pending {
        work,
        per_page: mut remaining,
        skipped,
    } = pending(ctx, enrichers).await?;
    for _ in 0..skipped {
        report.record_skip();
    }
    ctx.progress.on_stage_start(Stage::Enrich, work.len());

    // pages whose records all produced a value, so far
    let mut finished: BTreeMap<PageKey, Vec<EnrichedRecord>> = BTreeMap::new();
    let mut broken: BTreeSet<PageKey> = BTreeSet::new();

    let mut results = stream::iter(work)
        .map(|(enricher, record)| {
            let cancel = ctx.cancel.clone();
            async move {
                let key = (record.kind, record.page);
                if cancel.is_cancelled() {
                    let item = record.key();
                    return (key, ItemOutcome::failed(item.clone(), ItemError::Cancelled { item }));
                }
                (key, enricher.enrich(&record).await)
            }
        })
        .buffer_unordered(ctx.concurrency.max(1));

    while let Some((key, outcome)) = results.next().await {
        let skipped_by_config = outcome
            .value
            .as_ref()
            .is_some_and(|r| r.enrichment_status == EnrichmentStatus::Skipped);
        if skipped_by_config {
            report.record_skip();
            ctx.progress.on_item_complete(Stage::Enrich, &outcome.item);
        } else {
            ctx.settle(Stage::Enrich, &mut report, &outcome);
        }

        match outcome.value {
            Some(record) => finished.entry(key).or_default().push(record),
            None => {
                broken.insert(key);
            }
        }

        let left = remaining.entry(key).or_default();
        *left = left.saturating_sub(1);
        if *left == 0 && !broken.contains(&key) {
            let mut records = finished.remove(&key).unwrap_or_default();
            records.sort_by_key(|r| r.record.index);
            report.add_produced(key.0.dir_name(), records.len());
            ctx.store.write_enriched(key.0, key.1, &records).await?;
        }
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Enriched {} records ({} failed, {} skipped) in {}ms",
        report.succeeded, report.failed, report.skipped, report.duration_ms
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, Generation, LocalBackend};
    use crate::model::{Coordinates, Rect, RecordContent};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn table_record(page: u32, index: u32) -> RawRecord {
        RawRecord {
            kind: RecordKind::Table,
            page,
            index,
            coordinates: Coordinates::from_rect(page, Rect::new(72.0, 100.0, 500.0, 160.0), 612.0, 792.0),
            content: RecordContent::Table {
                header: vec!["Benefit".into(), "".into()],
                rows: vec![
                    vec!["Room".into(), "$200".into()],
                    vec!["Surgery".into(), "$5,000".into()],
                ],
            },
        }
    }

    struct Flaky {
        failures: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ModelBackend for Flaky {
        fn name(&self) -> String {
            "flaky".into()
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, BackendError> {
            let n = self.failures.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(BackendError::Transient("503 service unavailable".into()));
            }
            Ok(Generation {
                text: r#"{"title": "Benefit limits", "summary": "Room and surgery limits."}"#.into(),
                input_tokens: 10,
                output_tokens: 8,
            })
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            Err(BackendError::Fatal("generation only".into()))
        }
    }

    fn settings(use_llm: bool, retries: u32) -> EnrichSettings {
        EnrichSettings {
            use_llm,
            temperature: 0.0,
            max_tokens: 64,
            retry: RetryPolicy {
                max_retries: retries,
                base_backoff_ms: 0,
                max_backoff_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Arc::new(Flaky {
            failures: AtomicU32::new(0),
            fail_first: 2,
        });
        let enricher = TableEnricher::new(backend, settings(true, 3));
        let outcome = enricher.enrich(&table_record(2, 0)).await;
        assert!(outcome.is_ok());
        let record = outcome.value.unwrap();
        assert_eq!(record.title, "Benefit limits");
        assert_eq!(record.enrichment_status, EnrichmentStatus::Ok);
    }

    #[tokio::test]
    async fn exhausted_retries_degrade_to_fallback() {
        let backend = Arc::new(Flaky {
            failures: AtomicU32::new(0),
            fail_first: 10,
        });
        let enricher = TableEnricher::new(backend, settings(true, 2));
        let outcome = enricher.enrich(&table_record(2, 0)).await;
        let record = outcome.value.clone().unwrap();
        assert_eq!(record.enrichment_status, EnrichmentStatus::Failed);
        assert_eq!(record.title, "Table on page 2");
        assert!(record.generated_description.contains("| Room | $200 |"));
        assert!(matches!(
            outcome.error,
            Some(ItemError::Enrichment { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn stage_writes_partitions_and_skips_done_pages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::pipeline::testing::context(dir.path());
        ctx.store
            .write_raw(RecordKind::Table, 2, &[table_record(2, 0), table_record(2, 1)])
            .await
            .unwrap();
        ctx.store.write_raw(RecordKind::Table, 3, &[table_record(3, 0)]).await.unwrap();

        let enrichers: Vec<Arc<dyn RecordEnricher>> = vec![Arc::new(TableEnricher::new(
            Arc::new(LocalBackend::new("extractive")),
            settings(true, 0),
        ))];
        assert_eq!(planned_calls(&ctx, &enrichers, true).await.unwrap(), 3);
        assert_eq!(planned_calls(&ctx, &enrichers, false).await.unwrap(), 0);

        let report = run(&ctx, &enrichers).await.unwrap();
        assert_eq!(report.succeeded, 3);
        let enriched = ctx.store.read_enriched(RecordKind::Table).await.unwrap();
        let order: Vec<(u32, u32)> = enriched.iter().map(|r| (r.record.page, r.record.index)).collect();
        assert_eq!(order, vec![(2, 0), (2, 1), (3, 0)]);

        let again = run(&ctx, &enrichers).await.unwrap();
        assert_eq!((again.total, again.skipped), (0, 3));
    }

    #[tokio::test]
    async fn cancelled_stage_leaves_pages_unwritten() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::pipeline::testing::context(dir.path());
        ctx.store.write_raw(RecordKind::Table, 2, &[table_record(2, 0)]).await.unwrap();
        ctx.cancel.cancel();

        let enrichers: Vec<Arc<dyn RecordEnricher>> = vec![Arc::new(TableEnricher::new(
            Arc::new(LocalBackend::new("extractive")),
            settings(true, 0),
        ))];
        let report = run(&ctx, &enrichers).await.unwrap();
        assert!(!report.completed);
        assert!(ctx.store.read_enriched(RecordKind::Table).await.unwrap().is_empty());
    }
}
