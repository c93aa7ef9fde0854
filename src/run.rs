//! Pipeline orchestrator: run the selected stages over one document.
//!
//! Stages run strictly in order and each writes its output through the
//! [`StageStore`] before the next one starts. The manifest records which
//! stages are complete so later runs can resume, and carries the source
//! fingerprint so a resumed run never mixes output from two different PDFs.
//!
//! Within a stage, items settle independently. A stage's item failures end
//! the run only when their rate exceeds `max_failure_rate`; items that fell
//! back to deterministic output are reported but never count toward it. A
//! stage that crosses the threshold is dropped from the manifest, so the next
//! run (or `resume`) redoes it from scratch.

use crate::backend::{build_backend, LocalBackend, ModelBackend};
use crate::config::{PipelineConfig, Stage, VectorStoreKind};
use crate::error::PipelineError;
use crate::model::{sort_nodes, Node, NodeType};
use crate::pipeline::enrich::{self, EnrichSettings, ImageEnricher, RecordEnricher, TableEnricher};
use crate::pipeline::extract::{self, Extractors};
use crate::pipeline::index::{self, Indexer, LocalVectorStore, PineconeStore, VectorStore};
use crate::pipeline::layout::{self, DocumentMetadata, LayoutSource, PdfiumLayoutSource};
use crate::pipeline::nodes::{self, NodeBuilders};
use crate::pipeline::{embed, input, StageContext};
use crate::progress::NoopProgressCallback;
use crate::provider::ModelRole;
use crate::report::{RunReport, StageReport};
use crate::store::{Manifest, StageState, StageStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Run the pipeline over a PDF file or URL.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(RunReport)` whenever the selected stages ran, even if some items
/// failed (check [`RunReport::total_failures`]) or the run was cancelled
/// (`report.cancelled`). `report.json` is written next to the stage output.
///
/// # Errors
/// Returns `Err(PipelineError)` only for fatal errors:
/// - input not found, unreadable or not a PDF
/// - provider or credential misconfiguration (before any stage runs)
/// - resume requested without the prerequisite stage output, or against a
///   changed source file
/// - a stage's failure rate above `max_failure_rate`
/// - a fatal embedding backend error
pub async fn run_pipeline(input_str: impl AsRef<str>, config: &PipelineConfig) -> Result<RunReport, PipelineError> {
    let total_start = Instant::now();
    let input_str = input_str.as_ref();
    info!("Starting pipeline run: {}", input_str);

    // ── Step 1: Resolve input and identity ───────────────────────────────
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let pdf_path = resolved.path().to_path_buf();
    let source_file = resolved.source_name();
    let document_id = input::document_id(&pdf_path, config.document_id.as_deref());
    let fingerprint = input::fingerprint(&pdf_path).await?;
    let store = StageStore::new(&config.output_dir, &document_id);
    debug!("Document '{}' stored under {}", document_id, store.root().display());

    // ── Step 2: Manifest and stage selection ─────────────────────────────
    let mut manifest = match store.load_manifest().await? {
        Some(m) if m.fingerprint == fingerprint => m,
        Some(_) if config.stages.from == Stage::Extract && !config.stages.resume => {
            info!("Source changed since the last run; starting over");
            for stage in Stage::ALL {
                store.clear_stage(stage).await?;
            }
            Manifest::new(&document_id, &source_file, &fingerprint)
        }
        Some(m) => {
            return Err(PipelineError::SourceChanged {
                expected: m.fingerprint,
                found: fingerprint,
            })
        }
        None => Manifest::new(&document_id, &source_file, &fingerprint),
    };

    let start_stage = if config.stages.resume {
        Stage::ALL
            .into_iter()
            .find(|s| !manifest.is_complete(*s))
            .unwrap_or(Stage::Index)
    } else {
        config.stages.from
    };
    let stages = config.stages.stages_from(start_stage);
    let mut report = RunReport::new(&document_id, &source_file);
    if stages.is_empty() || stages.iter().all(|s| manifest.is_complete(*s) && config.stages.resume) {
        info!("Nothing to run for '{}': every selected stage is complete", document_id);
        report.total_duration_ms = total_start.elapsed().as_millis() as u64;
        return Ok(report);
    }
    if let Some(prereq) = stages[0].prerequisite() {
        if !manifest.is_complete(prereq) {
            return Err(PipelineError::StageNotComplete {
                stage: prereq,
                document_id,
            });
        }
    }
    info!(
        "Running stages [{}] for '{}'",
        stages.iter().map(Stage::as_str).collect::<Vec<_>>().join(", "),
        document_id
    );

    // ── Step 3: Backends (configuration errors surface here) ─────────────
    let needs_generation = stages.contains(&Stage::Enrich) && config.use_llm && !config.dry_run;
    let (table_backend, image_backend) = if needs_generation {
        generation_backends(config)?
    } else {
        let offline: Arc<dyn ModelBackend> = Arc::new(LocalBackend::new("offline"));
        (offline.clone(), offline)
    };
    let embedder = if stages.contains(&Stage::Embed) && !config.dry_run {
        Some(embed::Embedder::new(
            embedding_backend(config)?,
            config.retry,
            config.max_embed_chars,
            config.concurrency,
        ))
    } else {
        None
    };
    let indexer = if stages.contains(&Stage::Index) && !config.dry_run {
        Some(Indexer::new(
            vector_store(config).await?,
            config.retry,
            config.concurrency,
            config.namespace_prefix.clone(),
        ))
    } else {
        None
    };

    // ── Step 4: Cancellation ─────────────────────────────────────────────
    let cancel = config.cancel.child_token();
    let timer = config.run_timeout.map(|timeout| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!("Run timeout of {}s reached; no new work will be dispatched", timeout.as_secs());
            cancel.cancel();
        })
    });

    let ctx = StageContext {
        document_id: document_id.clone(),
        source_file: source_file.clone(),
        store: store.clone(),
        concurrency: config.concurrency,
        retry: config.retry,
        cancel: cancel.clone(),
        progress: config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback)),
    };
    let settings = EnrichSettings {
        use_llm: config.use_llm,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        retry: config.retry,
    };
    let enrichers: Vec<Arc<dyn RecordEnricher>> = vec![
        Arc::new(TableEnricher::new(table_backend, settings.clone())),
        Arc::new(ImageEnricher::new(image_backend, settings, store.clone())),
    ];
    let layout_source: Arc<dyn LayoutSource> = config
        .layout_source
        .clone()
        .unwrap_or_else(|| Arc::new(PdfiumLayoutSource));

    // ── Step 5: Stages ───────────────────────────────────────────────────
    let outcome = async {
        for stage in stages {
            if ctx.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if stage == Stage::Enrich && config.dry_run {
                let planned = enrich::planned_calls(&ctx, &enrichers, config.use_llm).await?;
                info!("Dry run: enrichment would make {} generation calls", planned);
                report.planned_generation_calls = Some(planned);
                break;
            }

            prepare_stage(&store, &mut manifest, stage).await?;
            let stage_report = match stage {
                Stage::Extract => {
                    extract::run(
                        &ctx,
                        layout_source.as_ref(),
                        &Extractors::default(),
                        &pdf_path,
                        &config.pages,
                        config.password.as_deref(),
                    )
                    .await?
                }
                Stage::Enrich => enrich::run(&ctx, &enrichers).await?,
                Stage::BuildNodes => nodes::run(&ctx, &NodeBuilders::default()).await?,
                Stage::Embed => match &embedder {
                    Some(embedder) => embed::run(&ctx, embedder).await?,
                    None => StageReport::new(stage),
                },
                Stage::Index => match &indexer {
                    Some(indexer) => index::run(&ctx, indexer).await?,
                    None => StageReport::new(stage),
                },
            };
            ctx.progress.on_stage_complete(stage, &stage_report);
            let completed = stage_report.completed;
            let breached = stage_report.failure_rate() > config.max_failure_rate;
            let failed = stage_report.real_failures();
            let attempted = stage_report.attempted();
            report.stages.push(stage_report);

            if breached {
                // the next run re-enters this stage from scratch
                manifest.invalidate_from(stage);
            } else if completed {
                manifest.mark(stage, StageState::Complete);
            }
            store.save_manifest(&manifest).await?;

            if breached {
                error!(stage = %stage, "{}/{} items failed", failed, attempted);
                report.total_duration_ms = total_start.elapsed().as_millis() as u64;
                store.save_report(&report).await?;
                return Err(PipelineError::FailureThresholdExceeded {
                    stage,
                    failed,
                    total: attempted,
                    max_rate: config.max_failure_rate,
                });
            }
            if !completed {
                warn!(stage = %stage, "Stage interrupted; re-run with resume to finish it");
                report.cancelled = true;
                break;
            }
        }
        Ok::<(), PipelineError>(())
    }
    .await;

    if let Some(timer) = timer {
        timer.abort();
    }
    outcome?;

    report.total_duration_ms = total_start.elapsed().as_millis() as u64;
    store.save_report(&report).await?;
    info!(
        "Run complete for '{}': {} stages, {} failed items, {}ms",
        document_id,
        report.stages.len(),
        report.total_failures(),
        report.total_duration_ms
    );
    Ok(report)
}

/// Synchronous wrapper around [`run_pipeline`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_pipeline_sync(input_str: impl AsRef<str>, config: &PipelineConfig) -> Result<RunReport, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run_pipeline(input_str, config))
}

/// Extract PDF metadata without running any stage.
///
/// Does not require a model provider or API key.
pub async fn inspect(input_str: impl AsRef<str>, password: Option<&str>) -> Result<DocumentMetadata, PipelineError> {
    let resolved = input::resolve_input(input_str.as_ref(), 120).await?;
    layout::extract_metadata(resolved.path(), password).await
}

/// Every persisted node of `document_id`, in document order. Embedded nodes
/// (with vectors) are returned when `embedded` is set.
pub async fn load_nodes(config: &PipelineConfig, document_id: &str, embedded: bool) -> Result<Vec<Node>, PipelineError> {
    let store = StageStore::new(&config.output_dir, document_id);
    let mut out = Vec::new();
    for node_type in NodeType::ALL {
        let nodes = if embedded {
            store.read_embedded(node_type).await?
        } else {
            store.read_nodes(node_type).await?
        };
        out.extend(nodes);
    }
    sort_nodes(&mut out);
    Ok(out)
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Mark `stage` partial before it writes anything, dropping downstream state.
///
/// A stage left partial by an interrupted run keeps its partitions so it can
/// pick up where it stopped. Build-nodes output is always rebuilt.
async fn prepare_stage(store: &StageStore, manifest: &mut Manifest, stage: Stage) -> Result<(), PipelineError> {
    let was_partial = manifest
        .stages
        .get(&stage)
        .is_some_and(|s| s.state == StageState::Partial);
    if was_partial && stage != Stage::BuildNodes {
        info!(stage = %stage, "Resuming partial stage output");
    } else {
        store.clear_stage(stage).await?;
    }
    manifest.invalidate_from(stage);
    manifest.mark(stage, StageState::Partial);
    store.save_manifest(manifest).await
}

/// Generation backends for table and image enrichment, most specific first:
/// the pre-built backend, then the per-enricher model, then `model_provider.llm`.
fn generation_backends(
    config: &PipelineConfig,
) -> Result<(Arc<dyn ModelBackend>, Arc<dyn ModelBackend>), PipelineError> {
    if let Some(backend) = &config.generation_backend {
        return Ok((Arc::clone(backend), Arc::clone(backend)));
    }
    let table = build_backend(config.table_model(), ModelRole::Generation)?;
    let image = if config.image_model() == config.table_model() {
        Arc::clone(&table)
    } else {
        build_backend(config.image_model(), ModelRole::Generation)?
    };
    Ok((table, image))
}

/// The embedding backend: the pre-built one, else `model_provider.embedding`.
pub(crate) fn embedding_backend(config: &PipelineConfig) -> Result<Arc<dyn ModelBackend>, PipelineError> {
    match &config.embedding_backend {
        Some(backend) => Ok(Arc::clone(backend)),
        None => build_backend(&config.model_provider.embedding, ModelRole::Embedding),
    }
}

/// The vector store: the pre-built one, else the configured kind.
pub(crate) async fn vector_store(config: &PipelineConfig) -> Result<Arc<dyn VectorStore>, PipelineError> {
    if let Some(store) = &config.vector_store_override {
        return Ok(Arc::clone(store));
    }
    match &config.vector_store {
        VectorStoreKind::Pinecone { index_host } => Ok(Arc::new(PineconeStore::from_env(index_host.as_deref())?)),
        VectorStoreKind::Local { path: Some(path) } => Ok(Arc::new(LocalVectorStore::open(path).await?)),
        VectorStoreKind::Local { path: None } => Ok(Arc::new(LocalVectorStore::in_memory())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ModelConfig, ModelProvider, ProviderKind};

    #[tokio::test]
    async fn prepare_keeps_partial_output_except_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = StageStore::new(dir.path(), "doc");
        let mut manifest = Manifest::new("doc", "doc.pdf", "abc");
        manifest.mark(Stage::Extract, StageState::Complete);
        manifest.mark(Stage::Enrich, StageState::Partial);
        manifest.mark(Stage::BuildNodes, StageState::Complete);
        store.write_enriched(crate::model::RecordKind::Table, 1, &[]).await.unwrap();

        prepare_stage(&store, &mut manifest, Stage::Enrich).await.unwrap();
        assert!(store.exists("enriched/tables/page-0001.json"));
        assert!(!manifest.stages.contains_key(&Stage::BuildNodes));
        assert_eq!(manifest.stages[&Stage::Enrich].state, StageState::Partial);

        manifest.mark(Stage::Enrich, StageState::Complete);
        prepare_stage(&store, &mut manifest, Stage::Enrich).await.unwrap();
        assert!(!store.exists("enriched/tables/page-0001.json"));
    }

    #[test]
    fn generation_only_provider_cannot_embed() {
        let mut config = PipelineConfig::default();
        config.model_provider = ModelProvider::new(
            ModelConfig::default_for(ProviderKind::Local, ModelRole::Generation),
            ModelConfig::new(ProviderKind::Anthropic, "claude-3-5-haiku-latest"),
        );
        assert!(matches!(
            embedding_backend(&config),
            Err(PipelineError::UnsupportedProvider { .. })
        ));
    }

    #[tokio::test]
    async fn local_store_without_path_is_in_memory() {
        let mut config = PipelineConfig::default();
        config.vector_store = VectorStoreKind::Local { path: None };
        let store = vector_store(&config).await.unwrap();
        assert_eq!(store.name(), "local/memory");
    }
}
