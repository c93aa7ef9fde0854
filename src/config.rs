//! Configuration types for a pipeline run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Model choices travel inside the config as an
//! explicit [`ModelProvider`]; nothing is read from process-wide state once
//! the config exists.

use crate::backend::ModelBackend;
use crate::error::PipelineError;
use crate::pipeline::index::VectorStore;
use crate::pipeline::layout::LayoutSource;
use crate::progress::ProgressCallback;
use crate::provider::{ModelConfig, ModelProvider, ModelRole};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for one pipeline run over one document.
///
/// # Example
/// ```rust
/// use edgequake_pdf2nodes::{ModelProvider, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .output_dir("./output")
///     .model_provider(ModelProvider::local())
///     .concurrency(4)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root directory for persisted stage output. Default: `./output`.
    ///
    /// Each document gets its own subdirectory named after its document id.
    pub output_dir: PathBuf,

    /// Generation and embedding models for the run.
    pub model_provider: ModelProvider,

    /// Generation model for table summaries; falls back to `model_provider.llm`.
    pub table_model: Option<ModelConfig>,

    /// Generation model for image descriptions; falls back to `model_provider.llm`.
    pub image_model: Option<ModelConfig>,

    /// Which stages to run.
    pub stages: StagePlan,

    /// Page selection applied at extraction. Default: all pages.
    pub pages: PageSelection,

    /// Maximum in-flight items per stage (generation calls, embedding
    /// batches, upsert batches). Default: 8.
    ///
    /// Remote providers rate-limit aggressively; if you see sustained 429
    /// retries in the log, lower this before raising `max_retries`.
    pub concurrency: usize,

    /// Retry policy for transient backend and vector-store failures.
    pub retry: RetryPolicy,

    /// Highest tolerated fraction of failed items per stage. Default: 0.5.
    ///
    /// Item failures never abort a run on their own. When a stage finishes
    /// with a failure rate above this value the run stops with
    /// [`PipelineError::FailureThresholdExceeded`]; the stage's output is
    /// still persisted so the run can be resumed after the cause is fixed.
    pub max_failure_rate: f64,

    /// Call the generation backend during enrichment. Default: true.
    ///
    /// When false, every table and image gets its deterministic fallback
    /// description with status `skipped`.
    pub use_llm: bool,

    /// Count the generation calls enrichment would make, then stop. Default: false.
    pub dry_run: bool,

    /// Sampling temperature for generation calls. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens per generated description. Default: 512.
    pub max_tokens: usize,

    /// Node text longer than this (in characters) is rejected by the embed
    /// stage instead of being sent. Default: 24 000 (≈ 8k tokens).
    pub max_embed_chars: usize,

    /// Vector store that receives embedded nodes.
    pub vector_store: VectorStoreKind,

    /// Optional prefix prepended to every namespace, e.g. `"staging-"`.
    pub namespace_prefix: Option<String>,

    /// Override the document id derived from the file name.
    pub document_id: Option<String>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Stop dispatching new work after this long. In-flight items finish;
    /// the interrupted stage stays resumable. Default: none.
    pub run_timeout: Option<Duration>,

    /// External abort signal with the same semantics as `run_timeout`.
    pub cancel: CancellationToken,

    /// Receives stage and item events.
    pub progress_callback: Option<ProgressCallback>,

    /// Pre-built generation backend. Takes precedence over `model_provider.llm`
    /// and the per-enricher overrides.
    pub generation_backend: Option<Arc<dyn ModelBackend>>,

    /// Pre-built embedding backend. Takes precedence over `model_provider.embedding`.
    pub embedding_backend: Option<Arc<dyn ModelBackend>>,

    /// Pre-built page layout source. Default: pdfium.
    pub layout_source: Option<Arc<dyn LayoutSource>>,

    /// Pre-built vector store. Takes precedence over `vector_store`.
    pub vector_store_override: Option<Arc<dyn VectorStore>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            model_provider: ModelProvider::default(),
            table_model: None,
            image_model: None,
            stages: StagePlan::default(),
            pages: PageSelection::default(),
            concurrency: 8,
            retry: RetryPolicy::default(),
            max_failure_rate: 0.5,
            use_llm: true,
            dry_run: false,
            temperature: 0.1,
            max_tokens: 512,
            max_embed_chars: 24_000,
            vector_store: VectorStoreKind::default(),
            namespace_prefix: None,
            document_id: None,
            password: None,
            download_timeout_secs: 120,
            run_timeout: None,
            cancel: CancellationToken::new(),
            progress_callback: None,
            generation_backend: None,
            embedding_backend: None,
            layout_source: None,
            vector_store_override: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("output_dir", &self.output_dir)
            .field("model_provider", &self.model_provider)
            .field("table_model", &self.table_model)
            .field("image_model", &self.image_model)
            .field("stages", &self.stages)
            .field("pages", &self.pages)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("max_failure_rate", &self.max_failure_rate)
            .field("use_llm", &self.use_llm)
            .field("dry_run", &self.dry_run)
            .field("vector_store", &self.vector_store)
            .field("namespace_prefix", &self.namespace_prefix)
            .field("document_id", &self.document_id)
            .field("run_timeout", &self.run_timeout)
            .field(
                "generation_backend",
                &self.generation_backend.as_ref().map(|_| "<dyn ModelBackend>"),
            )
            .field(
                "embedding_backend",
                &self.embedding_backend.as_ref().map(|_| "<dyn ModelBackend>"),
            )
            .field("layout_source", &self.layout_source.as_ref().map(|_| "<dyn LayoutSource>"))
            .field(
                "vector_store_override",
                &self.vector_store_override.as_ref().map(|_| "<dyn VectorStore>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Generation model for table summaries.
    pub fn table_model(&self) -> &ModelConfig {
        self.table_model.as_ref().unwrap_or(&self.model_provider.llm)
    }

    /// Generation model for image descriptions.
    pub fn image_model(&self) -> &ModelConfig {
        self.image_model.as_ref().unwrap_or(&self.model_provider.llm)
    }

    /// Apply the optional namespace prefix.
    pub fn namespace(&self, base: &str) -> String {
        match &self.namespace_prefix {
            Some(prefix) => format!("{prefix}{base}"),
            None => base.to_string(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn model_provider(mut self, provider: ModelProvider) -> Self {
        self.config.model_provider = provider;
        self
    }

    pub fn table_model(mut self, model: ModelConfig) -> Self {
        self.config.table_model = Some(model);
        self
    }

    pub fn image_model(mut self, model: ModelConfig) -> Self {
        self.config.image_model = Some(model);
        self
    }

    pub fn stages(mut self, plan: StagePlan) -> Self {
        self.config.stages = plan;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_backoff_ms = ms;
        self
    }

    pub fn max_failure_rate(mut self, rate: f64) -> Self {
        self.config.max_failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn use_llm(mut self, v: bool) -> Self {
        self.config.use_llm = v;
        self
    }

    pub fn dry_run(mut self, v: bool) -> Self {
        self.config.dry_run = v;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_embed_chars(mut self, n: usize) -> Self {
        self.config.max_embed_chars = n;
        self
    }

    pub fn vector_store(mut self, kind: VectorStoreKind) -> Self {
        self.config.vector_store = kind;
        self
    }

    pub fn namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.namespace_prefix = Some(prefix.into());
        self
    }

    pub fn document_id(mut self, id: impl Into<String>) -> Self {
        self.config.document_id = Some(id.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.config.run_timeout = Some(timeout);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.config.cancel = token;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn generation_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.config.generation_backend = Some(backend);
        self
    }

    pub fn embedding_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.config.embedding_backend = Some(backend);
        self
    }

    pub fn layout_source(mut self, source: Arc<dyn LayoutSource>) -> Self {
        self.config.layout_source = Some(source);
        self
    }

    pub fn vector_store_override(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.config.vector_store_override = Some(store);
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// Provider/role combinations are checked here so an impossible setup
    /// (e.g. embeddings from a generation-only provider) fails before any
    /// stage starts.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if !(0.0..=1.0).contains(&c.max_failure_rate) {
            return Err(PipelineError::InvalidConfig(format!(
                "max_failure_rate must be within 0–1, got {}",
                c.max_failure_rate
            )));
        }
        if c.max_embed_chars == 0 {
            return Err(PipelineError::InvalidConfig("max_embed_chars must be ≥ 1".into()));
        }
        if let Some(id) = &c.document_id {
            if crate::pipeline::input::slugify(id).is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "document id '{id}' has no usable characters"
                )));
            }
        }
        c.stages.validate()?;
        c.model_provider.validate()?;
        if let Some(m) = &c.table_model {
            m.validate(ModelRole::Generation)?;
        }
        if let Some(m) = &c.image_model {
            m.validate(ModelRole::Generation)?;
        }
        Ok(self.config)
    }
}

// ── Stages ───────────────────────────────────────────────────────────────

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Enrich,
    BuildNodes,
    Embed,
    Index,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Extract,
        Stage::Enrich,
        Stage::BuildNodes,
        Stage::Embed,
        Stage::Index,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Enrich => "enrich",
            Stage::BuildNodes => "build_nodes",
            Stage::Embed => "embed",
            Stage::Index => "index",
        }
    }

    /// The stage whose output this stage consumes.
    pub fn prerequisite(&self) -> Option<Stage> {
        match self {
            Stage::Extract => None,
            Stage::Enrich => Some(Stage::Extract),
            Stage::BuildNodes => Some(Stage::Enrich),
            Stage::Embed => Some(Stage::BuildNodes),
            Stage::Index => Some(Stage::Embed),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalised || (normalised == "nodes" && *stage == Stage::BuildNodes))
            .ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "unknown stage '{s}' (expected extract, enrich, build_nodes, embed or index)"
                ))
            })
    }
}

/// Which stages a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    /// First stage to run. Earlier stages must already be complete on disk.
    pub from: Stage,
    /// Last stage to run (inclusive). Default: index.
    pub until: Stage,
    /// Start at the first stage the manifest does not mark complete,
    /// ignoring `from`.
    pub resume: bool,
    pub skip_embed: bool,
    pub skip_index: bool,
}

impl Default for StagePlan {
    fn default() -> Self {
        Self {
            from: Stage::Extract,
            until: Stage::Index,
            resume: false,
            skip_embed: false,
            skip_index: false,
        }
    }
}

impl StagePlan {
    /// Run only `[from, until]`.
    pub fn between(from: Stage, until: Stage) -> Self {
        Self {
            from,
            until,
            ..Self::default()
        }
    }

    /// Stages selected by this plan, starting at `from`.
    pub fn stages_from(&self, from: Stage) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| *s >= from && *s <= self.until)
            .filter(|s| !(self.skip_embed && *s == Stage::Embed))
            .filter(|s| !(self.skip_index && *s == Stage::Index))
            .collect()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.stages_from(self.from)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.from > self.until {
            return Err(PipelineError::InvalidConfig(format!(
                "stage range is empty: '{}' comes after '{}'",
                self.from, self.until
            )));
        }
        if !self.resume && self.stages().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "every selected stage is skipped; nothing to run".into(),
            ));
        }
        Ok(())
    }
}

// ── Vector store selection ───────────────────────────────────────────────

/// Vector store backing the index stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VectorStoreKind {
    /// Pinecone serverless index, addressed by its data-plane host
    /// (`PINECONE_INDEX_HOST` when `None`).
    Pinecone { index_host: Option<String> },
    /// In-process store, optionally persisted to a JSON file.
    Local { path: Option<PathBuf> },
}

impl Default for VectorStoreKind {
    fn default() -> Self {
        VectorStoreKind::Pinecone { index_host: None }
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of the PDF to extract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Every page (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

impl FromStr for PageSelection {
    type Err = PipelineError;

    /// Parse `"all"`, `"5"`, `"1-10"` or `"1,3,5-7"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(PageSelection::All);
        }
        let bad = || PipelineError::InvalidConfig(format!("invalid page selection '{s}'"));
        let parse_num = |t: &str| t.trim().parse::<usize>().map_err(|_| bad());

        if !s.contains(',') {
            if let Some((a, b)) = s.split_once('-') {
                let (a, b) = (parse_num(a)?, parse_num(b)?);
                if a == 0 || b < a {
                    return Err(bad());
                }
                return Ok(PageSelection::Range(a, b));
            }
            let n = parse_num(s)?;
            return if n == 0 { Err(bad()) } else { Ok(PageSelection::Single(n)) };
        }

        let mut pages = Vec::new();
        for part in s.split(',') {
            match part.split_once('-') {
                Some((a, b)) => {
                    let (a, b) = (parse_num(a)?, parse_num(b)?);
                    if a == 0 || b < a {
                        return Err(bad());
                    }
                    pages.extend(a..=b);
                }
                None => {
                    let n = parse_num(part)?;
                    if n == 0 {
                        return Err(bad());
                    }
                    pages.push(n);
                }
            }
        }
        Ok(PageSelection::Set(pages))
    }
}
