//! CLI binary for edgequake-pdf2nodes.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_pdf2nodes::{
    inspect, run_pipeline, search, ModelConfig, ModelProvider, ModelRole, NodeType, PageSelection, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, RunReport, Stage, StagePlan, StageReport, VectorStoreKind,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar, re-armed at the start of every stage. Items
/// settle out of order, so only counts are shown on the bar; failures are
/// printed above it as they happen.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, total_items: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold:<12} [{bar:42.green/238}] {pos:>4}/{len} {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.set_length(total_items as u64);
        self.bar.set_position(0);
        self.bar.set_prefix(stage.as_str().to_string());
        self.bar.set_message("");
        self.bar.reset_elapsed();
        self.errors.store(0, Ordering::SeqCst);
    }

    fn on_item_complete(&self, _stage: Stage, _item: &str) {
        self.bar.inc(1);
    }

    fn on_item_error(&self, _stage: Stage, item: &str, error: &str) {
        let n = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        let msg: String = if error.chars().count() > 90 {
            format!("{}…", error.chars().take(89).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!("  {} {}  {}", red("✗"), item, red(&msg)));
        self.bar.set_message(red(&format!("{n} failed")));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, stage: Stage, report: &StageReport) {
        let marker = if report.failed == 0 { green("✓") } else { cyan("⚠") };
        let produced = report
            .produced
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let fallback = if report.degraded > 0 {
            format!(" ({} fallback)", report.degraded)
        } else {
            String::new()
        };
        self.bar.println(format!(
            "{} {:<12} {:>4} ok  {:>3} failed{}  {:>3} skipped  {}  {}",
            marker,
            bold(stage.as_str()),
            report.succeeded,
            report.failed,
            fallback,
            report.skipped,
            dim(&produced),
            dim(&format!("{:.1}s", report.duration_ms as f64 / 1000.0)),
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full run: extract, enrich, build nodes, embed, index into Pinecone
  pdf2nodes run policy.pdf

  # Offline run with the local backends and a JSON vector store
  pdf2nodes run policy.pdf --llm-provider local --embedding-provider local \
      --vector-store local --local-store output/vectors.json

  # Inspect nodes only (no embedding, no indexing)
  pdf2nodes run policy.pdf --skip-embed --skip-index

  # Later: embed and index the persisted nodes
  pdf2nodes run policy.pdf --from embed

  # Pick up an interrupted run
  pdf2nodes run policy.pdf --resume

  # How many generation calls would enrichment make?
  pdf2nodes run policy.pdf --until enrich --dry-run

  # Query the index
  pdf2nodes search "room and board limit" --top-k 5 --types table_row,sentence

  # PDF metadata (no API key needed)
  pdf2nodes inspect policy.pdf

ENVIRONMENT VARIABLES:
  LLM_PROVIDER / LLM_MODEL               Generation model (default openai / gpt-4o-mini)
  EMBEDDING_PROVIDER / EMBEDDING_MODEL   Embedding model (default openai / text-embedding-3-small)
  OPENAI_API_KEY, OPENAI_BASE_URL        OpenAI credentials / compatible endpoint
  ANTHROPIC_API_KEY                      Anthropic (generation only)
  GEMINI_API_KEY or GOOGLE_API_KEY       Google Gemini
  OLLAMA_HOST                            Ollama server (default http://localhost:11434)
  PINECONE_API_KEY, PINECONE_INDEX_HOST  Pinecone index
  PDFIUM_LIB_PATH                        libpdfium file or directory
  RUST_LOG                               Log filter, overrides --verbose
"#;

/// Turn policy PDFs into embedded, indexed retrieval nodes.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2nodes",
    version,
    about = "Turn policy PDFs into embedded, indexed retrieval nodes",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2NODES_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2NODES_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline over one PDF file or URL.
    Run(RunArgs),
    /// Search indexed nodes.
    Search(SearchArgs),
    /// Print PDF metadata only.
    Inspect {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
        /// PDF user password for encrypted documents.
        #[arg(long, env = "PDF2NODES_PASSWORD")]
        password: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

/// Embedding model and vector store: shared by `run` and `search`.
#[derive(Args, Debug)]
struct IndexArgs {
    /// Embedding provider: openai, gemini, ollama, local.
    #[arg(long, env = "EMBEDDING_PROVIDER", default_value = "openai")]
    embedding_provider: String,

    /// Embedding model ID (provider default when unset).
    #[arg(long, env = "EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    /// Vector store: pinecone or local.
    #[arg(long, env = "PDF2NODES_VECTOR_STORE", default_value = "pinecone")]
    vector_store: String,

    /// Pinecone index host.
    #[arg(long, env = "PINECONE_INDEX_HOST")]
    index_host: Option<String>,

    /// JSON file backing the local vector store (in-memory when unset).
    #[arg(long, env = "PDF2NODES_LOCAL_STORE")]
    local_store: Option<PathBuf>,

    /// Prefix for every namespace, e.g. "staging-".
    #[arg(long, env = "PDF2NODES_NAMESPACE_PREFIX")]
    namespace_prefix: Option<String>,
}

impl IndexArgs {
    fn vector_store(&self) -> Result<VectorStoreKind> {
        match self.vector_store.trim().to_ascii_lowercase().as_str() {
            "pinecone" => Ok(VectorStoreKind::Pinecone {
                index_host: self.index_host.clone(),
            }),
            "local" => Ok(VectorStoreKind::Local {
                path: self.local_store.clone(),
            }),
            other => anyhow::bail!("Unknown vector store '{other}' (expected pinecone or local)"),
        }
    }

    fn embedding(&self) -> Result<ModelConfig> {
        Ok(ModelConfig::parse(
            &self.embedding_provider,
            self.embedding_model.as_deref(),
            ModelRole::Embedding,
        )?)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Root directory for stage output.
    #[arg(short, long, env = "PDF2NODES_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Generation provider: openai, anthropic, gemini, ollama, local.
    #[arg(long, env = "LLM_PROVIDER", default_value = "openai")]
    llm_provider: String,

    /// Generation model ID (provider default when unset).
    #[arg(long, env = "LLM_MODEL")]
    llm_model: Option<String>,

    /// Provider for table summaries, overriding --llm-provider.
    #[arg(long, env = "PDF2NODES_TABLE_PROVIDER")]
    table_provider: Option<String>,

    /// Model for table summaries.
    #[arg(long, env = "PDF2NODES_TABLE_MODEL")]
    table_model: Option<String>,

    /// Provider for image descriptions, overriding --llm-provider.
    #[arg(long, env = "PDF2NODES_IMAGE_PROVIDER")]
    image_provider: Option<String>,

    /// Model for image descriptions.
    #[arg(long, env = "PDF2NODES_IMAGE_MODEL")]
    image_model: Option<String>,

    #[command(flatten)]
    index: IndexArgs,

    /// First stage: extract, enrich, build_nodes, embed, index.
    #[arg(long, default_value = "extract")]
    from: String,

    /// Last stage (inclusive).
    #[arg(long, default_value = "index")]
    until: String,

    /// Start at the first stage not yet complete on disk.
    #[arg(long)]
    resume: bool,

    /// Stop before the embed stage.
    #[arg(long, env = "PDF2NODES_SKIP_EMBED")]
    skip_embed: bool,

    /// Stop before the index stage.
    #[arg(long, env = "PDF2NODES_SKIP_INDEX")]
    skip_index: bool,

    /// Page selection: all, 5, 3-15, or 1,3,5-7.
    #[arg(long, env = "PDF2NODES_PAGES", default_value = "all")]
    pages: String,

    /// Maximum in-flight backend calls per stage.
    #[arg(short, long, env = "PDF2NODES_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,

    /// Retries for transient backend and vector-store failures.
    #[arg(long, env = "PDF2NODES_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Delay before the first retry in milliseconds, doubled each retry.
    #[arg(long, env = "PDF2NODES_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Highest tolerated fraction of failed items per stage (0–1).
    #[arg(long, env = "PDF2NODES_MAX_FAILURE_RATE", default_value_t = 0.5)]
    max_failure_rate: f64,

    /// Skip generation: tables and figures get their fallback descriptions.
    #[arg(long, env = "PDF2NODES_NO_LLM")]
    no_llm: bool,

    /// Count enrichment calls without making them, then stop.
    #[arg(long)]
    dry_run: bool,

    /// Generation temperature.
    #[arg(long, env = "PDF2NODES_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Max tokens per generated description.
    #[arg(long, env = "PDF2NODES_MAX_TOKENS", default_value_t = 512)]
    max_tokens: usize,

    /// Node text longer than this many characters is not embedded.
    #[arg(long, env = "PDF2NODES_MAX_EMBED_CHARS", default_value_t = 24_000)]
    max_embed_chars: usize,

    /// Override the document id derived from the file name.
    #[arg(long, env = "PDF2NODES_DOCUMENT_ID")]
    document_id: Option<String>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2NODES_PASSWORD")]
    password: Option<String>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2NODES_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Stop dispatching new work after this many seconds.
    #[arg(long, env = "PDF2NODES_TIMEOUT")]
    timeout: Option<u64>,

    /// Print the run report as JSON.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2NODES_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Natural-language query.
    query: String,

    /// Number of hits.
    #[arg(short = 'k', long, default_value_t = 5)]
    top_k: usize,

    /// Node types to search, comma separated (all when unset).
    #[arg(long, value_delimiter = ',')]
    types: Vec<String>,

    #[command(flatten)]
    index: IndexArgs,

    /// Print hits as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = match &cli.command {
        Command::Run(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Inspect { input, password, json } => run_inspect(&input, password.as_deref(), json).await,
        Command::Search(args) => run_search(args).await,
        Command::Run(args) => run_run(args, show_progress, cli.quiet).await,
    }
}

async fn run_inspect(input: &str, password: Option<&str>, json: bool) -> Result<()> {
    let meta = inspect(input, password).await.context("Failed to inspect PDF")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
        );
        return Ok(());
    }
    println!("File:         {}", input);
    if let Some(ref t) = meta.title {
        println!("Title:        {}", t);
    }
    if let Some(ref a) = meta.author {
        println!("Author:       {}", a);
    }
    if let Some(ref s) = meta.subject {
        println!("Subject:      {}", s);
    }
    println!("Pages:        {}", meta.page_count);
    println!("PDF Version:  {}", meta.pdf_version);
    if let Some(ref p) = meta.producer {
        println!("Producer:     {}", p);
    }
    if let Some(ref c) = meta.creator {
        println!("Creator:      {}", c);
    }
    Ok(())
}

async fn run_run(args: RunArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let progress = show_progress.then(CliProgressCallback::new);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} interrupt: finishing in-flight work, run again with --resume", cyan("◆"));
                cancel.cancel();
            }
        });
    }

    let config = build_run_config(
        &args,
        progress.clone().map(|cb| cb as ProgressCallback),
        cancel,
    )?;
    let result = run_pipeline(&args.input, &config).await;
    if let Some(cb) = &progress {
        cb.finish();
    }
    let report = result.context("Pipeline run failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !quiet {
        print_summary(&report, &config);
    }
    Ok(())
}

fn print_summary(report: &RunReport, config: &PipelineConfig) {
    if let Some(planned) = report.planned_generation_calls {
        eprintln!(
            "{} dry run: enrichment would make {} generation calls",
            cyan("◆"),
            bold(&planned.to_string())
        );
    }
    let failures = report.failures_by_kind();
    let total_failures: usize = failures.values().sum();
    let marker = if report.cancelled {
        cyan("⚠")
    } else if total_failures == 0 {
        green("✔")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{}  {}  {} stages  {}ms  →  {}",
        marker,
        bold(&report.document_id),
        report.stages.len(),
        report.total_duration_ms,
        bold(&config.output_dir.join(&report.document_id).display().to_string()),
    );
    if total_failures > 0 {
        let by_kind = failures
            .iter()
            .map(|(k, v)| format!("{k:?}={v}").to_lowercase())
            .collect::<Vec<_>>()
            .join(", ");
        eprintln!("   {} failed items ({})", red(&total_failures.to_string()), by_kind);
    }
    if report.cancelled {
        eprintln!("   run interrupted; re-run with {} to finish", bold("--resume"));
    }
}

async fn run_search(args: SearchArgs) -> Result<()> {
    let types = args
        .types
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.trim().parse::<NodeType>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    let embedding = args.index.embedding()?;
    let llm = ModelConfig::default_for(embedding.provider, ModelRole::Generation);
    let mut builder = PipelineConfig::builder()
        .model_provider(ModelProvider::new(llm, embedding))
        .vector_store(args.index.vector_store()?);
    if let Some(prefix) = &args.index.namespace_prefix {
        builder = builder.namespace_prefix(prefix);
    }
    let config = builder.build().context("Invalid configuration")?;

    let hits = search(&args.query, args.top_k, &types, &config)
        .await
        .context("Search failed")?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&hits).context("Failed to serialise hits")?
        );
        return Ok(());
    }
    if hits.is_empty() {
        eprintln!("{} no matches", cyan("◆"));
    }
    for (i, hit) in hits.iter().enumerate() {
        let kind = hit.node_type.map(|t| t.as_str()).unwrap_or("?");
        let page = hit.page.map(|p| p.to_string()).unwrap_or_else(|| "?".into());
        println!(
            "{:>2}. {}  {}  {}",
            i + 1,
            bold(&format!("{:.3}", hit.score)),
            cyan(&format!("{kind} p{page}")),
            dim(&hit.id)
        );
        println!("    {}", hit.text.replace('\n', " "));
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_run_config(
    args: &RunArgs,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
) -> Result<PipelineConfig> {
    let llm = ModelConfig::parse(&args.llm_provider, args.llm_model.as_deref(), ModelRole::Generation)?;
    let override_model = |provider: &Option<String>, model: &Option<String>| -> Result<Option<ModelConfig>> {
        if provider.is_none() && model.is_none() {
            return Ok(None);
        }
        let provider = provider.as_deref().unwrap_or(&args.llm_provider);
        let model = model.as_deref().or(if provider == args.llm_provider {
            args.llm_model.as_deref()
        } else {
            None
        });
        Ok(Some(ModelConfig::parse(provider, model, ModelRole::Generation)?))
    };

    let plan = StagePlan {
        from: args.from.parse::<Stage>()?,
        until: args.until.parse::<Stage>()?,
        resume: args.resume,
        skip_embed: args.skip_embed,
        skip_index: args.skip_index,
    };

    let mut builder = PipelineConfig::builder()
        .output_dir(&args.output_dir)
        .model_provider(ModelProvider::new(llm, args.index.embedding()?))
        .stages(plan)
        .pages(args.pages.parse::<PageSelection>()?)
        .concurrency(args.concurrency)
        .max_retries(args.max_retries)
        .retry_backoff_ms(args.retry_backoff_ms)
        .max_failure_rate(args.max_failure_rate)
        .use_llm(!args.no_llm)
        .dry_run(args.dry_run)
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .max_embed_chars(args.max_embed_chars)
        .vector_store(args.index.vector_store()?)
        .download_timeout_secs(args.download_timeout)
        .cancel_token(cancel);

    if let Some(m) = override_model(&args.table_provider, &args.table_model)? {
        builder = builder.table_model(m);
    }
    if let Some(m) = override_model(&args.image_provider, &args.image_model)? {
        builder = builder.image_model(m);
    }
    if let Some(prefix) = &args.index.namespace_prefix {
        builder = builder.namespace_prefix(prefix);
    }
    if let Some(id) = &args.document_id {
        builder = builder.document_id(id);
    }
    if let Some(pwd) = &args.password {
        builder = builder.password(pwd);
    }
    if let Some(secs) = args.timeout {
        builder = builder.run_timeout(Duration::from_secs(secs));
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
