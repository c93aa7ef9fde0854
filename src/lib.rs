//! # edgequake-pdf2nodes
//!
//! Turn policy PDFs into embedded, indexed retrieval nodes that remember
//! where on the page they came from.
//!
//! ## Why this crate?
//!
//! Retrieval over insurance and benefits policies fails in two typical ways:
//! tables get flattened into unreadable text, and answers cannot be traced
//! back to the page. This crate keeps tables as tables (one node for the
//! whole table, one per row), splits prose into sections, paragraphs and
//! sentences linked by `parent_id`, and gives every node page coordinates a
//! viewer can use to highlight the source.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Extract      positioned text + images via pdfium → table/text/image records
//!  ├─ 2. Enrich       titles and captions for tables and figures (LLM, with fallback)
//!  ├─ 3. Build nodes  table_full/table_row, section/paragraph/sentence, image
//!  ├─ 4. Embed        provider-sized batches, per-node failure isolation
//!  └─ 5. Index        idempotent upsert by node id, one namespace per node type
//! ```
//!
//! Every stage persists its output under `<output_dir>/<document_id>/` before
//! the next one starts, so runs can resume or stop after any stage.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2nodes::{run_pipeline, ModelProvider, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // LLM_PROVIDER / EMBEDDING_PROVIDER with OPENAI_API_KEY etc.
//!     let config = PipelineConfig::builder()
//!         .model_provider(ModelProvider::from_env()?)
//!         .build()?;
//!     let report = run_pipeline("policy.pdf", &config).await?;
//!     eprintln!("{} failed items", report.total_failures());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2nodes` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-pdf2nodes = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod provider;
pub mod report;
pub mod retry;
pub mod run;
pub mod search;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{BackendError, LocalBackend, ModelBackend, RemoteBackend};
pub use config::{PageSelection, PipelineConfig, PipelineConfigBuilder, Stage, StagePlan, VectorStoreKind};
pub use error::{FailureKind, ItemError, PipelineError};
pub use model::{
    Coordinates, EnrichedRecord, EnrichmentStatus, Node, NodeMetadata, NodeType, RawRecord, RecordKind, Rect,
};
pub use pipeline::index::{LocalVectorStore, PineconeStore, QueryMatch, VectorRecord, VectorStore};
pub use pipeline::layout::{DocumentMetadata, LayoutSource, PdfiumLayoutSource};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use provider::{ModelConfig, ModelProvider, ModelRole, ProviderKind};
pub use report::{ItemOutcome, RunReport, StageReport};
pub use retry::RetryPolicy;
pub use run::{inspect, load_nodes, run_pipeline, run_pipeline_sync};
pub use search::{search, SearchHit};
pub use store::{Manifest, StageStore};
