//! Pipeline stages for PDF-to-nodes conversion.
//!
//! Each submodule implements one transformation step and can be tested on
//! its own; [`crate::run`] sequences them and owns the manifest.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ layout ──▶ extract ──▶ enrich ──▶ nodes ──▶ embed ──▶ index
//! (path/URL) (pdfium)  (records)   (LLM)     (split)   (vectors) (upsert)
//! ```
//!
//! 1. [`input`]   resolve the path or URL, derive document id + fingerprint
//! 2. [`layout`]  read positioned spans and images; `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`extract`] detect tables, text blocks and figures per page
//! 4. [`enrich`]  caption tables and figures with the generation backend
//! 5. [`nodes`]   split records into sections, paragraphs, sentences, rows
//! 6. [`embed`]   attach vectors in provider-sized batches
//! 7. [`index`]   upsert into the vector store by stable node id
//!
//! [`normalize`] and [`encode`] are shared helpers.

pub mod embed;
pub mod encode;
pub mod enrich;
pub mod extract;
pub mod index;
pub mod input;
pub mod layout;
pub mod nodes;
pub mod normalize;

use crate::config::Stage;
use crate::error::ItemError;
use crate::progress::ProgressCallback;
use crate::report::{ItemOutcome, StageReport};
use crate::retry::RetryPolicy;
use crate::store::StageStore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What every stage needs besides its own inputs.
#[derive(Clone)]
pub struct StageContext {
    pub document_id: String,
    pub source_file: String,
    pub store: StageStore,
    /// Maximum in-flight backend calls.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
    pub progress: ProgressCallback,
}

impl StageContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Count an outcome in `report` and forward it to the progress callback.
    pub fn settle<T>(&self, stage: Stage, report: &mut StageReport, outcome: &ItemOutcome<T>) {
        report.record(outcome);
        match &outcome.error {
            None => self.progress.on_item_complete(stage, &outcome.item),
            Some(e) => {
                if !matches!(e, ItemError::Cancelled { .. }) {
                    warn!(stage = %stage, item = %outcome.item, "{}", e);
                }
                self.progress.on_item_error(stage, &outcome.item, &e.to_string());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for stage unit tests.

    use super::*;
    use crate::progress::NoopProgressCallback;
    use std::sync::Arc;

    pub fn context(dir: &std::path::Path) -> StageContext {
        StageContext {
            document_id: "doc".into(),
            source_file: "doc.pdf".into(),
            store: StageStore::new(dir, "doc"),
            concurrency: 4,
            retry: RetryPolicy::none(),
            cancel: CancellationToken::new(),
            progress: Arc::new(NoopProgressCallback),
        }
    }
}
