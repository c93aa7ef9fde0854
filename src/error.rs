//! Error types for the edgequake-pdf2nodes library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] is **fatal**: the run cannot proceed at all (bad input
//!   file, missing credentials, unsupported provider, artifact store
//!   unreadable). Returned as `Err(PipelineError)` from [`crate::run_pipeline`]
//!   and friends.
//!
//! * [`ItemError`] is **non-fatal**: one page, table, image, node or vector
//!   batch failed but everything else is fine. Stored inside
//!   [`crate::report::StageReport`] so the run report shows partial success
//!   instead of losing the document to one bad item.
//!
//! Item failures only become fatal when a stage's failure rate crosses the
//! configured threshold ([`PipelineError::FailureThresholdExceeded`]).

use crate::config::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2nodes library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium (file or directory) or install\n\
pdfium where the system loader can find it.\n"
    )]
    PdfiumUnavailable(String),

    // ── Configuration errors ──────────────────────────────────────────────
    /// Provider name is not one of the supported variants.
    #[error("Unsupported model provider '{provider}' for {role}.\n{hint}")]
    UnsupportedProvider {
        provider: String,
        role: String,
        hint: String,
    },

    /// A credential required by the selected provider is absent.
    #[error("Provider '{provider}' requires {var} to be set.")]
    MissingCredential { provider: String, var: String },

    /// Builder validation or CLI argument validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The embedding backend rejected the run as a whole (bad key, unknown
    /// model). Retrying or skipping items cannot help.
    #[error("Embedding aborted by provider '{provider}': {detail}")]
    EmbeddingAborted { provider: String, detail: String },

    // ── Run control ───────────────────────────────────────────────────────
    /// A resumed run needs the output of a stage that never completed.
    #[error("Stage '{stage}' has no completed output for document '{document_id}'.\nRe-run from an earlier stage.")]
    StageNotComplete { stage: Stage, document_id: String },

    /// The PDF on disk is not the one the persisted stages were built from.
    #[error("Source PDF changed since stage output was written (expected fingerprint {expected}, found {found}).\nRe-run from the extract stage.")]
    SourceChanged { expected: String, found: String },

    /// Too many items failed within one stage.
    #[error("Stage '{stage}': {failed}/{total} items failed, above the allowed rate of {max_rate:.2}")]
    FailureThresholdExceeded {
        stage: Stage,
        failed: usize,
        total: usize,
        max_rate: f64,
    },

    // ── Artifact errors ───────────────────────────────────────────────────
    /// Could not read or write a persisted stage artifact.
    #[error("Failed to access artifact '{path}': {source}")]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted artifact exists but does not parse.
    #[error("Artifact '{path}' is malformed: {detail}")]
    ArtifactFormat { path: PathBuf, detail: String },

    // ── Query path ────────────────────────────────────────────────────────
    /// Embedding the query or looking it up in the vector store failed.
    #[error("Search failed: {detail}")]
    SearchFailed { detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single item of work.
///
/// Recorded in [`crate::report::StageReport`]; the run continues.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ItemError {
    /// A page could not be parsed; it contributes zero records.
    #[error("Page {page}: extraction failed: {detail}")]
    Extraction { page: u32, detail: String },

    /// Generation failed after retries; a deterministic fallback was stored.
    #[error("{item}: enrichment failed after {attempts} attempts: {detail}")]
    Enrichment {
        item: String,
        attempts: u32,
        detail: String,
    },

    /// The embedding backend rejected this node's text.
    #[error("{node_id}: embedding rejected: {detail}")]
    Embedding { node_id: String, detail: String },

    /// The vector store did not accept this node's batch.
    #[error("{node_id}: indexing failed after {attempts} attempts: {detail}")]
    Indexing {
        node_id: String,
        attempts: u32,
        detail: String,
    },

    /// Work was not dispatched because the run was cancelled or timed out.
    #[error("{item}: not processed, run cancelled")]
    Cancelled { item: String },
}

/// Coarse failure classes aggregated in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Extraction,
    Enrichment,
    Embedding,
    Indexing,
    Cancelled,
}

impl ItemError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ItemError::Extraction { .. } => FailureKind::Extraction,
            ItemError::Enrichment { .. } => FailureKind::Enrichment,
            ItemError::Embedding { .. } => FailureKind::Embedding,
            ItemError::Indexing { .. } => FailureKind::Indexing,
            ItemError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_display() {
        let e = PipelineError::FailureThresholdExceeded {
            stage: Stage::Embed,
            failed: 6,
            total: 10,
            max_rate: 0.5,
        };
        let msg = e.to_string();
        assert!(msg.contains("6/10"), "got: {msg}");
        assert!(msg.contains("embed"), "got: {msg}");
    }

    #[test]
    fn missing_credential_names_variable() {
        let e = PipelineError::MissingCredential {
            provider: "openai".into(),
            var: "OPENAI_API_KEY".into(),
        };
        assert!(e.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn item_error_kinds() {
        let e = ItemError::Extraction {
            page: 2,
            detail: "bad xref".into(),
        };
        assert_eq!(e.kind(), FailureKind::Extraction);
        assert!(e.to_string().contains("Page 2"));

        let e = ItemError::Indexing {
            node_id: "doc::table_row::p2::0.1".into(),
            attempts: 3,
            detail: "503".into(),
        };
        assert_eq!(e.kind(), FailureKind::Indexing);
    }

    #[test]
    fn item_error_serde_roundtrip() {
        let e = ItemError::Embedding {
            node_id: "n1".into(),
            detail: "too long".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: ItemError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
