//! Durable, stage-scoped artifact storage.
//!
//! Each document gets a directory under the output root:
//!
//! ```text
//! <output_dir>/<document_id>/
//!   manifest.json                      stage status + source fingerprint
//!   raw/{tables,text,images}/page-NNNN.json
//!   images/figures/pNNNN-KK.png
//!   enriched/{tables,images}/page-NNNN.json
//!   nodes/<node_type>/page-NNNN.json
//!   embedded/<node_type>/page-NNNN.json
//!   report.json
//! ```
//!
//! Every file is written atomically (temp file + rename), so a crash leaves
//! either the previous version or the new one, never a torn file. Output is
//! partitioned by kind and page so a resumed stage can keep what an
//! interrupted run already finished.

use crate::config::Stage;
use crate::error::PipelineError;
use crate::model::{EnrichedRecord, Node, NodeType, RawRecord, RecordKind};
use crate::report::RunReport;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const MANIFEST_FILE: &str = "manifest.json";
const REPORT_FILE: &str = "report.json";
const MANIFEST_VERSION: u32 = 1;

/// Whether a stage's persisted output is whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Complete,
    /// Interrupted; the partitions on disk are valid but not exhaustive.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub state: StageState,
    pub updated_at_ms: u64,
}

/// Per-document run bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub document_id: String,
    pub source_file: String,
    /// Hex SHA-256 of the source PDF.
    pub fingerprint: String,
    pub stages: BTreeMap<Stage, StageStatus>,
}

impl Manifest {
    pub fn new(document_id: impl Into<String>, source_file: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            document_id: document_id.into(),
            source_file: source_file.into(),
            fingerprint: fingerprint.into(),
            stages: BTreeMap::new(),
        }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        matches!(
            self.stages.get(&stage),
            Some(StageStatus {
                state: StageState::Complete,
                ..
            })
        )
    }

    pub fn mark(&mut self, stage: Stage, state: StageState) {
        self.stages.insert(
            stage,
            StageStatus {
                state,
                updated_at_ms: epoch_ms(),
            },
        );
    }

    /// Forget `stage` and everything downstream of it.
    pub fn invalidate_from(&mut self, stage: Stage) {
        self.stages.retain(|s, _| *s < stage);
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Artifact store rooted at one document's output directory.
#[derive(Debug, Clone)]
pub struct StageStore {
    root: PathBuf,
}

impl StageStore {
    pub fn new(output_dir: impl AsRef<Path>, document_id: &str) -> Self {
        Self {
            root: output_dir.as_ref().join(document_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a store-relative path.
    pub fn resolve(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    // ── Generic I/O ──────────────────────────────────────────────────────

    /// Write bytes atomically: temp file in the same directory, then rename.
    pub async fn write_bytes(&self, rel: impl AsRef<Path>, bytes: &[u8]) -> Result<(), PipelineError> {
        let path = self.resolve(rel);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PipelineError::ArtifactIo { path, source }
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        tokio::fs::write(&tmp_path, bytes).await.map_err(io_err(&tmp_path))?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(io_err(&path))?;
        debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    pub async fn write_json<T: Serialize + ?Sized>(&self, rel: impl AsRef<Path>, value: &T) -> Result<(), PipelineError> {
        let rel = rel.as_ref();
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| PipelineError::ArtifactFormat {
            path: self.resolve(rel),
            detail: e.to_string(),
        })?;
        self.write_bytes(rel, &bytes).await
    }

    /// Read a JSON artifact; `Ok(None)` when the file does not exist.
    pub async fn read_json<T: DeserializeOwned>(&self, rel: impl AsRef<Path>) -> Result<Option<T>, PipelineError> {
        let path = self.resolve(rel);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PipelineError::ArtifactIo { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PipelineError::ArtifactFormat {
                path,
                detail: e.to_string(),
            })
    }

    /// Read every `page-NNNN.json` partition under `dir`, in page order.
    async fn read_partitions<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>, PipelineError> {
        let abs = self.resolve(dir);
        let mut entries = match tokio::fs::read_dir(&abs).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PipelineError::ArtifactIo { path: abs, source }),
        };
        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with("page-") && name.ends_with(".json") {
                        names.push(name);
                    }
                }
                Ok(None) => break,
                Err(source) => return Err(PipelineError::ArtifactIo { path: abs, source }),
            }
        }
        names.sort();

        let mut out = Vec::new();
        for name in names {
            let items: Option<Vec<T>> = self.read_json(format!("{dir}/{name}")).await?;
            out.extend(items.unwrap_or_default());
        }
        Ok(out)
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.resolve(rel).exists()
    }

    /// Remove a store-relative directory if present.
    pub async fn remove_dir(&self, rel: &str) -> Result<(), PipelineError> {
        let path = self.resolve(rel);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PipelineError::ArtifactIo { path, source }),
        }
    }

    /// Delete everything a stage writes, ahead of a fresh run of that stage.
    pub async fn clear_stage(&self, stage: Stage) -> Result<(), PipelineError> {
        for dir in stage_dirs(stage) {
            self.remove_dir(dir).await?;
        }
        Ok(())
    }

    // ── Manifest and report ──────────────────────────────────────────────

    pub async fn load_manifest(&self) -> Result<Option<Manifest>, PipelineError> {
        self.read_json(MANIFEST_FILE).await
    }

    pub async fn save_manifest(&self, manifest: &Manifest) -> Result<(), PipelineError> {
        self.write_json(MANIFEST_FILE, manifest).await
    }

    pub async fn save_report(&self, report: &RunReport) -> Result<(), PipelineError> {
        self.write_json(REPORT_FILE, report).await
    }

    pub async fn load_report(&self) -> Result<Option<RunReport>, PipelineError> {
        self.read_json(REPORT_FILE).await
    }

    // ── Typed partitions ─────────────────────────────────────────────────

    pub async fn write_raw(&self, kind: RecordKind, page: u32, records: &[RawRecord]) -> Result<(), PipelineError> {
        self.write_json(partition("raw", kind.dir_name(), page), records).await
    }

    pub async fn read_raw(&self, kind: RecordKind) -> Result<Vec<RawRecord>, PipelineError> {
        self.read_partitions(&format!("raw/{}", kind.dir_name())).await
    }

    pub async fn write_enriched(
        &self,
        kind: RecordKind,
        page: u32,
        records: &[EnrichedRecord],
    ) -> Result<(), PipelineError> {
        self.write_json(partition("enriched", kind.dir_name(), page), records).await
    }

    pub async fn read_enriched(&self, kind: RecordKind) -> Result<Vec<EnrichedRecord>, PipelineError> {
        self.read_partitions(&format!("enriched/{}", kind.dir_name())).await
    }

    pub async fn write_nodes(&self, node_type: NodeType, page: u32, nodes: &[Node]) -> Result<(), PipelineError> {
        self.write_json(partition("nodes", node_type.as_str(), page), nodes).await
    }

    pub async fn read_nodes(&self, node_type: NodeType) -> Result<Vec<Node>, PipelineError> {
        self.read_partitions(&format!("nodes/{}", node_type.as_str())).await
    }

    pub async fn write_embedded(&self, node_type: NodeType, page: u32, nodes: &[Node]) -> Result<(), PipelineError> {
        self.write_json(partition("embedded", node_type.as_str(), page), nodes).await
    }

    pub async fn read_embedded(&self, node_type: NodeType) -> Result<Vec<Node>, PipelineError> {
        self.read_partitions(&format!("embedded/{}", node_type.as_str())).await
    }

    /// Store-relative path for figure `index` on `page`.
    pub fn figure_path(page: u32, index: u32) -> String {
        format!("images/figures/p{page:04}-{index:02}.png")
    }
}

/// Store-relative path of one page partition, e.g. `raw/tables/page-0002.json`.
pub fn partition(stage_dir: &str, kind_dir: &str, page: u32) -> String {
    format!("{stage_dir}/{kind_dir}/page-{page:04}.json")
}

fn stage_dirs(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Extract => &["raw", "images"],
        Stage::Enrich => &["enriched"],
        Stage::BuildNodes => &["nodes"],
        Stage::Embed => &["embedded"],
        Stage::Index => &[],
    }
}
