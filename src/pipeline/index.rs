//! Index stage: upsert embedded nodes into a vector store.
//!
//! Every node becomes `(id, values, metadata)` in the namespace of its node
//! type. Ids are deterministic, so re-indexing an unchanged document
//! overwrites entries instead of adding new ones.
//!
//! Batches follow the store's `max_batch_size` and go through
//! [`retry_transient`]. A batch that still fails reports each of its node ids
//! as unindexed; the remaining batches carry on.

use crate::backend::BackendError;
use crate::config::Stage;
use crate::error::{ItemError, PipelineError};
use crate::model::{Node, NodeType};
use crate::pipeline::StageContext;
use crate::report::{ItemOutcome, StageReport};
use crate::retry::{retry_transient, RetryPolicy};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Longest `text` stored in vector metadata, in characters.
pub const METADATA_TEXT_LIMIT: usize = 1000;

/// One entry in a vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Map<String, Value>,
}

/// A query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Storage for vectors, partitioned into namespaces.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn name(&self) -> String;

    /// Insert or overwrite `records` by id.
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<(), BackendError>;

    /// The `top_k` records nearest to `vector`, best first.
    async fn query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<QueryMatch>, BackendError>;

    /// Largest batch `upsert` accepts.
    fn max_batch_size(&self) -> usize {
        100
    }

    /// Make upserted records durable. No-op for remote stores.
    async fn flush(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

// ── Metadata ─────────────────────────────────────────────────────────────

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Vector metadata for `node`. Absent optional fields are left out rather
/// than stored as null.
pub fn node_metadata(node: &Node) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("text".into(), truncate_chars(&node.text, METADATA_TEXT_LIMIT).into());
    m.insert("page".into(), node.page.into());
    m.insert("node_type".into(), node.node_type.as_str().into());
    m.insert(
        "coordinates".into(),
        serde_json::to_string(&node.coordinates).unwrap_or_default().into(),
    );
    m.insert("document_id".into(), node.metadata.document_id.clone().into());
    m.insert("source_file".into(), node.metadata.source_file.clone().into());
    if let Some(parent) = &node.parent_id {
        m.insert("parent_id".into(), parent.clone().into());
    }
    if let Some(title) = &node.metadata.section_title {
        m.insert("section_title".into(), title.clone().into());
    }
    if let Some(title) = &node.metadata.table_title {
        m.insert("table_title".into(), title.clone().into());
    }
    if !node.metadata.column_headers.is_empty() {
        m.insert("column_headers".into(), node.metadata.column_headers.clone().into());
    }
    if let Some(row) = node.metadata.row_index {
        m.insert("row_index".into(), row.into());
    }
    if let Some(path) = &node.metadata.image_path {
        m.insert("image_path".into(), path.clone().into());
    }
    if let Some(status) = node.metadata.enrichment_status {
        if let Ok(value) = serde_json::to_value(status) {
            m.insert("enrichment_status".into(), value);
        }
    }
    m
}

// ── Pinecone ─────────────────────────────────────────────────────────────

const PINECONE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pinecone serverless index over its REST data plane.
pub struct PineconeStore {
    client: reqwest::Client,
    host: String,
}

#[derive(Serialize)]
struct PineconeUpsert<'a> {
    vectors: &'a [VectorRecord],
    namespace: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PineconeQuery<'a> {
    namespace: &'a str,
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
}

#[derive(Deserialize)]
struct PineconeQueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

impl PineconeStore {
    /// Connect to `index_host` (falls back to `PINECONE_INDEX_HOST`) with
    /// `PINECONE_API_KEY`.
    pub fn from_env(index_host: Option<&str>) -> Result<Self, PipelineError> {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let api_key = env("PINECONE_API_KEY").ok_or_else(|| PipelineError::MissingCredential {
            provider: "pinecone".into(),
            var: "PINECONE_API_KEY".into(),
        })?;
        let host = index_host
            .map(str::to_string)
            .or_else(|| env("PINECONE_INDEX_HOST"))
            .ok_or_else(|| PipelineError::MissingCredential {
                provider: "pinecone".into(),
                var: "PINECONE_INDEX_HOST".into(),
            })?;
        Self::new(&host, &api_key)
    }

    pub fn new(host: &str, api_key: &str) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Api-Key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|e| PipelineError::InvalidConfig(format!("Pinecone API key is not a valid header value: {e}")))?,
        );
        headers.insert("X-Pinecone-API-Version", HeaderValue::from_static("2024-07"));
        let client = reqwest::Client::builder()
            .timeout(PINECONE_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| PipelineError::Internal(format!("failed to build HTTP client: {e}")))?;
        let host = host.trim().trim_end_matches('/');
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        Ok(Self { client, host })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(format!("{}{path}", self.host))
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        Err(BackendError::from_status(status.as_u16(), &body, retry_after))
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    fn name(&self) -> String {
        format!("pinecone/{}", self.host.trim_start_matches("https://"))
    }

    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<(), BackendError> {
        self.post("/vectors/upsert", &PineconeUpsert {
            vectors: records,
            namespace,
        })
        .await?;
        Ok(())
    }

    async fn query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<QueryMatch>, BackendError> {
        let response = self
            .post("/query", &PineconeQuery {
                namespace,
                vector,
                top_k,
                include_metadata: true,
            })
            .await?;
        let parsed: PineconeQueryResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("malformed query response: {e}")))?;
        Ok(parsed.matches)
    }
}

// ── Local ────────────────────────────────────────────────────────────────

type Namespaces = HashMap<String, BTreeMap<String, VectorRecord>>;

/// In-process store with cosine similarity, optionally persisted as JSON.
#[derive(Default)]
pub struct LocalVectorStore {
    namespaces: RwLock<Namespaces>,
    path: Option<PathBuf>,
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

impl LocalVectorStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading it when the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let namespaces: Namespaces = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| PipelineError::ArtifactFormat {
                path: path.clone(),
                detail: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Namespaces::new(),
            Err(source) => return Err(PipelineError::ArtifactIo { path, source }),
        };
        Ok(Self {
            namespaces: RwLock::new(namespaces),
            path: Some(path),
        })
    }

    /// Records stored in `namespace`.
    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces.read().await.get(namespace).map_or(0, BTreeMap::len)
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Option<VectorRecord> {
        self.namespaces.read().await.get(namespace)?.get(id).cloned()
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    fn name(&self) -> String {
        match &self.path {
            Some(p) => format!("local/{}", p.display()),
            None => "local/memory".into(),
        }
    }

    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<(), BackendError> {
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            ns.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<QueryMatch>, BackendError> {
        let namespaces = self.namespaces.read().await;
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<QueryMatch> = ns
            .values()
            .map(|r| QueryMatch {
                id: r.id.clone(),
                score: cosine(vector, &r.values),
                metadata: r.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(top_k);
        Ok(matches)
    }

    fn max_batch_size(&self) -> usize {
        1000
    }

    async fn flush(&self) -> Result<(), BackendError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = {
            let namespaces = self.namespaces.read().await;
            serde_json::to_vec(&*namespaces).map_err(|e| BackendError::Fatal(e.to_string()))?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::Fatal(format!("{}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| BackendError::Fatal(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| BackendError::Fatal(format!("{}: {e}", path.display())))?;
        debug!("Flushed local vector store to {}", path.display());
        Ok(())
    }
}

// ── Indexer ──────────────────────────────────────────────────────────────

/// Upserts nodes into one vector store.
pub struct Indexer {
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
    concurrency: usize,
    namespace_prefix: Option<String>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        retry: RetryPolicy,
        concurrency: usize,
        namespace_prefix: Option<String>,
    ) -> Self {
        Self {
            store,
            retry,
            concurrency: concurrency.max(1),
            namespace_prefix,
        }
    }

    pub fn namespace(&self, node_type: NodeType) -> String {
        format!("{}{}", self.namespace_prefix.as_deref().unwrap_or(""), node_type.namespace())
    }

    async fn upsert_batch(&self, namespace: String, batch: Vec<VectorRecord>) -> Vec<ItemOutcome<()>> {
        let label = format!("upsert {} vectors into {}", batch.len(), namespace);
        let retried = retry_transient(&self.retry, &label, || self.store.upsert(&namespace, &batch)).await;
        match retried.result {
            Ok(()) => batch.iter().map(|r| ItemOutcome::ok(r.id.clone(), ())).collect(),
            Err(e) => batch
                .iter()
                .map(|r| {
                    ItemOutcome::failed(
                        r.id.clone(),
                        ItemError::Indexing {
                            node_id: r.id.clone(),
                            attempts: retried.attempts,
                            detail: e.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Upsert `nodes`. Every input node has exactly one outcome in the result.
    pub async fn index(&self, nodes: Vec<Node>, cancel: &tokio_util::sync::CancellationToken) -> Vec<ItemOutcome<()>> {
        let mut outcomes = Vec::with_capacity(nodes.len());
        let mut by_namespace: BTreeMap<String, Vec<VectorRecord>> = BTreeMap::new();
        for node in nodes {
            let Some(values) = node.embedding.clone() else {
                outcomes.push(ItemOutcome::failed(
                    node.id.clone(),
                    ItemError::Indexing {
                        node_id: node.id.clone(),
                        attempts: 0,
                        detail: "node has no embedding".into(),
                    },
                ));
                continue;
            };
            by_namespace
                .entry(self.namespace(node.node_type))
                .or_default()
                .push(VectorRecord {
                    id: node.id.clone(),
                    values,
                    metadata: node_metadata(&node),
                });
        }

        let size = self.store.max_batch_size().max(1);
        let batches: Vec<(String, Vec<VectorRecord>)> = by_namespace
            .into_iter()
            .flat_map(|(ns, records)| {
                records
                    .chunks(size)
                    .map(|chunk| (ns.clone(), chunk.to_vec()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut results = stream::iter(batches)
            .map(|(namespace, batch)| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return batch
                            .iter()
                            .map(|r| ItemOutcome::failed(r.id.clone(), ItemError::Cancelled { item: r.id.clone() }))
                            .collect();
                    }
                    self.upsert_batch(namespace, batch).await
                }
            })
            .buffer_unordered(self.concurrency);
        while let Some(chunk) = results.next().await {
            outcomes.extend(chunk);
        }
        outcomes
    }
}

/// Run the index stage over the persisted embedded nodes.
pub async fn run(ctx: &StageContext, indexer: &Indexer) -> Result<StageReport, PipelineError> {
    let start = Instant::now();
    let mut report = StageReport::new(Stage::Index);
    let mut nodes = Vec::new();
    for node_type in NodeType::ALL {
        nodes.extend(ctx.store.read_embedded(node_type).await?);
    }
    ctx.progress.on_stage_start(Stage::Index, nodes.len());
    info!("Indexing {} nodes into {}", nodes.len(), indexer.store.name());

    let namespaces: HashMap<String, String> = nodes
        .iter()
        .map(|n| (n.id.clone(), indexer.namespace(n.node_type)))
        .collect();
    for outcome in indexer.index(nodes, &ctx.cancel).await {
        ctx.settle(Stage::Index, &mut report, &outcome);
        if outcome.is_ok() {
            if let Some(ns) = namespaces.get(&outcome.item) {
                report.add_produced(ns.clone(), 1);
            }
        }
    }

    indexer.store.flush().await.map_err(|e| PipelineError::ArtifactIo {
        path: PathBuf::from(indexer.store.name()),
        source: std::io::Error::other(e.to_string()),
    })?;

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Indexed {} nodes ({} failed) in {}ms",
        report.succeeded, report.failed, report.duration_ms
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{node_id, Coordinates, NodeMetadata, NodePosition, Rect};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn node(node_type: NodeType, k: u32, values: Vec<f32>) -> Node {
        let position = NodePosition(vec![k]);
        Node {
            id: node_id("doc", node_type, 2, &position),
            node_type,
            text: "Room and board up to $200 per day.".into(),
            page: 2,
            position,
            coordinates: Coordinates::from_rect(2, Rect::new(72.0, 100.0, 500.0, 120.0), 612.0, 792.0),
            parent_id: Some("doc::table_full::p2::0".into()),
            embedding: Some(values),
            metadata: NodeMetadata {
                document_id: "doc".into(),
                source_file: "doc.pdf".into(),
                row_index: Some(k),
                ..NodeMetadata::default()
            },
        }
    }

    #[test]
    fn metadata_carries_display_fields() {
        let mut n = node(NodeType::TableRow, 1, vec![1.0]);
        n.text = "x".repeat(1500);
        let m = node_metadata(&n);
        assert_eq!(m["text"].as_str().unwrap().len(), METADATA_TEXT_LIMIT);
        assert_eq!(m["page"], 2);
        assert_eq!(m["node_type"], "table_row");
        assert_eq!(m["parent_id"], "doc::table_full::p2::0");
        let coords: Coordinates = serde_json::from_str(m["coordinates"].as_str().unwrap()).unwrap();
        assert_eq!(coords, n.coordinates);
        assert!(!m.contains_key("image_path"));
    }

    #[tokio::test]
    async fn reindexing_overwrites_by_id() {
        let store = Arc::new(LocalVectorStore::in_memory());
        let indexer = Indexer::new(store.clone(), RetryPolicy::none(), 2, None);
        let nodes = vec![node(NodeType::TableRow, 0, vec![1.0, 0.0]), node(NodeType::TableRow, 1, vec![0.0, 1.0])];
        let cancel = CancellationToken::new();
        assert!(indexer.index(nodes.clone(), &cancel).await.iter().all(|o| o.is_ok()));
        assert!(indexer.index(nodes, &cancel).await.iter().all(|o| o.is_ok()));
        assert_eq!(store.len("table_rows").await, 2);

        let hits = store.query("table_rows", &[0.9, 0.1], 1).await.unwrap();
        assert_eq!(hits[0].id, "doc::table_row::p2::0");
    }

    /// Fails every upsert into one namespace.
    struct HalfBroken {
        calls: AtomicUsize,
        inner: LocalVectorStore,
    }

    #[async_trait]
    impl VectorStore for HalfBroken {
        fn name(&self) -> String {
            "half-broken".into()
        }

        async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if namespace == "sentences" {
                return Err(BackendError::Transient("503 service unavailable".into()));
            }
            self.inner.upsert(namespace, records).await
        }

        async fn query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<QueryMatch>, BackendError> {
            self.inner.query(namespace, vector, top_k).await
        }

        fn max_batch_size(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn exhausted_batch_reports_ids_and_continues() {
        let store = Arc::new(HalfBroken {
            calls: AtomicUsize::new(0),
            inner: LocalVectorStore::in_memory(),
        });
        let retry = RetryPolicy {
            max_retries: 2,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        };
        let indexer = Indexer::new(store.clone(), retry, 1, None);
        let nodes = vec![
            node(NodeType::Sentence, 0, vec![1.0]),
            node(NodeType::Paragraph, 0, vec![1.0]),
            node(NodeType::Paragraph, 1, vec![1.0]),
        ];
        let outcomes = indexer.index(nodes, &CancellationToken::new()).await;
        let failed: Vec<&ItemOutcome<()>> = outcomes.iter().filter(|o| !o.is_ok()).collect();
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0].error,
            Some(ItemError::Indexing { attempts: 3, .. })
        ));
        assert_eq!(store.inner.len("paragraphs").await, 2);
        // 3 sentence attempts + 2 paragraph batches
        assert_eq!(store.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn local_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        let store = LocalVectorStore::open(&path).await.unwrap();
        store
            .upsert(
                "sections",
                &[VectorRecord {
                    id: "a".into(),
                    values: vec![1.0, 0.0],
                    metadata: Map::new(),
                }],
            )
            .await
            .unwrap();
        store.flush().await.unwrap();

        let reopened = LocalVectorStore::open(&path).await.unwrap();
        assert_eq!(reopened.len("sections").await, 1);
        assert!(reopened.get("sections", "a").await.is_some());
    }

    #[test]
    fn pinecone_host_gets_scheme() {
        let store = PineconeStore::new("my-index-abc.svc.pinecone.io/", "key").unwrap();
        assert_eq!(store.host, "https://my-index-abc.svc.pinecone.io");
        let body = serde_json::to_value(PineconeQuery {
            namespace: "sentences",
            vector: &[0.5],
            top_k: 3,
            include_metadata: true,
        })
        .unwrap();
        assert_eq!(body["topK"], 3);
        assert_eq!(body["includeMetadata"], true);
    }
}
