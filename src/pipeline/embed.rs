//! Embed stage: attach a vector to every node.
//!
//! Nodes are validated first (empty or oversized text never reaches the
//! backend), then sent in batches of the backend's `max_batch_size`, up to
//! `concurrency` batches in flight.
//!
//! Failure handling per batch:
//!
//! * transient errors are retried with backoff; when retries run out every
//!   node in the batch is reported
//! * a rejected batch is bisected until the offending node is isolated, so
//!   one bad text never costs its neighbours their vectors
//! * a fatal error (credentials, unknown model) aborts the stage with
//!   [`PipelineError::EmbeddingAborted`]
//!
//! The first vector fixes the run's dimension; a vector of any other length
//! is reported as a failure for its node.

use crate::backend::{BackendError, ModelBackend};
use crate::config::Stage;
use crate::error::{ItemError, PipelineError};
use crate::model::{sort_nodes, Node, NodeType};
use crate::pipeline::StageContext;
use crate::report::{ItemOutcome, StageReport};
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::partition;
use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Embeds nodes with one embedding backend.
pub struct Embedder {
    backend: Arc<dyn ModelBackend>,
    retry: RetryPolicy,
    max_chars: usize,
    concurrency: usize,
}

type BatchResult = Result<Vec<ItemOutcome<Node>>, PipelineError>;

fn failure(node: &Node, detail: impl Into<String>) -> ItemOutcome<Node> {
    ItemOutcome::failed(
        node.id.clone(),
        ItemError::Embedding {
            node_id: node.id.clone(),
            detail: detail.into(),
        },
    )
}

impl Embedder {
    pub fn new(backend: Arc<dyn ModelBackend>, retry: RetryPolicy, max_chars: usize, concurrency: usize) -> Self {
        Self {
            backend,
            retry,
            max_chars,
            concurrency: concurrency.max(1),
        }
    }

    pub fn backend_name(&self) -> String {
        self.backend.name()
    }

    /// Why `node` cannot be embedded, if it cannot.
    fn invalid(&self, node: &Node) -> Option<String> {
        if node.text.trim().is_empty() {
            return Some("empty text".into());
        }
        let chars = node.text.chars().count();
        (chars > self.max_chars).then(|| format!("text is {chars} characters, limit is {}", self.max_chars))
    }

    /// Embed one batch, bisecting on rejection.
    fn embed_batch(&self, batch: Vec<Node>) -> BoxFuture<'_, BatchResult> {
        async move {
            let texts: Vec<String> = batch.iter().map(|n| n.text.clone()).collect();
            let label = match batch.first() {
                Some(first) if batch.len() > 1 => format!("embed batch of {} from {}", batch.len(), first.id),
                Some(first) => format!("embed {}", first.id),
                None => return Ok(Vec::new()),
            };
            let retried = retry_transient(&self.retry, &label, || self.backend.embed(&texts)).await;

            match retried.result {
                Ok(vectors) if vectors.len() == batch.len() => Ok(batch
                    .into_iter()
                    .zip(vectors)
                    .map(|(mut node, vector)| {
                        node.embedding = Some(vector);
                        ItemOutcome::ok(node.id.clone(), node)
                    })
                    .collect()),
                Ok(vectors) => {
                    let detail = format!("backend returned {} vectors for {} inputs", vectors.len(), batch.len());
                    Ok(batch.iter().map(|n| failure(n, detail.clone())).collect())
                }
                Err(BackendError::Fatal(detail)) => Err(PipelineError::EmbeddingAborted {
                    provider: self.backend.name(),
                    detail,
                }),
                Err(BackendError::Rejected(detail)) if batch.len() == 1 => Ok(vec![failure(&batch[0], detail)]),
                Err(BackendError::Rejected(detail)) => {
                    debug!("{}: rejected ({}), bisecting", label, detail);
                    let mut left = batch;
                    let right = left.split_off(left.len() / 2);
                    let mut out = self.embed_batch(left).await?;
                    out.extend(self.embed_batch(right).await?);
                    Ok(out)
                }
                Err(e) => {
                    let detail = format!("{e} (after {} attempts)", retried.attempts);
                    Ok(batch.iter().map(|n| failure(n, detail.clone())).collect())
                }
            }
        }
        .boxed()
    }

    /// Outcomes in completion order: invalid nodes first, then one chunk per
    /// batch. Batches not yet started when `cancel` fires report every node
    /// as cancelled.
    fn dispatch<'a>(&'a self, nodes: Vec<Node>, cancel: CancellationToken) -> impl Stream<Item = BatchResult> + 'a {
        let (invalid, valid): (Vec<Node>, Vec<Node>) = nodes.into_iter().partition(|n| self.invalid(n).is_some());
        let rejected: Vec<ItemOutcome<Node>> = invalid
            .iter()
            .map(|n| failure(n, self.invalid(n).unwrap_or_default()))
            .collect();

        let size = self.backend.max_batch_size().max(1);
        let mut batches: Vec<Vec<Node>> = Vec::new();
        for node in valid {
            match batches.last_mut() {
                Some(batch) if batch.len() < size => batch.push(node),
                _ => batches.push(vec![node]),
            }
        }

        let work = stream::iter(batches)
            .map(move |batch| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Ok(batch
                            .iter()
                            .map(|n| ItemOutcome::failed(n.id.clone(), ItemError::Cancelled { item: n.id.clone() }))
                            .collect());
                    }
                    self.embed_batch(batch).await
                }
            })
            .buffer_unordered(self.concurrency);
        stream::iter([Ok(rejected)]).chain(work)
    }

    /// Embed `nodes`. Every input node has exactly one outcome in the result.
    pub async fn embed(&self, nodes: Vec<Node>, cancel: &CancellationToken) -> BatchResult {
        let mut dims = DimensionCheck::default();
        let mut out = Vec::with_capacity(nodes.len());
        let mut results = std::pin::pin!(self.dispatch(nodes, cancel.clone()));
        while let Some(chunk) = results.next().await {
            out.extend(chunk?.into_iter().map(|o| dims.check(o)));
        }
        Ok(out)
    }
}

/// Enforces one vector length across the run.
#[derive(Debug, Default)]
struct DimensionCheck {
    expected: Option<usize>,
}

impl DimensionCheck {
    fn check(&mut self, outcome: ItemOutcome<Node>) -> ItemOutcome<Node> {
        let Some(len) = outcome.value.as_ref().and_then(|n| n.embedding.as_ref()).map(Vec::len) else {
            return outcome;
        };
        match self.expected {
            None => {
                self.expected = Some(len);
                outcome
            }
            Some(expected) if expected == len => outcome,
            Some(expected) => ItemOutcome::failed(
                outcome.item.clone(),
                ItemError::Embedding {
                    node_id: outcome.item,
                    detail: format!("vector has {len} dimensions, expected {expected}"),
                },
            ),
        }
    }
}

type PageKey = (NodeType, u32);

/// Run the embed stage over the persisted nodes.
pub async fn run(ctx: &StageContext, embedder: &Embedder) -> Result<StageReport, PipelineError> {
    let start = Instant::now();
    let mut report = StageReport::new(Stage::Embed);

    let mut pending: Vec<Node> = Vec::new();
    let mut keys: HashMap<String, PageKey> = HashMap::new();
    let mut remaining: BTreeMap<PageKey, usize> = BTreeMap::new();
    for node_type in NodeType::ALL {
        for node in ctx.store.read_nodes(node_type).await? {
            if ctx.store.exists(partition("embedded", node_type.as_str(), node.page)) {
                report.record_skip();
                continue;
            }
            let key = (node_type, node.page);
            *remaining.entry(key).or_default() += 1;
            keys.insert(node.id.clone(), key);
            pending.push(node);
        }
    }
    ctx.progress.on_stage_start(Stage::Embed, pending.len());
    info!("Embedding {} nodes with {}", pending.len(), embedder.backend_name());

    let mut dims = DimensionCheck::default();
    let mut finished: BTreeMap<PageKey, Vec<Node>> = BTreeMap::new();
    let mut interrupted: BTreeSet<PageKey> = BTreeSet::new();
    let mut results = std::pin::pin!(embedder.dispatch(pending, ctx.cancel.clone()));

    while let Some(chunk) = results.next().await {
        for outcome in chunk? {
            let outcome = dims.check(outcome);
            ctx.settle(Stage::Embed, &mut report, &outcome);
            let Some(&key) = keys.get(&outcome.item) else {
                continue;
            };
            if matches!(outcome.error, Some(ItemError::Cancelled { .. })) {
                interrupted.insert(key);
            }
            if let Some(node) = outcome.value {
                finished.entry(key).or_default().push(node);
            }

            let left = remaining.entry(key).or_default();
            *left = left.saturating_sub(1);
            if *left == 0 && !interrupted.contains(&key) {
                let mut nodes = finished.remove(&key).unwrap_or_default();
                sort_nodes(&mut nodes);
                report.add_produced(key.0.as_str(), nodes.len());
                ctx.store.write_embedded(key.0, key.1, &nodes).await?;
            }
        }
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Embedded {} nodes ({} failed, {} skipped, {} dims) in {}ms",
        report.succeeded,
        report.failed,
        report.skipped,
        dims.expected.unwrap_or(0),
        report.duration_ms
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Generation, GenerationRequest, LocalBackend};
    use crate::model::{node_id, Coordinates, NodeMetadata, NodePosition, Rect};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(page: u32, k: u32, text: &str) -> Node {
        let position = NodePosition(vec![0, 0, k]);
        Node {
            id: node_id("doc", NodeType::Sentence, page, &position),
            node_type: NodeType::Sentence,
            text: text.into(),
            page,
            position,
            coordinates: Coordinates::from_rect(page, Rect::new(72.0, 100.0, 500.0, 120.0), 612.0, 792.0),
            parent_id: None,
            embedding: None,
            metadata: NodeMetadata::default(),
        }
    }

    /// Rejects any batch containing "poison"; counts calls.
    struct Picky {
        calls: AtomicUsize,
        batch: usize,
    }

    #[async_trait]
    impl ModelBackend for Picky {
        fn name(&self) -> String {
            "picky".into()
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, BackendError> {
            Err(BackendError::Fatal("embedding only".into()))
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(BackendError::Rejected("content filtered".into()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect())
        }

        fn max_batch_size(&self) -> usize {
            self.batch
        }
    }

    #[tokio::test]
    async fn one_invalid_node_is_isolated() {
        let embedder = Embedder::new(Arc::new(LocalBackend::new("m")), RetryPolicy::none(), 1_000, 2);
        let nodes = vec![node(1, 0, "First."), node(1, 1, "   "), node(1, 2, "Third."), node(1, 3, "Fourth.")];
        let outcomes = embedder.embed(nodes, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        let ok: Vec<&ItemOutcome<Node>> = outcomes.iter().filter(|o| o.is_ok()).collect();
        assert_eq!(ok.len(), 3);
        assert!(ok.iter().all(|o| o.value.as_ref().unwrap().embedding.is_some()));
        let failed: Vec<&ItemOutcome<Node>> = outcomes.iter().filter(|o| !o.is_ok()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item, "doc::sentence::p1::0.0.1");
    }

    #[tokio::test]
    async fn rejected_batch_is_bisected() {
        let backend = Arc::new(Picky {
            calls: AtomicUsize::new(0),
            batch: 8,
        });
        let embedder = Embedder::new(backend.clone(), RetryPolicy::none(), 1_000, 1);
        let nodes: Vec<Node> = (0..8)
            .map(|k| node(1, k, if k == 5 { "poison pill" } else { "fine text" }))
            .collect();
        let outcomes = embedder.embed(nodes, &CancellationToken::new()).await.unwrap();
        let failed: Vec<&str> = outcomes.iter().filter(|o| !o.is_ok()).map(|o| o.item.as_str()).collect();
        assert_eq!(failed, vec!["doc::sentence::p1::0.0.5"]);
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 7);
        // 8 -> 4+4 -> 2+2 -> 1+1
        assert_eq!(backend.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn oversized_text_never_reaches_backend() {
        let backend = Arc::new(Picky {
            calls: AtomicUsize::new(0),
            batch: 8,
        });
        let embedder = Embedder::new(backend.clone(), RetryPolicy::none(), 10, 1);
        let outcomes = embedder
            .embed(vec![node(1, 0, "far too long for the limit")], &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcomes[0].error, Some(ItemError::Embedding { .. })));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_error_aborts() {
        struct Unauthorised;
        #[async_trait]
        impl ModelBackend for Unauthorised {
            fn name(&self) -> String {
                "openai/text-embedding-3-small".into()
            }
            async fn generate(&self, _r: &GenerationRequest) -> Result<Generation, BackendError> {
                Err(BackendError::Fatal("401".into()))
            }
            async fn embed(&self, _t: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
                Err(BackendError::Fatal("401 invalid api key".into()))
            }
        }
        let embedder = Embedder::new(Arc::new(Unauthorised), RetryPolicy::default(), 1_000, 1);
        let err = embedder
            .embed(vec![node(1, 0, "text")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmbeddingAborted { .. }));
    }

    #[tokio::test]
    async fn stage_writes_embedded_partitions_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::pipeline::testing::context(dir.path());
        ctx.store
            .write_nodes(NodeType::Sentence, 1, &[node(1, 0, "Cover begins."), node(1, 1, "")])
            .await
            .unwrap();
        ctx.store
            .write_nodes(NodeType::Sentence, 2, &[node(2, 0, "Claims close.")])
            .await
            .unwrap();
        let embedder = Embedder::new(Arc::new(LocalBackend::new("m")), RetryPolicy::none(), 1_000, 2);

        let report = run(&ctx, &embedder).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (2, 1));
        let embedded = ctx.store.read_embedded(NodeType::Sentence).await.unwrap();
        assert_eq!(embedded.len(), 2);
        assert!(embedded.iter().all(|n| n.embedding.as_ref().map(Vec::len) == Some(384)));

        let again = run(&ctx, &embedder).await.unwrap();
        assert_eq!((again.total, again.skipped), (0, 3));
    }
}
