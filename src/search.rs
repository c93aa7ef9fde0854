//! Query path: embed a question and return the nearest indexed nodes.
//!
//! The query is embedded with the same embedding backend the run used, so
//! scores are comparable across namespaces. Hits carry the stored metadata,
//! including serialized coordinates a viewer can rescale onto the rendered
//! page.
//!
//! Any backend or store failure is reported as one
//! [`PipelineError::SearchFailed`]; partial result sets are never returned.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{Coordinates, NodeType};
use crate::retry::retry_transient;
use crate::run::{embedding_backend, vector_store};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub node_type: Option<NodeType>,
    pub page: Option<u32>,
    pub text: String,
    pub coordinates: Option<Coordinates>,
    /// Everything the store returned, unparsed.
    pub metadata: Map<String, Value>,
}

impl SearchHit {
    fn from_metadata(id: String, score: f32, metadata: Map<String, Value>) -> Self {
        let node_type = metadata
            .get("node_type")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let page = metadata.get("page").and_then(Value::as_u64).map(|p| p as u32);
        let text = metadata
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let coordinates = metadata
            .get("coordinates")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str(s).ok());
        Self {
            id,
            score,
            node_type,
            page,
            text,
            coordinates,
            metadata,
        }
    }
}

/// Return the `top_k` nodes nearest to `query` across `node_types`
/// (every type when empty), best first.
pub async fn search(
    query: &str,
    top_k: usize,
    node_types: &[NodeType],
    config: &PipelineConfig,
) -> Result<Vec<SearchHit>, PipelineError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(PipelineError::InvalidConfig("search query is empty".into()));
    }
    if top_k == 0 {
        return Ok(Vec::new());
    }
    let backend = embedding_backend(config)?;
    let store = vector_store(config).await?;
    let types: Vec<NodeType> = if node_types.is_empty() {
        NodeType::ALL.to_vec()
    } else {
        node_types.to_vec()
    };

    let texts = vec![query.to_string()];
    let embedded = retry_transient(&config.retry, "embed query", || backend.embed(&texts)).await;
    let vector = embedded
        .result
        .map_err(|e| PipelineError::SearchFailed {
            detail: format!("query embedding via {} failed: {e}", backend.name()),
        })?
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::SearchFailed {
            detail: format!("{} returned no vector for the query", backend.name()),
        })?;

    let mut hits = Vec::new();
    for node_type in types {
        let namespace = config.namespace(node_type.namespace());
        let retried = retry_transient(&config.retry, &format!("query {namespace}"), || {
            store.query(&namespace, &vector, top_k)
        })
        .await;
        let matches = retried.result.map_err(|e| PipelineError::SearchFailed {
            detail: format!("{} query on '{namespace}' failed: {e}", store.name()),
        })?;
        debug!("{} matches from {}", matches.len(), namespace);
        hits.extend(
            matches
                .into_iter()
                .map(|m| SearchHit::from_metadata(m.id, m.score, m.metadata)),
        );
    }

    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(top_k);
    info!("Search returned {} hits for {:?}", hits.len(), query);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, Generation, GenerationRequest, ModelBackend};
    use crate::pipeline::index::{LocalVectorStore, VectorRecord, VectorStore};
    use crate::provider::ModelProvider;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Down;

    #[async_trait]
    impl ModelBackend for Down {
        fn name(&self) -> String {
            "down".into()
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, BackendError> {
            Err(BackendError::Transient("503".into()))
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            Err(BackendError::Transient("503".into()))
        }
    }

    fn config(store: Arc<dyn VectorStore>) -> PipelineConfig {
        let mut config = PipelineConfig::builder()
            .model_provider(ModelProvider::local())
            .retry(crate::retry::RetryPolicy::none())
            .build()
            .unwrap();
        config.vector_store_override = Some(store);
        config
    }

    #[tokio::test]
    async fn backend_outage_is_one_search_error() {
        let mut config = config(Arc::new(LocalVectorStore::in_memory()));
        config.embedding_backend = Some(Arc::new(Down));
        let err = search("room limit", 5, &[], &config).await.unwrap_err();
        assert!(matches!(err, PipelineError::SearchFailed { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn hits_merge_namespaces_by_score() {
        let store = Arc::new(LocalVectorStore::in_memory());
        let record = |id: &str, values: Vec<f32>, node_type: &str| VectorRecord {
            id: id.into(),
            values,
            metadata: serde_json::json!({"text": id, "page": 2, "node_type": node_type})
                .as_object()
                .cloned()
                .unwrap(),
        };
        store
            .upsert("sentences", &[record("s", vec![1.0, 0.0], "sentence")])
            .await
            .unwrap();
        store
            .upsert("table_rows", &[record("r", vec![0.0, 1.0], "table_row")])
            .await
            .unwrap();

        struct Fixed;
        #[async_trait]
        impl ModelBackend for Fixed {
            fn name(&self) -> String {
                "fixed".into()
            }
            async fn generate(&self, _r: &GenerationRequest) -> Result<Generation, BackendError> {
                Err(BackendError::Fatal("unused".into()))
            }
            async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
                Ok(texts.iter().map(|_| vec![0.2, 0.9]).collect())
            }
        }

        let mut config = config(store);
        config.embedding_backend = Some(Arc::new(Fixed));
        let hits = search("limits", 2, &[], &config).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "r");
        assert_eq!(hits[0].node_type, Some(NodeType::TableRow));
        assert_eq!(hits[0].page, Some(2));

        let only_sentences = search("limits", 5, &[NodeType::Sentence], &config).await.unwrap();
        assert_eq!(only_sentences.len(), 1);
    }
}
