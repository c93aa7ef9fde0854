//! Remote model backends.
//!
//! Generation goes through `edgequake-llm`, which already speaks every
//! supported chat API. Embeddings go straight to each provider's HTTP
//! endpoint with `reqwest`:
//!
//! | Provider | Endpoint | Batch cap |
//! |----------|----------|-----------|
//! | openai   | `POST {OPENAI_BASE_URL}/embeddings` | 100 |
//! | gemini   | `POST …/models/{model}:batchEmbedContents` | 100 |
//! | ollama   | `POST {OLLAMA_HOST}/api/embed` | 32 |
//!
//! A `RemoteBackend` is built for one role; calling the other capability
//! returns [`BackendError::Fatal`].

use super::{BackendError, Generation, GenerationRequest, ModelBackend};
use crate::error::PipelineError;
use crate::provider::{ModelConfig, ModelRole, ProviderKind};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const GEMINI_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const OLLAMA_DEFAULT_HOST: &str = "http://localhost:11434";
const EMBED_TIMEOUT: Duration = Duration::from_secs(60);

/// A provider reached over the network.
pub struct RemoteBackend {
    config: ModelConfig,
    llm: Option<Arc<dyn LLMProvider>>,
    embedder: Option<EmbeddingClient>,
}

impl RemoteBackend {
    /// Build a generation backend via `edgequake-llm`.
    pub fn for_generation(config: &ModelConfig) -> Result<Self, PipelineError> {
        require_credential(config.provider)?;
        let provider = ProviderFactory::create_llm_provider(factory_name(config.provider), &config.model)
            .map_err(|e| PipelineError::UnsupportedProvider {
                provider: config.provider.to_string(),
                role: ModelRole::Generation.to_string(),
                hint: format!("{e}"),
            })?;
        Ok(Self {
            config: config.clone(),
            llm: Some(provider),
            embedder: None,
        })
    }

    /// Build an embedding backend over HTTP.
    pub fn for_embedding(config: &ModelConfig) -> Result<Self, PipelineError> {
        let endpoint = EmbeddingEndpoint::from_env(config)?;
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .default_headers(endpoint.headers()?)
            .build()
            .map_err(|e| PipelineError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config: config.clone(),
            llm: None,
            embedder: Some(EmbeddingClient {
                client,
                endpoint,
                model: config.model.clone(),
            }),
        })
    }

    /// Wrap an existing `edgequake-llm` provider.
    pub fn with_llm_provider(config: ModelConfig, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            config,
            llm: Some(provider),
            embedder: None,
        }
    }
}

#[async_trait]
impl ModelBackend for RemoteBackend {
    fn name(&self) -> String {
        self.config.to_string()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, BackendError> {
        let provider = self.llm.as_ref().ok_or_else(|| {
            BackendError::Fatal(format!("{} was configured for embeddings only", self.config))
        })?;

        let images = request.image.iter().cloned().collect::<Vec<_>>();
        let messages = vec![
            ChatMessage::system(request.system.as_str()),
            ChatMessage::user_with_images(request.prompt.as_str(), images),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| BackendError::from_message(&format!("{e}")))?;
        debug!(
            "{}: {} input tokens, {} output tokens",
            self.config, response.prompt_tokens, response.completion_tokens
        );
        Ok(Generation {
            text: response.content,
            input_tokens: response.prompt_tokens as usize,
            output_tokens: response.completion_tokens as usize,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            BackendError::Fatal(format!("{} was configured for generation only", self.config))
        })?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = embedder.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(BackendError::Rejected(format!(
                "{} returned {} embeddings for {} inputs",
                self.config,
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    fn max_batch_size(&self) -> usize {
        match self.config.provider {
            ProviderKind::Ollama => 32,
            _ => 100,
        }
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

fn factory_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Gemini => "gemini",
        other => other.as_str(),
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Environment variable(s) holding the credential for `kind`, if it needs one.
fn credential_vars(kind: ProviderKind) -> &'static [&'static str] {
    match kind {
        ProviderKind::OpenAi => &["OPENAI_API_KEY"],
        ProviderKind::Anthropic => &["ANTHROPIC_API_KEY"],
        ProviderKind::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        ProviderKind::Ollama | ProviderKind::Local => &[],
    }
}

fn require_credential(kind: ProviderKind) -> Result<Option<String>, PipelineError> {
    let vars = credential_vars(kind);
    if vars.is_empty() {
        return Ok(None);
    }
    vars.iter()
        .find_map(|v| env_nonempty(v))
        .map(Some)
        .ok_or_else(|| PipelineError::MissingCredential {
            provider: kind.to_string(),
            var: vars.join(" or "),
        })
}

// ── Embedding endpoints ──────────────────────────────────────────────────

enum EmbeddingEndpoint {
    OpenAi { url: String, api_key: String },
    Gemini { url: String, api_key: String },
    Ollama { url: String },
}

impl EmbeddingEndpoint {
    fn from_env(config: &ModelConfig) -> Result<Self, PipelineError> {
        let key = require_credential(config.provider)?.unwrap_or_default();
        match config.provider {
            ProviderKind::OpenAi => {
                let base = env_nonempty("OPENAI_BASE_URL").unwrap_or_else(|| OPENAI_DEFAULT_BASE.to_string());
                Ok(EmbeddingEndpoint::OpenAi {
                    url: format!("{}/embeddings", base.trim_end_matches('/')),
                    api_key: key,
                })
            }
            ProviderKind::Gemini => Ok(EmbeddingEndpoint::Gemini {
                url: format!(
                    "{}/models/{}:batchEmbedContents",
                    GEMINI_DEFAULT_BASE, config.model
                ),
                api_key: key,
            }),
            ProviderKind::Ollama => {
                let host = env_nonempty("OLLAMA_HOST").unwrap_or_else(|| OLLAMA_DEFAULT_HOST.to_string());
                Ok(EmbeddingEndpoint::Ollama {
                    url: format!("{}/api/embed", host.trim_end_matches('/')),
                })
            }
            ProviderKind::Anthropic | ProviderKind::Local => Err(PipelineError::UnsupportedProvider {
                provider: config.provider.to_string(),
                role: ModelRole::Embedding.to_string(),
                hint: "no remote embedding endpoint for this provider".into(),
            }),
        }
    }

    fn url(&self) -> &str {
        match self {
            EmbeddingEndpoint::OpenAi { url, .. }
            | EmbeddingEndpoint::Gemini { url, .. }
            | EmbeddingEndpoint::Ollama { url } => url,
        }
    }

    fn headers(&self) -> Result<HeaderMap, PipelineError> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| {
            PipelineError::InvalidConfig(format!("API key is not a valid header value: {e}"))
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match self {
            EmbeddingEndpoint::OpenAi { api_key, .. } => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", api_key.trim())).map_err(invalid)?,
                );
            }
            EmbeddingEndpoint::Gemini { api_key, .. } => {
                headers.insert("x-goog-api-key", HeaderValue::from_str(api_key.trim()).map_err(invalid)?);
            }
            EmbeddingEndpoint::Ollama { .. } => {}
        }
        Ok(headers)
    }
}

struct EmbeddingClient {
    client: reqwest::Client,
    endpoint: EmbeddingEndpoint,
    model: String,
}

impl EmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let request = self.client.post(self.endpoint.url());
        let request = match &self.endpoint {
            EmbeddingEndpoint::OpenAi { .. } => request.json(&OpenAiRequest {
                model: &self.model,
                input: texts,
            }),
            EmbeddingEndpoint::Gemini { .. } => {
                let model = format!("models/{}", self.model);
                request.json(&GeminiBatchRequest {
                    requests: texts
                        .iter()
                        .map(|t| GeminiRequest {
                            model: model.clone(),
                            content: GeminiContent {
                                parts: vec![GeminiPart { text: t.clone() }],
                            },
                        })
                        .collect(),
                })
            }
            EmbeddingEndpoint::Ollama { .. } => request.json(&OllamaRequest {
                model: &self.model,
                input: texts,
            }),
        };

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(BackendError::from_status(status.as_u16(), &body, retry_after));
        }

        let decode = |e: reqwest::Error| BackendError::Transient(format!("malformed embedding response: {e}"));
        match &self.endpoint {
            EmbeddingEndpoint::OpenAi { .. } => {
                let mut parsed: OpenAiResponse = response.json().await.map_err(decode)?;
                parsed.data.sort_by_key(|entry| entry.index);
                Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
            }
            EmbeddingEndpoint::Gemini { .. } => {
                let parsed: GeminiResponse = response.json().await.map_err(decode)?;
                Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
            }
            EmbeddingEndpoint::Ollama { .. } => {
                let parsed: OllamaResponse = response.json().await.map_err(decode)?;
                Ok(parsed.embeddings)
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_builder() {
        BackendError::Fatal(format!("invalid embedding request: {err}"))
    } else {
        BackendError::Transient(err.to_string())
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Serialize)]
struct GeminiBatchRequest {
    requests: Vec<GeminiRequest>,
}

#[derive(Serialize)]
struct GeminiRequest {
    model: String,
    content: GeminiContent,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    embeddings: Vec<GeminiValues>,
}

#[derive(Deserialize)]
struct GeminiValues {
    values: Vec<f32>,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_accepts_either_key_name() {
        assert_eq!(credential_vars(ProviderKind::Gemini), &["GEMINI_API_KEY", "GOOGLE_API_KEY"]);
        assert!(credential_vars(ProviderKind::Ollama).is_empty());
    }

    #[test]
    fn ollama_embedding_needs_no_key() {
        let cfg = ModelConfig::new(ProviderKind::Ollama, "nomic-embed-text");
        let backend = RemoteBackend::for_embedding(&cfg).unwrap();
        assert_eq!(backend.max_batch_size(), 32);
        assert_eq!(backend.name(), "ollama/nomic-embed-text");
    }

    #[tokio::test]
    async fn embedding_backend_refuses_generation() {
        let cfg = ModelConfig::new(ProviderKind::Ollama, "nomic-embed-text");
        let backend = RemoteBackend::for_embedding(&cfg).unwrap();
        let request = GenerationRequest {
            system: String::new(),
            prompt: "hi".into(),
            image: None,
            temperature: 0.0,
            max_tokens: 8,
        };
        let err = backend.generate(&request).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn openai_request_shape() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let body = serde_json::to_value(OpenAiRequest {
            model: "text-embedding-3-small",
            input: &texts,
        })
        .unwrap();
        assert_eq!(body["input"][1], "b");
        assert_eq!(body["model"], "text-embedding-3-small");
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = r#"{"data":[{"embedding":[2.0],"index":1},{"embedding":[1.0],"index":0}]}"#;
        let mut parsed: OpenAiResponse = serde_json::from_str(json).unwrap();
        parsed.data.sort_by_key(|e| e.index);
        assert_eq!(parsed.data[0].embedding, vec![1.0]);
    }
}
