//! Model backends: one capability interface over a closed set of providers.
//!
//! Every stage talks to models through [`ModelBackend`]. The variant set is
//! closed ([`ProviderKind`]): remote providers are reached through
//! `edgequake-llm` (generation) and their HTTP embedding endpoints, and
//! [`local::LocalBackend`] runs fully offline.
//!
//! Backends are constructed once per run by [`build_backend`], which is where
//! unsupported provider/role pairs and missing credentials are reported.

pub mod local;
pub mod remote;

use crate::error::PipelineError;
use crate::provider::{ModelConfig, ModelRole, ProviderKind};
use async_trait::async_trait;
use edgequake_llm::ImageData;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// A generation request: system instructions, user prompt, optional image.
#[derive(Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub image: Option<ImageData>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("system_len", &self.system.len())
            .field("prompt_len", &self.prompt.len())
            .field("image", &self.image.as_ref().map(|i| i.mime_type.clone()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Text produced by a generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Failure of a single backend call, classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Network blip, timeout, 5xx. Worth retrying.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// HTTP 429 or quota exhaustion. Worth retrying after a delay.
    #[error("rate limited: {detail}")]
    RateLimited {
        detail: String,
        retry_after_secs: Option<u64>,
    },

    /// The backend refused this particular input (too long, filtered,
    /// malformed). Retrying the same input will not help.
    #[error("input rejected: {0}")]
    Rejected(String),

    /// Credentials, model name or capability problem. Nothing in this run
    /// will succeed against this backend.
    #[error("backend unusable: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::RateLimited { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Fatal(_))
    }

    /// Server-requested delay, when one was given.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Classify an HTTP status and response body.
    pub fn from_status(status: u16, body: &str, retry_after_secs: Option<u64>) -> Self {
        let detail = format!("HTTP {status}: {}", truncate(body, 300));
        match status {
            429 => BackendError::RateLimited {
                detail,
                retry_after_secs,
            },
            408 | 500..=599 => BackendError::Transient(detail),
            401 | 403 | 404 => BackendError::Fatal(detail),
            _ => BackendError::Rejected(detail),
        }
    }

    /// Classify an error that only exposes a message (edgequake-llm errors).
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["429", "rate limit", "rate_limit", "resource_exhausted", "quota"]) {
            BackendError::RateLimited {
                detail: message.to_string(),
                retry_after_secs: None,
            }
        } else if has(&[
            "401",
            "403",
            "unauthorized",
            "invalid api key",
            "invalid_api_key",
            "authentication",
            "permission denied",
            "model_not_found",
            "does not exist",
        ]) {
            BackendError::Fatal(message.to_string())
        } else if has(&["content_filter", "context length", "context_length", "too long", "400 "]) {
            BackendError::Rejected(message.to_string())
        } else {
            // timeouts, 5xx, resets, unknown
            BackendError::Transient(message.to_string())
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

/// Capability interface shared by every model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// `provider/model`, for logs and reports.
    fn name(&self) -> String;

    /// Produce text for a prompt (optionally with one image).
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, BackendError>;

    /// Embed a batch of texts; output order matches input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;

    /// Largest batch `embed` accepts.
    fn max_batch_size(&self) -> usize {
        100
    }
}

/// Construct the backend for `config` in `role`.
///
/// Fails with a configuration error when the provider cannot serve the role
/// or its credential is absent from the environment.
pub fn build_backend(config: &ModelConfig, role: ModelRole) -> Result<Arc<dyn ModelBackend>, PipelineError> {
    config.validate(role)?;
    match config.provider {
        ProviderKind::Local => Ok(Arc::new(LocalBackend::new(config.model.clone()))),
        _ => {
            let backend = match role {
                ModelRole::Generation => RemoteBackend::for_generation(config)?,
                ModelRole::Embedding => RemoteBackend::for_embedding(config)?,
            };
            Ok(Arc::new(backend))
        }
    }
}
