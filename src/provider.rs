//! Model provider selection.
//!
//! A [`ModelProvider`] names the generation model and the embedding model a
//! run uses. It is built once (from CLI flags, the environment, or code) and
//! handed to every stage explicitly. No stage reads a global default.
//!
//! Credentials never live here: backends read them from the environment when
//! they are constructed (see [`crate::backend::build_backend`]).

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which role a model plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Generation,
    Embedding,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelRole::Generation => f.write_str("generation"),
            ModelRole::Embedding => f.write_str("embedding"),
        }
    }
}

/// The closed set of supported model backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
    /// Deterministic offline backend: no network, no credentials.
    Local,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
        ProviderKind::Ollama,
        ProviderKind::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Local => "local",
        }
    }

    /// Whether this provider can serve the given role at all.
    pub fn supports(&self, role: ModelRole) -> bool {
        !matches!((self, role), (ProviderKind::Anthropic, ModelRole::Embedding))
    }

    /// Default model name for a role.
    pub fn default_model(&self, role: ModelRole) -> &'static str {
        match (self, role) {
            (ProviderKind::OpenAi, ModelRole::Generation) => "gpt-4o-mini",
            (ProviderKind::OpenAi, ModelRole::Embedding) => "text-embedding-3-small",
            (ProviderKind::Anthropic, _) => "claude-3-5-haiku-latest",
            (ProviderKind::Gemini, ModelRole::Generation) => "gemini-2.0-flash",
            (ProviderKind::Gemini, ModelRole::Embedding) => "text-embedding-004",
            (ProviderKind::Ollama, ModelRole::Generation) => "llama3.2",
            (ProviderKind::Ollama, ModelRole::Embedding) => "nomic-embed-text",
            (ProviderKind::Local, ModelRole::Generation) => "extractive",
            (ProviderKind::Local, ModelRole::Embedding) => "char-ngram-384",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "ollama" => Ok(ProviderKind::Ollama),
            "local" => Ok(ProviderKind::Local),
            other => Err(PipelineError::UnsupportedProvider {
                provider: other.to_string(),
                role: "any role".to_string(),
                hint: format!(
                    "Supported providers: {}",
                    ProviderKind::ALL.map(|p| p.as_str()).join(", ")
                ),
            }),
        }
    }
}

/// A provider plus the model to call on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub model: String,
}

impl ModelConfig {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Provider with its default model for `role`.
    pub fn default_for(provider: ProviderKind, role: ModelRole) -> Self {
        Self::new(provider, provider.default_model(role))
    }

    /// Parse `provider` and an optional model name, falling back to the
    /// provider's default model for `role`.
    pub fn parse(provider: &str, model: Option<&str>, role: ModelRole) -> Result<Self, PipelineError> {
        let kind: ProviderKind = provider.parse()?;
        let model = match model.map(str::trim) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => kind.default_model(role).to_string(),
        };
        Ok(Self::new(kind, model))
    }

    /// Reject provider/role combinations that can never work.
    pub fn validate(&self, role: ModelRole) -> Result<(), PipelineError> {
        if !self.provider.supports(role) {
            return Err(PipelineError::UnsupportedProvider {
                provider: self.provider.to_string(),
                role: role.to_string(),
                hint: format!(
                    "'{}' does not offer an {} API; pick openai, gemini, ollama or local.",
                    self.provider, role
                ),
            });
        }
        if self.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "empty model name for {} provider '{}'",
                role, self.provider
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Generation and embedding model choices for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProvider {
    pub llm: ModelConfig,
    pub embedding: ModelConfig,
}

impl Default for ModelProvider {
    fn default() -> Self {
        Self {
            llm: ModelConfig::default_for(ProviderKind::OpenAi, ModelRole::Generation),
            embedding: ModelConfig::default_for(ProviderKind::OpenAi, ModelRole::Embedding),
        }
    }
}

impl ModelProvider {
    pub fn new(llm: ModelConfig, embedding: ModelConfig) -> Self {
        Self { llm, embedding }
    }

    /// Fully offline provider pair.
    pub fn local() -> Self {
        Self {
            llm: ModelConfig::default_for(ProviderKind::Local, ModelRole::Generation),
            embedding: ModelConfig::default_for(ProviderKind::Local, ModelRole::Embedding),
        }
    }

    /// Read `LLM_PROVIDER`, `LLM_MODEL`, `EMBEDDING_PROVIDER` and
    /// `EMBEDDING_MODEL`, defaulting to OpenAI for both roles.
    pub fn from_env() -> Result<Self, PipelineError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let llm = ModelConfig::parse(
            var("LLM_PROVIDER").as_deref().unwrap_or("openai"),
            var("LLM_MODEL").as_deref(),
            ModelRole::Generation,
        )?;
        let embedding = ModelConfig::parse(
            var("EMBEDDING_PROVIDER").as_deref().unwrap_or("openai"),
            var("EMBEDDING_MODEL").as_deref(),
            ModelRole::Embedding,
        )?;
        Ok(Self { llm, embedding })
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.llm.validate(ModelRole::Generation)?;
        self.embedding.validate(ModelRole::Embedding)
    }
}
