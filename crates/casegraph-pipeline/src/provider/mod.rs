//! Extraction Provider Adapter
//!
//! The orchestrator sees one call, `extract`, which returns schema-checked
//! candidates or a [`ProviderError`] that says whether retrying can help.
//! Deduplication and taxonomy lookups are not this layer's concern.
//!
//! Two layers:
//! - [`CompletionClient`]: raw text completions (`openai`, `ScriptedClient`)
//! - [`ExtractionProvider`]: the typed contract (`SchemaValidatingProvider`,
//!   `ScriptedProvider`)

use async_trait::async_trait;
use casegraph_store::{Category, SectionScope, TokenUsage};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::context::ContextEntry;

pub mod adapter;
pub mod client;
pub mod mock;
#[cfg(feature = "http")]
pub mod openai;

pub use adapter::SchemaValidatingProvider;
pub use client::{
    CompletionClient, CompletionRequest, CompletionResponse, LlmError, Message, Role,
    ScriptedClient,
};
pub use mock::{candidate, ScriptedProvider, ScriptedReply};
#[cfg(feature = "http")]
pub use openai::OpenAiCompatibleClient;

/// Distinguishes recoverable from terminal provider failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// Network, timeout, rate limit or server-side failure. Retried.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// The endpoint asked us to back off for at least `retry_after`. Retried.
    #[error("provider rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },
    /// The response cannot be trusted (e.g. fails the candidate schema). Not retried.
    #[error("fatal provider error: {message}")]
    Fatal {
        message: String,
        raw_response: Option<String>,
    },
}

impl ProviderError {
    pub fn fatal(message: impl Into<String>, raw_response: Option<String>) -> Self {
        ProviderError::Fatal {
            message: message.into(),
            raw_response,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }

    /// Minimum delay the endpoint asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn raw_response(&self) -> Option<&str> {
        match self {
            ProviderError::Fatal { raw_response, .. } => raw_response.as_deref(),
            ProviderError::Transient(_) | ProviderError::RateLimited { .. } => None,
        }
    }
}

/// What a single call extracts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionTarget {
    Category { category: Category },
    /// Whole-case pass; candidates may carry any listed category.
    Synthesis { categories: Vec<Category> },
}

impl ExtractionTarget {
    pub fn allows(&self, category: Category) -> bool {
        match self {
            ExtractionTarget::Category { category: c } => *c == category,
            ExtractionTarget::Synthesis { categories } => categories.contains(&category),
        }
    }

    pub fn category(&self) -> Option<Category> {
        match self {
            ExtractionTarget::Category { category } => Some(*category),
            ExtractionTarget::Synthesis { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub target: ExtractionTarget,
    pub section: SectionScope,
    pub section_text: String,
    /// Known classes, already truncated
    pub context: Vec<ContextEntry>,
    /// Classes left out of `context` by truncation
    pub context_omitted: usize,
}

impl ExtractionRequest {
    /// JSON Schema every response must satisfy.
    pub fn output_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(CandidatePayload);
        serde_json::to_value(&schema).unwrap_or(serde_json::Value::Null)
    }
}

/// A schema-valid candidate as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCandidate {
    pub label: String,
    pub definition: String,
    pub category: Category,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResponse {
    pub candidates: Vec<ExtractedCandidate>,
    pub model_identity: String,
    pub token_usage: TokenUsage,
}

/// Typed extraction contract consumed by the orchestrator.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest)
        -> Result<ExtractionResponse, ProviderError>;

    /// The single model identity this provider is configured to use.
    fn model_identity(&self) -> &str;
}

// ============================================================================
// Wire schema
// ============================================================================

/// Top-level object the model must return.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CandidatePayload {
    pub candidates: Vec<CandidateRecord>,
}

/// One extracted item on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CandidateRecord {
    /// Short name of the concept as used in the text
    pub label: String,
    /// One-sentence definition grounded in the text
    #[serde(default)]
    pub definition: String,
    /// Extraction category; defaults to the requested one
    #[serde(default)]
    pub category: Option<String>,
    /// Free-form properties (must be a JSON object)
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Self-reported confidence in [0, 1]
    #[serde(default)]
    pub confidence: Option<f64>,
}
