//! Schema-validating extraction adapter over a completion client.
//!
//! Every response is parsed against [`CandidatePayload`] before anything
//! reaches the merge engine; a response that does not fit is a fatal error
//! carrying the raw text for diagnosis.

use super::client::{CompletionClient, CompletionRequest, LlmError, Message};
use super::{
    CandidatePayload, ExtractedCandidate, ExtractionProvider, ExtractionRequest,
    ExtractionResponse, ExtractionTarget, ProviderError,
};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use casegraph_store::{normalize_label, Category, TokenUsage};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

static CODE_FENCE: OnceLock<Option<Regex>> = OnceLock::new();

fn code_fence() -> Option<&'static Regex> {
    CODE_FENCE
        .get_or_init(|| Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\s*```\s*$").ok())
        .as_ref()
}

/// Remove a surrounding Markdown code fence, if any.
pub fn strip_code_fence(raw: &str) -> &str {
    match code_fence().and_then(|re| re.captures(raw)) {
        Some(caps) => caps.get(1).map_or(raw, |m| m.as_str()),
        None => raw.trim(),
    }
}

fn category_guidance(category: Category) -> &'static str {
    match category {
        Category::Role => "people, professional positions and parties acting in the case",
        Category::State => "conditions or situations that hold at some point in the case",
        Category::Resource => "codes, standards, documents and other resources relied upon",
        Category::Principle => "ethical principles invoked or at stake",
        Category::Obligation => "duties a party must fulfil",
        Category::Constraint => "limits or restrictions on what a party may do",
        Category::Capability => "competences or qualifications a party has or needs",
        Category::Action => "deliberate acts performed by a party",
        Category::Event => "occurrences that happen to or around the parties",
    }
}

pub struct SchemaValidatingProvider<C> {
    client: C,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl<C: CompletionClient> SchemaValidatingProvider<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn from_config(client: C, config: &ProviderConfig) -> Self {
        Self {
            client,
            max_tokens: Some(config.max_tokens),
            temperature: Some(config.temperature),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn build_messages(&self, request: &ExtractionRequest) -> Vec<Message> {
        let schema = serde_json::to_string_pretty(&ExtractionRequest::output_schema())
            .unwrap_or_default();
        let system = format!(
            "You extract typed concepts from professional ethics case text.\n\
             Respond with a single JSON object matching this JSON Schema and nothing else:\n{schema}\n\
             Reuse the label of a known concept whenever the text refers to it."
        );

        let mut user = String::new();
        match &request.target {
            ExtractionTarget::Category { category } => {
                user.push_str(&format!(
                    "Extract every {category} ({}).\n",
                    category_guidance(*category)
                ));
            }
            ExtractionTarget::Synthesis { categories } => {
                user.push_str(
                    "Review the whole case and extract concepts missed so far. \
                     Every candidate must set `category` to one of:\n",
                );
                for category in categories {
                    user.push_str(&format!("- {category}: {}\n", category_guidance(*category)));
                }
            }
        }

        if !request.context.is_empty() {
            user.push_str("\nKnown concepts:\n");
            for entry in &request.context {
                user.push_str(&format!("- {}: {}\n", entry.label, entry.definition));
            }
            if request.context_omitted > 0 {
                user.push_str(&format!("…and {} more\n", request.context_omitted));
            }
        }

        user.push_str(&format!(
            "\n## {}\n\n{}\n",
            request.section.heading(),
            request.section_text
        ));

        vec![Message::system(system), Message::user(user)]
    }

    /// Parse and validate a raw completion for `target`.
    pub fn parse_response(
        &self,
        target: &ExtractionTarget,
        raw: &str,
    ) -> Result<Vec<ExtractedCandidate>, ProviderError> {
        let body = strip_code_fence(raw);
        let payload: CandidatePayload = serde_json::from_str(body).map_err(|e| {
            ProviderError::fatal(
                format!("response does not match candidate schema: {e}"),
                Some(raw.to_string()),
            )
        })?;

        let mut out = Vec::with_capacity(payload.candidates.len());
        for (idx, record) in payload.candidates.into_iter().enumerate() {
            let violation = |message: String| {
                ProviderError::fatal(format!("candidate {idx}: {message}"), Some(raw.to_string()))
            };

            if normalize_label(&record.label).is_empty() {
                return Err(violation(format!("unusable label {:?}", record.label)));
            }

            let category = match (&record.category, target) {
                (None, ExtractionTarget::Category { category }) => *category,
                (None, ExtractionTarget::Synthesis { .. }) => {
                    return Err(violation("synthesis candidates must name a category".into()));
                }
                (Some(raw_category), _) => Category::parse(raw_category)
                    .ok_or_else(|| violation(format!("unknown category {raw_category:?}")))?,
            };
            if !target.allows(category) {
                return Err(violation(format!("category `{category}` was not requested")));
            }

            if let Some(confidence) = record.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(violation(format!("confidence {confidence} outside [0, 1]")));
                }
            }

            out.push(ExtractedCandidate {
                label: record.label.trim().to_string(),
                definition: record.definition.trim().to_string(),
                category,
                attributes: record.attributes,
                confidence: record.confidence,
            });
        }
        Ok(out)
    }
}

fn classify(err: LlmError) -> ProviderError {
    if let LlmError::RateLimited { retry_after_ms } = err {
        ProviderError::RateLimited {
            retry_after: Duration::from_millis(retry_after_ms),
        }
    } else if err.is_transient() {
        ProviderError::Transient(err.to_string())
    } else {
        ProviderError::fatal(err.to_string(), None)
    }
}

#[async_trait]
impl<C: CompletionClient> ExtractionProvider for SchemaValidatingProvider<C> {
    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResponse, ProviderError> {
        let completion = self
            .client
            .complete(CompletionRequest {
                messages: self.build_messages(request),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                json_mode: true,
            })
            .await
            .map_err(classify)?;

        let candidates = self.parse_response(&request.target, &completion.content)?;
        tracing::debug!(
            model = %completion.model,
            candidates = candidates.len(),
            "validated provider response"
        );

        Ok(ExtractionResponse {
            candidates,
            model_identity: completion.model,
            token_usage: TokenUsage {
                input_tokens: completion.prompt_tokens,
                output_tokens: completion.completion_tokens,
            },
        })
    }

    fn model_identity(&self) -> &str {
        self.client.model_name()
    }
}
