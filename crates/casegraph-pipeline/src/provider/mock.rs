//! Scripted extraction provider for tests and offline runs.
//!
//! Replies are queued per target (a category or the synthesis pass) and
//! optionally per section. Unscripted calls return no candidates.

use super::{
    ExtractedCandidate, ExtractionProvider, ExtractionRequest, ExtractionResponse,
    ExtractionTarget, ProviderError,
};
use async_trait::async_trait;
use casegraph_store::{Category, SectionScope, TokenUsage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScriptTarget {
    Category(Category),
    Synthesis,
}

impl From<&ExtractionTarget> for ScriptTarget {
    fn from(target: &ExtractionTarget) -> Self {
        match target {
            ExtractionTarget::Category { category } => ScriptTarget::Category(*category),
            ExtractionTarget::Synthesis { .. } => ScriptTarget::Synthesis,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Candidates(Vec<ExtractedCandidate>),
    Transient(String),
    RateLimited(Duration),
    Fatal {
        message: String,
        raw_response: String,
    },
    /// Sleep before answering with no candidates (exercises call timeouts).
    Stall(Duration),
}

impl ScriptedReply {
    pub fn candidates(candidates: impl IntoIterator<Item = ExtractedCandidate>) -> Self {
        ScriptedReply::Candidates(candidates.into_iter().collect())
    }
}

/// Convenience constructor for test candidates.
pub fn candidate(category: Category, label: &str, definition: &str) -> ExtractedCandidate {
    ExtractedCandidate {
        label: label.to_string(),
        definition: definition.to_string(),
        category,
        attributes: BTreeMap::new(),
        confidence: None,
    }
}

type ScriptKey = (ScriptTarget, Option<SectionScope>);

pub struct ScriptedProvider {
    model: String,
    queued: Mutex<HashMap<ScriptKey, VecDeque<ScriptedReply>>>,
    standing: Mutex<HashMap<ScriptKey, ScriptedReply>>,
    calls: Mutex<Vec<ExtractionRequest>>,
}

impl ScriptedProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            queued: Mutex::new(HashMap::new()),
            standing: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-shot reply for `category` in any section.
    pub fn on(self, category: Category, reply: ScriptedReply) -> Self {
        self.enqueue((ScriptTarget::Category(category), None), reply);
        self
    }

    /// Queue a one-shot reply for `category` in `section` only.
    pub fn on_section(self, category: Category, section: SectionScope, reply: ScriptedReply) -> Self {
        self.enqueue((ScriptTarget::Category(category), Some(section)), reply);
        self
    }

    pub fn on_synthesis(self, reply: ScriptedReply) -> Self {
        self.enqueue((ScriptTarget::Synthesis, None), reply);
        self
    }

    /// Reply used for `category` whenever its queue is empty.
    pub fn always(self, category: Category, reply: ScriptedReply) -> Self {
        self.standing
            .lock()
            .insert((ScriptTarget::Category(category), None), reply);
        self
    }

    fn enqueue(&self, key: ScriptKey, reply: ScriptedReply) {
        self.queued.lock().entry(key).or_default().push_back(reply);
    }

    fn next_reply(&self, request: &ExtractionRequest) -> Option<ScriptedReply> {
        let target = ScriptTarget::from(&request.target);
        let specific = (target, Some(request.section));
        let general = (target, None);

        let mut queued = self.queued.lock();
        for key in [specific, general] {
            if let Some(reply) = queued.get_mut(&key).and_then(|q| q.pop_front()) {
                return Some(reply);
            }
        }
        drop(queued);

        let standing = self.standing.lock();
        standing
            .get(&specific)
            .or_else(|| standing.get(&general))
            .cloned()
    }

    /// Every request received, in call order.
    pub fn calls(&self) -> Vec<ExtractionRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ExtractionProvider for ScriptedProvider {
    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResponse, ProviderError> {
        self.calls.lock().push(request.clone());

        let candidates = match self.next_reply(request) {
            None => Vec::new(),
            Some(ScriptedReply::Candidates(candidates)) => candidates,
            Some(ScriptedReply::Transient(message)) => {
                return Err(ProviderError::Transient(message))
            }
            Some(ScriptedReply::RateLimited(retry_after)) => {
                return Err(ProviderError::RateLimited { retry_after })
            }
            Some(ScriptedReply::Fatal {
                message,
                raw_response,
            }) => return Err(ProviderError::fatal(message, Some(raw_response))),
            Some(ScriptedReply::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Vec::new()
            }
        };

        Ok(ExtractionResponse {
            token_usage: TokenUsage {
                input_tokens: request.section_text.split_whitespace().count() as u64,
                output_tokens: 8 * candidates.len() as u64,
            },
            candidates,
            model_identity: self.model.clone(),
        })
    }

    fn model_identity(&self) -> &str {
        &self.model
    }
}
