//! Core data model shared by the store, the ledger and the pipeline.
//!
//! Everything here is plain data: serializable, cloneable, and free of I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an extraction session
pub type SessionId = Uuid;

/// Canonical URI of a concept class
pub type ClassId = String;

/// Model identity recorded on steps that are not driven by a language model.
pub const ALGORITHMIC_MODEL: &str = "algorithmic";

// ============================================================================
// Categories & Sections
// ============================================================================

/// Fixed extraction categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Role,
    State,
    Resource,
    Principle,
    Obligation,
    Constraint,
    Capability,
    Action,
    Event,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Role,
        Category::State,
        Category::Resource,
        Category::Principle,
        Category::Obligation,
        Category::Constraint,
        Category::Capability,
        Category::Action,
        Category::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Role => "role",
            Category::State => "state",
            Category::Resource => "resource",
            Category::Principle => "principle",
            Category::Obligation => "obligation",
            Category::Constraint => "constraint",
            Category::Capability => "capability",
            Category::Action => "action",
            Category::Event => "event",
        }
    }

    /// Plural form used in reports (`"capabilities"`, `"constraints"`).
    pub fn plural(&self) -> &'static str {
        match self {
            Category::Role => "roles",
            Category::State => "states",
            Category::Resource => "resources",
            Category::Principle => "principles",
            Category::Obligation => "obligations",
            Category::Constraint => "constraints",
            Category::Capability => "capabilities",
            Category::Action => "actions",
            Category::Event => "events",
        }
    }

    /// Lenient parse: any case, singular or plural (`"Obligations"` → `Obligation`).
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_lowercase();
        let singular = match lowered.strip_suffix("ies") {
            Some(stem) => format!("{stem}y"),
            None => lowered.strip_suffix('s').unwrap_or(&lowered).to_string(),
        };
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == lowered || c.as_str() == singular)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::parse(s).ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Named text section of a case. Declaration order is processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionScope {
    Facts,
    Discussion,
    Resolution,
    /// Pseudo-scope for whole-case steps (synthesis, reconciliation).
    WholeCase,
}

impl SectionScope {
    /// Real sections, in processing order.
    pub const ORDERED: [SectionScope; 3] = [
        SectionScope::Facts,
        SectionScope::Discussion,
        SectionScope::Resolution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionScope::Facts => "facts",
            SectionScope::Discussion => "discussion",
            SectionScope::Resolution => "resolution",
            SectionScope::WholeCase => "whole_case",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "facts" | "fact" | "factual" => Some(SectionScope::Facts),
            "discussion" => Some(SectionScope::Discussion),
            "resolution" | "conclusion" | "conclusions" => Some(SectionScope::Resolution),
            "whole_case" => Some(SectionScope::WholeCase),
            _ => None,
        }
    }

    pub fn heading(&self) -> &'static str {
        match self {
            SectionScope::Facts => "Facts",
            SectionScope::Discussion => "Discussion",
            SectionScope::Resolution => "Resolution",
            SectionScope::WholeCase => "Whole Case",
        }
    }
}

impl fmt::Display for SectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a case owned by the document collaborator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Concept Classes
// ============================================================================

/// Unique lookup key of a concept class.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConceptKey {
    pub category: Category,
    pub normalized_label: String,
}

impl ConceptKey {
    pub fn new(category: Category, normalized_label: impl Into<String>) -> Self {
        Self {
            category,
            normalized_label: normalized_label.into(),
        }
    }
}

impl fmt::Display for ConceptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.normalized_label)
    }
}

/// A taxonomy node shared across all cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptClass {
    pub id: ClassId,
    pub category: Category,
    pub label: String,
    pub definition: String,
    pub normalized_label: String,
    /// Set once at creation
    pub first_discovered_in_case: CaseId,
    /// Cases that independently re-derived this class (never contains the first discoverer)
    pub discovered_in_cases: BTreeSet<CaseId>,
    pub created_at: DateTime<Utc>,
}

impl ConceptClass {
    pub fn key(&self) -> ConceptKey {
        ConceptKey::new(self.category, self.normalized_label.clone())
    }

    pub fn references_case(&self, case_id: &CaseId) -> bool {
        &self.first_discovered_in_case == case_id || self.discovered_in_cases.contains(case_id)
    }

    /// True when `case_id` is the only case that ever produced this class.
    pub fn discovered_only_by(&self, case_id: &CaseId) -> bool {
        &self.first_discovered_in_case == case_id
            && self.discovered_in_cases.iter().all(|c| c == case_id)
    }
}

/// Input to compare-and-create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProposal {
    pub category: Category,
    pub normalized_label: String,
    pub label: String,
    pub definition: String,
    pub case_id: CaseId,
}

impl ClassProposal {
    pub fn key(&self) -> ConceptKey {
        ConceptKey::new(self.category, self.normalized_label.clone())
    }
}

/// Point-in-time view of the whole taxonomy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxonomySnapshot {
    /// Sorted by class id
    pub classes: Vec<ConceptClass>,
    pub case_ontologies: BTreeMap<CaseId, String>,
}

impl TaxonomySnapshot {
    pub fn class(&self, id: &str) -> Option<&ConceptClass> {
        self.classes
            .binary_search_by(|c| c.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.classes[idx])
    }

    pub fn classes_referencing<'a>(
        &'a self,
        case_id: &'a CaseId,
    ) -> impl Iterator<Item = &'a ConceptClass> + 'a {
        self.classes.iter().filter(move |c| c.references_case(case_id))
    }
}

// ============================================================================
// Candidates & Published Entities
// ============================================================================

/// An extracted item before (or after) resolution against the taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub label: String,
    pub definition: String,
    pub category: Category,
    pub section: SectionScope,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub confidence: Option<f64>,
    /// Step that produced this candidate
    pub step_number: u32,
}

/// Case-scoped committed instance of a concept class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEntity {
    pub session_id: SessionId,
    pub case_id: CaseId,
    pub category: Category,
    pub class_id: ClassId,
    pub label: String,
    pub definition: String,
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Labels of every candidate merged into this entity, first-seen order
    pub source_labels: Vec<String>,
    pub source_steps: Vec<u32>,
    pub sections: Vec<SectionScope>,
    pub published: bool,
}

impl PublishedEntity {
    pub fn from_candidate(
        session_id: SessionId,
        case_id: CaseId,
        class_id: ClassId,
        candidate: &CandidateEntity,
    ) -> Self {
        Self {
            session_id,
            case_id,
            category: candidate.category,
            class_id,
            label: candidate.label.clone(),
            definition: candidate.definition.clone(),
            attributes: candidate.attributes.clone(),
            source_labels: vec![candidate.label.clone()],
            source_steps: vec![candidate.step_number],
            sections: vec![candidate.section],
            published: false,
        }
    }

    pub fn key(&self) -> EntityKey {
        (self.category, self.class_id.clone())
    }

    /// Merge another record for the same class into this one.
    ///
    /// Attributes are unioned with first-seen-wins on key conflicts.
    pub fn absorb(&mut self, other: &PublishedEntity) {
        for (key, value) in &other.attributes {
            self.attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if self.definition.trim().is_empty() {
            self.definition = other.definition.clone();
        }
        for label in &other.source_labels {
            if !self.source_labels.contains(label) {
                self.source_labels.push(label.clone());
            }
        }
        for step in &other.source_steps {
            if !self.source_steps.contains(step) {
                self.source_steps.push(*step);
            }
        }
        for section in &other.sections {
            if !self.sections.contains(section) {
                self.sections.push(*section);
            }
        }
    }
}

/// Published entities are keyed by `(category, class)` within a session.
pub type EntityKey = (Category, ClassId);

// ============================================================================
// Sessions & Steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_closed(&self) -> bool {
        !matches!(self, SessionStatus::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ModelCall,
    ContextInjection,
    Reconciliation,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepType::ModelCall => "model_call",
            StepType::ContextInjection => "context_injection",
            StepType::Reconciliation => "reconciliation",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One extraction attempt for one case. The audit root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSession {
    pub id: SessionId,
    pub case_id: CaseId,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub aggregates: SessionAggregates,
    pub failure_reason: Option<String>,
}

impl ExtractionSession {
    pub fn start(case_id: CaseId) -> Self {
        Self {
            id: Uuid::new_v4(),
            case_id,
            status: SessionStatus::InProgress,
            started_at: Utc::now(),
            ended_at: None,
            aggregates: SessionAggregates::default(),
            failure_reason: None,
        }
    }
}

/// Step payload before the ledger assigns its number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub phase: String,
    pub step_type: StepType,
    pub category: Option<Category>,
    pub section: Option<SectionScope>,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub result: serde_json::Value,
    pub confidence: Option<f64>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub model_identity: Option<String>,
    pub token_usage: Option<TokenUsage>,
    /// Entities recorded by this step
    pub entity_count: u32,
    /// Duplicates merged away by this step
    pub discarded_duplicates: u32,
}

impl StepDraft {
    pub fn new(phase: impl Into<String>, step_type: StepType) -> Self {
        Self {
            phase: phase.into(),
            step_type,
            category: None,
            section: None,
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            result: serde_json::Value::Null,
            confidence: None,
            elapsed_ms: 0,
            error: None,
            model_identity: None,
            token_usage: None,
            entity_count: 0,
            discarded_duplicates: 0,
        }
    }
}

/// Write-once unit of work inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStep {
    pub session_id: SessionId,
    pub step_number: u32,
    pub recorded_at: DateTime<Utc>,
    pub phase: String,
    pub step_type: StepType,
    pub category: Option<Category>,
    pub section: Option<SectionScope>,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub result: serde_json::Value,
    pub confidence: Option<f64>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub model_identity: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub entity_count: u32,
    pub discarded_duplicates: u32,
}

impl ExtractionStep {
    pub fn from_draft(session_id: SessionId, step_number: u32, draft: StepDraft) -> Self {
        Self {
            session_id,
            step_number,
            recorded_at: Utc::now(),
            phase: draft.phase,
            step_type: draft.step_type,
            category: draft.category,
            section: draft.section,
            input: draft.input,
            output: draft.output,
            result: draft.result,
            confidence: draft.confidence,
            elapsed_ms: draft.elapsed_ms,
            error: draft.error,
            model_identity: draft.model_identity,
            token_usage: draft.token_usage,
            entity_count: draft.entity_count,
            discarded_duplicates: draft.discarded_duplicates,
        }
    }

    pub fn is_algorithmic(&self) -> bool {
        self.model_identity.as_deref() == Some(ALGORITHMIC_MODEL)
    }
}

/// Session totals. Always derived from the step log and entity table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregates {
    pub total_steps: u32,
    pub llm_calls: u32,
    pub average_confidence: Option<f64>,
    pub processing_time_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Entities recorded across all steps
    pub recorded_entities: u32,
    pub discarded_duplicates: u32,
    pub committed_entities: u32,
    pub published_entities: u32,
}

impl SessionAggregates {
    pub fn from_log<'a>(
        steps: &[ExtractionStep],
        entities: impl IntoIterator<Item = &'a PublishedEntity>,
    ) -> Self {
        let mut agg = SessionAggregates {
            total_steps: steps.len() as u32,
            ..Default::default()
        };

        let mut confidence_sum = 0.0;
        let mut confidence_n = 0u32;
        for step in steps {
            if step.step_type == StepType::ModelCall && !step.is_algorithmic() {
                agg.llm_calls += 1;
            }
            if let Some(c) = step.confidence {
                confidence_sum += c;
                confidence_n += 1;
            }
            agg.processing_time_ms += step.elapsed_ms;
            if let Some(usage) = step.token_usage {
                agg.input_tokens += usage.input_tokens;
                agg.output_tokens += usage.output_tokens;
            }
            agg.recorded_entities += step.entity_count;
            agg.discarded_duplicates += step.discarded_duplicates;
        }
        if confidence_n > 0 {
            agg.average_confidence = Some(confidence_sum / confidence_n as f64);
        }

        for entity in entities {
            agg.committed_entities += 1;
            if entity.published {
                agg.published_entities += 1;
            }
        }
        agg
    }
}
