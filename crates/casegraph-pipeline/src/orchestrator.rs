//! Pass Orchestrator / State Machine
//!
//! ```text
//! Pending → Pass(k, section j) → … → Synthesis → Reconciliation → Verified → Completed
//!                 │                      │              │              │
//!                 └──────────────────────┴──────────────┴──────────────┴──→ Failed
//! ```
//!
//! Within a case everything is sequential: each request's context depends on
//! the taxonomy left behind by earlier steps. Every (pass, section, category)
//! unit appends a `context_injection` step and then a `model_call` step;
//! reconciliation appends one `algorithmic` step. Cancellation is observed
//! between steps only.

use crate::config::{PassConfig, PipelineConfig};
use crate::context::{BuiltContext, ContextBuilder, ContextEntry};
use crate::documents::CaseSource;
use crate::error::PipelineError;
use crate::merge::{DraftSet, MergeEngine};
use crate::provider::{
    ExtractionProvider, ExtractionRequest, ExtractionResponse, ExtractionTarget, ProviderError,
};
use crate::recorder::{SessionOutcome, SessionRecorder};
use crate::verifier;
use casegraph_store::{
    CandidateEntity, CaseId, Category, ConceptStore, LedgerError, SectionScope, SessionId,
    StepDraft, StepType, ALGORITHMIC_MODEL,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

// ============================================================================
// Plan & states
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    /// Index into the plan's passes, and the section being swept
    Pass { pass: usize, section: SectionScope },
    Synthesis,
    Reconciliation,
    Verified,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    /// Next state on success. Terminal states are fixed points.
    pub fn advance(&self, plan: &ExtractionPlan) -> PipelineState {
        let after_passes = if plan.synthesis {
            PipelineState::Synthesis
        } else {
            PipelineState::Reconciliation
        };
        let first_section = plan.sections.first().copied();

        match *self {
            PipelineState::Pending => match first_section {
                Some(section) if !plan.passes.is_empty() => PipelineState::Pass { pass: 0, section },
                _ => after_passes,
            },
            PipelineState::Pass { pass, section } => {
                let next_section = plan.sections.iter().copied().find(|s| *s > section);
                match (next_section, first_section) {
                    (Some(section), _) => PipelineState::Pass { pass, section },
                    (None, Some(section)) if pass + 1 < plan.passes.len() => PipelineState::Pass {
                        pass: pass + 1,
                        section,
                    },
                    _ => after_passes,
                }
            }
            PipelineState::Synthesis => PipelineState::Reconciliation,
            PipelineState::Reconciliation => PipelineState::Verified,
            PipelineState::Verified => PipelineState::Completed,
            PipelineState::Completed => PipelineState::Completed,
            PipelineState::Failed => PipelineState::Failed,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Pending => f.write_str("pending"),
            PipelineState::Pass { pass, section } => write!(f, "pass[{pass}]/{section}"),
            PipelineState::Synthesis => f.write_str("synthesis"),
            PipelineState::Reconciliation => f.write_str("reconciliation"),
            PipelineState::Verified => f.write_str("verified"),
            PipelineState::Completed => f.write_str("completed"),
            PipelineState::Failed => f.write_str("failed"),
        }
    }
}

/// One (pass, section, category) extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub pass: String,
    pub section: SectionScope,
    pub category: Category,
}

/// Ordered work for one case.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPlan {
    pub passes: Vec<PassConfig>,
    /// Present sections in processing order
    pub sections: Vec<SectionScope>,
    pub synthesis: bool,
}

impl ExtractionPlan {
    pub fn build(config: &PipelineConfig, present: &[SectionScope]) -> Self {
        Self {
            passes: config.passes.clone(),
            sections: SectionScope::ORDERED
                .iter()
                .copied()
                .filter(|s| present.contains(s))
                .collect(),
            synthesis: config.synthesis,
        }
    }

    pub fn units(&self) -> Vec<WorkUnit> {
        let mut units = Vec::new();
        for pass in &self.passes {
            for section in &self.sections {
                for category in &pass.categories {
                    units.push(WorkUnit {
                        pass: pass.name.clone(),
                        section: *section,
                        category: *category,
                    });
                }
            }
        }
        units
    }

    pub fn categories(&self) -> Vec<Category> {
        self.passes
            .iter()
            .flat_map(|p| p.categories.iter().copied())
            .collect()
    }

    /// States visited by a successful run, in order.
    pub fn states(&self) -> Vec<PipelineState> {
        let mut states = vec![PipelineState::Pending];
        let mut state = PipelineState::Pending;
        while !state.is_terminal() {
            state = state.advance(self);
            states.push(state);
        }
        states
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// How a stage ended.
#[derive(Debug)]
enum Flow {
    Continue,
    /// A terminating step has been recorded
    Failed(String),
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    store: Arc<dyn ConceptStore>,
    cases: Arc<dyn CaseSource>,
    provider: Arc<dyn ExtractionProvider>,
    recorder: SessionRecorder,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn ConceptStore>,
        cases: Arc<dyn CaseSource>,
        provider: Arc<dyn ExtractionProvider>,
        recorder: SessionRecorder,
    ) -> Self {
        Self {
            config,
            store,
            cases,
            provider,
            recorder,
        }
    }

    /// Drive one case to `Completed` or `Failed`.
    ///
    /// Returns `Err` only when the case cannot be started (unknown case, no
    /// sections) or the ledger itself fails; every other failure is recorded
    /// in the session and the session id is returned.
    pub async fn run(
        &self,
        case_id: &CaseId,
        cancel: &CancellationToken,
    ) -> Result<SessionId, PipelineError> {
        let present = self.cases.sections(case_id).await?;
        let plan = ExtractionPlan::build(&self.config, &present);
        let session = self.recorder.start_session(case_id.clone())?;

        let span = tracing::info_span!("session", session_id = %session.id, case_id = %case_id);
        let mut run = SessionRun {
            orchestrator: self,
            session_id: session.id,
            case_id: case_id.clone(),
            plan,
            state: PipelineState::Pending,
            drafts: DraftSet::new(),
            context: ContextBuilder::new(self.store.clone(), self.config.max_context_entries),
            merge: MergeEngine::new(self.store.clone()),
        };
        run.drive(cancel).instrument(span).await?;
        Ok(session.id)
    }
}

struct SessionRun<'a> {
    orchestrator: &'a Orchestrator,
    session_id: SessionId,
    case_id: CaseId,
    plan: ExtractionPlan,
    state: PipelineState,
    drafts: DraftSet,
    context: ContextBuilder,
    merge: MergeEngine,
}

impl SessionRun<'_> {
    fn config(&self) -> &PipelineConfig {
        &self.orchestrator.config
    }

    fn recorder(&self) -> &SessionRecorder {
        &self.orchestrator.recorder
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), LedgerError> {
        loop {
            let next = self.state.advance(&self.plan);
            tracing::info!(from = %self.state, to = %next, "transition");
            self.state = next;

            let flow = match next {
                PipelineState::Pass { pass, section } => self.run_stage(pass, section, cancel).await?,
                PipelineState::Synthesis => self.run_synthesis(cancel).await?,
                PipelineState::Reconciliation => self.run_reconciliation(cancel).await?,
                PipelineState::Verified => self.self_check()?,
                PipelineState::Completed => {
                    self.recorder()
                        .complete_session(self.session_id, SessionOutcome::Completed)?;
                    return Ok(());
                }
                PipelineState::Pending | PipelineState::Failed => return Ok(()),
            };

            if let Flow::Failed(reason) = flow {
                self.state = PipelineState::Failed;
                self.recorder()
                    .complete_session(self.session_id, SessionOutcome::Failed { reason })?;
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------------

    async fn run_stage(
        &mut self,
        pass: usize,
        section: SectionScope,
        cancel: &CancellationToken,
    ) -> Result<Flow, LedgerError> {
        let Some(pass_config) = self.plan.passes.get(pass).cloned() else {
            return Ok(Flow::Continue);
        };

        let text = match self
            .orchestrator
            .cases
            .get_section_text(&self.case_id, section)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                let mut draft = StepDraft::new(&pass_config.name, StepType::ContextInjection);
                draft.section = Some(section);
                return self.terminate(draft, format!("document error: {e}"));
            }
        };

        for category in &pass_config.categories {
            if let Flow::Failed(reason) = self
                .run_unit(&pass_config.name, section, *category, &text, cancel)
                .await?
            {
                return Ok(Flow::Failed(reason));
            }
        }
        Ok(Flow::Continue)
    }

    async fn run_unit(
        &mut self,
        phase: &str,
        section: SectionScope,
        category: Category,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Flow, LedgerError> {
        if cancel.is_cancelled() {
            return self.cancelled(&format!("{phase}/{section}/{category} context"));
        }

        let started = Instant::now();
        let mut draft = StepDraft::new(phase, StepType::ContextInjection);
        draft.category = Some(category);
        draft.section = Some(section);
        draft.input = json!({
            "category": category,
            "exclude_case": self.case_id,
            "max_entries": self.config().max_context_entries,
        });

        let context = match self.context.build_context(category, &self.case_id).await {
            Ok(context) => context,
            Err(e) => {
                draft.elapsed_ms = started.elapsed().as_millis() as u64;
                return self.terminate(draft, format!("concept store error: {e}"));
            }
        };
        let digest = context.digest();
        draft.output = json!({
            "entries": context.entries,
            "omitted": context.omitted,
        });
        draft.result = json!({ "digest": digest, "entry_count": context.len() });
        draft.elapsed_ms = started.elapsed().as_millis() as u64;
        self.recorder().append_step(self.session_id, draft)?;

        if cancel.is_cancelled() {
            return self.cancelled(&format!("{phase}/{section}/{category} extraction"));
        }

        let request = ExtractionRequest {
            target: ExtractionTarget::Category { category },
            section,
            section_text: text.to_string(),
            context: context.entries,
            context_omitted: context.omitted,
        };
        self.model_call(phase, Some(category), request, digest).await
    }

    // ------------------------------------------------------------------------
    // Synthesis
    // ------------------------------------------------------------------------

    async fn run_synthesis(&mut self, cancel: &CancellationToken) -> Result<Flow, LedgerError> {
        const PHASE: &str = "synthesis";
        if cancel.is_cancelled() {
            return self.cancelled(PHASE);
        }

        let mut text = String::new();
        for section in self.plan.sections.clone() {
            match self
                .orchestrator
                .cases
                .get_section_text(&self.case_id, section)
                .await
            {
                Ok(body) => {
                    text.push_str(&format!("## {}\n\n{}\n\n", section.heading(), body.trim()));
                }
                Err(e) => {
                    let mut draft = StepDraft::new(PHASE, StepType::ContextInjection);
                    draft.section = Some(SectionScope::WholeCase);
                    return self.terminate(draft, format!("document error: {e}"));
                }
            }
        }

        let context = self.draft_context();
        let digest = context.digest();
        let request = ExtractionRequest {
            target: ExtractionTarget::Synthesis {
                categories: self.plan.categories(),
            },
            section: SectionScope::WholeCase,
            section_text: text.trim_end().to_string(),
            context: context.entries,
            context_omitted: context.omitted,
        };
        self.model_call(PHASE, None, request, digest).await
    }

    /// This session's drafts as context, capped per category.
    fn draft_context(&self) -> BuiltContext {
        let max = self.config().max_context_entries;
        let mut per_category: BTreeMap<Category, usize> = BTreeMap::new();
        let mut context = BuiltContext::empty();
        for entity in self.drafts.reconcile().entities {
            let seen = per_category.entry(entity.category).or_default();
            *seen += 1;
            if *seen > max {
                context.omitted += 1;
                continue;
            }
            context.entries.push(ContextEntry {
                category: entity.category,
                label: entity.label,
                definition: entity.definition,
            });
        }
        context
    }

    // ------------------------------------------------------------------------
    // Model calls
    // ------------------------------------------------------------------------

    async fn model_call(
        &mut self,
        phase: &str,
        category: Option<Category>,
        request: ExtractionRequest,
        context_digest: String,
    ) -> Result<Flow, LedgerError> {
        let step_number = self.recorder().next_step_number(self.session_id)?;
        let started = Instant::now();

        let mut draft = StepDraft::new(phase, StepType::ModelCall);
        draft.category = category;
        draft.section = Some(request.section);
        draft.input = json!({
            "target": request.target,
            "section": request.section,
            "section_chars": request.section_text.chars().count(),
            "context_entries": request.context.len(),
            "context_omitted": request.context_omitted,
            "context_digest": context_digest,
        });

        let (outcome, attempts) = self.call_with_retry(&request, phase).await;
        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                draft.model_identity = Some(self.orchestrator.provider.model_identity().to_string());
                draft.output = json!({
                    "attempts": attempts,
                    "raw_response": err.raw_response(),
                });
                draft.elapsed_ms = started.elapsed().as_millis() as u64;
                let reason = if err.is_transient() {
                    format!("{phase}: retry budget exhausted after {attempts} attempts: {err}")
                } else {
                    format!("{phase}: {err}")
                };
                return self.terminate(draft, reason);
            }
        };

        let ExtractionResponse {
            candidates,
            model_identity,
            token_usage,
        } = response;
        draft.model_identity = Some(model_identity);
        draft.token_usage = Some(token_usage);
        draft.output = json!({ "candidates": candidates, "attempts": attempts });

        let confidences: Vec<f64> = candidates.iter().filter_map(|c| c.confidence).collect();
        if !confidences.is_empty() {
            draft.confidence = Some(confidences.iter().sum::<f64>() / confidences.len() as f64);
        }

        let mut resolved = Vec::with_capacity(candidates.len());
        let mut created = 0u32;
        let mut merged = 0u32;
        for extracted in &candidates {
            let candidate = CandidateEntity {
                label: extracted.label.clone(),
                definition: extracted.definition.clone(),
                category: extracted.category,
                section: request.section,
                attributes: extracted.attributes.clone(),
                confidence: extracted.confidence,
                step_number,
            };
            let resolution = match self.merge.resolve(&candidate, &self.case_id).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    draft.result = json!({ "resolved": resolved });
                    draft.elapsed_ms = started.elapsed().as_millis() as u64;
                    return self.terminate(draft, format!("{phase}: concept store error: {e}"));
                }
            };
            if resolution.created {
                created += 1;
            }
            if self.drafts.record(
                self.session_id,
                &self.case_id,
                resolution.class.id.clone(),
                &candidate,
            ) {
                merged += 1;
            }
            resolved.push(json!({
                "label": candidate.label,
                "category": candidate.category,
                "class_id": resolution.class.id,
                "created": resolution.created,
            }));
        }

        draft.result = json!({ "resolved": resolved, "created_classes": created });
        draft.entity_count = candidates.len() as u32;
        draft.discarded_duplicates = merged;
        draft.elapsed_ms = started.elapsed().as_millis() as u64;

        let step = self.recorder().append_step(self.session_id, draft)?;
        if step.step_number != step_number {
            return Err(LedgerError::Corrupt(format!(
                "session {} step {} recorded where {} was expected",
                self.session_id, step.step_number, step_number
            )));
        }
        tracing::info!(
            phase,
            category = category.map(|c| c.as_str()).unwrap_or("*"),
            section = %request.section,
            candidates = candidates.len(),
            created,
            merged,
            "extraction recorded"
        );

        self.recorder()
            .record_entities(self.session_id, self.drafts.reconcile().entities)?;
        Ok(Flow::Continue)
    }

    /// Call the provider under the retry policy. Returns the outcome and the
    /// number of attempts made.
    async fn call_with_retry(
        &self,
        request: &ExtractionRequest,
        phase: &str,
    ) -> (Result<ExtractionResponse, ProviderError>, u32) {
        let policy = &self.config().retry;
        let timeout = self.config().call_timeout();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(timeout, self.orchestrator.provider.extract(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "provider call timed out after {} ms",
                        timeout.as_millis()
                    ))),
                };

            match result {
                Ok(response) => return (Ok(response), attempt),
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = match err.retry_after() {
                        Some(hint) => policy.backoff(attempt).max(hint),
                        None => policy.backoff(attempt),
                    };
                    tracing::warn!(
                        phase,
                        category = request.target.category().map(|c| c.as_str()).unwrap_or("*"),
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reconciliation & self-check
    // ------------------------------------------------------------------------

    async fn run_reconciliation(&mut self, cancel: &CancellationToken) -> Result<Flow, LedgerError> {
        const PHASE: &str = "reconciliation";
        if cancel.is_cancelled() {
            return self.cancelled(PHASE);
        }

        let started = Instant::now();
        let ontology = self.config().ontology_name(&self.case_id);
        let mut draft = StepDraft::new(PHASE, StepType::Reconciliation);
        draft.section = Some(SectionScope::WholeCase);
        draft.model_identity = Some(ALGORITHMIC_MODEL.to_string());
        draft.input = json!({ "drafts": self.drafts.len(), "ontology": ontology });

        if let Err(e) = self
            .orchestrator
            .store
            .register_case_ontology(&self.case_id, &ontology)
            .await
        {
            draft.elapsed_ms = started.elapsed().as_millis() as u64;
            return self.terminate(draft, format!("concept store error: {e}"));
        }

        let reconciled = self.drafts.reconcile();
        let mut entities = reconciled.entities;
        for entity in &mut entities {
            entity.published = true;
        }
        let class_ids: Vec<&str> = entities.iter().map(|e| e.class_id.as_str()).collect();
        draft.output = json!({
            "entities": entities.len(),
            "discarded_duplicates": reconciled.discarded,
            "ontology": ontology,
        });
        draft.result = json!({ "class_ids": class_ids });
        draft.discarded_duplicates = reconciled.discarded;

        let published = entities.len();
        self.recorder().record_entities(self.session_id, entities)?;
        draft.elapsed_ms = started.elapsed().as_millis() as u64;
        self.recorder().append_step(self.session_id, draft)?;
        tracing::info!(
            published,
            discarded = reconciled.discarded,
            ontology = %ontology,
            "reconciled"
        );
        Ok(Flow::Continue)
    }

    fn self_check(&mut self) -> Result<Flow, LedgerError> {
        let steps = self.recorder().ledger().steps(self.session_id)?;
        let entities = self.recorder().ledger().entities(self.session_id)?;
        let issues = verifier::ledger_consistency(&steps, &entities);
        if issues.is_empty() {
            return Ok(Flow::Continue);
        }

        let messages: Vec<String> = issues.iter().map(|i| i.message.clone()).collect();
        let mut draft = StepDraft::new("verification", StepType::Reconciliation);
        draft.section = Some(SectionScope::WholeCase);
        draft.model_identity = Some(ALGORITHMIC_MODEL.to_string());
        draft.output = json!({ "issues": issues });
        self.terminate(draft, format!("self-check failed: {}", messages.join("; ")))
    }

    // ------------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------------

    /// Record `draft` as the terminating step with `reason` as its error.
    fn terminate(&self, mut draft: StepDraft, reason: String) -> Result<Flow, LedgerError> {
        tracing::error!(phase = %draft.phase, step_type = %draft.step_type, %reason, "terminating session");
        draft.error = Some(reason.clone());
        self.recorder().append_step(self.session_id, draft)?;
        Ok(Flow::Failed(reason))
    }

    fn cancelled(&self, before: &str) -> Result<Flow, LedgerError> {
        let reason = format!("session cancelled before {before}");
        let mut draft = StepDraft::new("cancelled", StepType::Reconciliation);
        draft.section = Some(SectionScope::WholeCase);
        draft.model_identity = Some(ALGORITHMIC_MODEL.to_string());
        draft.input = json!({ "state": self.state.to_string() });
        self.terminate(draft, reason)
    }
}
