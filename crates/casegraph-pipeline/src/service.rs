//! Service facade and worker pool.
//!
//! `CasePipeline` is what consumers hold: run sessions (one at a time or as a
//! bounded batch), then audit and verify them. Cases in a batch share the
//! concept store, so classes created by one case become context for the next.

use crate::config::PipelineConfig;
use crate::context::{BuiltContext, ContextBuilder};
use crate::documents::CaseSource;
use crate::error::PipelineError;
use crate::orchestrator::Orchestrator;
use crate::provider::ExtractionProvider;
use crate::recorder::SessionRecorder;
use crate::verifier::{self, VerificationReport, VerifierPolicy};
use casegraph_store::{
    CaseId, Category, ConceptStore, ExtractionSession, ExtractionStep, Ledger, PublishedEntity,
    SessionId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Read-only audit view of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session: ExtractionSession,
    pub steps: Vec<ExtractionStep>,
    pub entities: Vec<PublishedEntity>,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub case_id: CaseId,
    pub result: Result<SessionId, PipelineError>,
}

#[derive(Clone)]
pub struct CasePipeline {
    config: Arc<PipelineConfig>,
    store: Arc<dyn ConceptStore>,
    provider: Arc<dyn ExtractionProvider>,
    ledger: Arc<Ledger>,
    orchestrator: Orchestrator,
}

impl CasePipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ConceptStore>,
        cases: Arc<dyn CaseSource>,
        provider: Arc<dyn ExtractionProvider>,
        ledger: Arc<Ledger>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let config = Arc::new(config);
        let orchestrator = Orchestrator::new(
            config.clone(),
            store.clone(),
            cases,
            provider.clone(),
            SessionRecorder::new(ledger.clone()),
        );
        Ok(Self {
            config,
            store,
            provider,
            ledger,
            orchestrator,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub async fn run_session(&self, case_id: &CaseId) -> Result<SessionId, PipelineError> {
        self.run_session_with_cancel(case_id, &CancellationToken::new())
            .await
    }

    pub async fn run_session_with_cancel(
        &self,
        case_id: &CaseId,
        cancel: &CancellationToken,
    ) -> Result<SessionId, PipelineError> {
        self.orchestrator.run(case_id, cancel).await
    }

    /// Run every case on a pool of `worker_count` workers. Outcomes are
    /// returned in input order.
    pub async fn run_batch(&self, case_ids: &[CaseId]) -> Vec<BatchOutcome> {
        self.run_batch_with_cancel(case_ids, &CancellationToken::new())
            .await
    }

    pub async fn run_batch_with_cancel(
        &self,
        case_ids: &[CaseId],
        cancel: &CancellationToken,
    ) -> Vec<BatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count));
        let mut workers = JoinSet::new();

        for (idx, case_id) in case_ids.iter().cloned().enumerate() {
            let pipeline = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => pipeline.run_session_with_cancel(&case_id, &cancel).await,
                    Err(e) => Err(PipelineError::Worker(e.to_string())),
                };
                (idx, result)
            });
        }

        let mut results: Vec<Option<Result<SessionId, PipelineError>>> =
            (0..case_ids.len()).map(|_| None).collect();
        let mut last_join_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => {
                    tracing::error!(error = %e, "batch worker aborted");
                    last_join_error = Some(e.to_string());
                }
            }
        }

        case_ids
            .iter()
            .cloned()
            .zip(results)
            .map(|(case_id, result)| BatchOutcome {
                result: result.unwrap_or_else(|| {
                    Err(PipelineError::Worker(
                        last_join_error
                            .clone()
                            .unwrap_or_else(|| "worker exited without a result".to_string()),
                    ))
                }),
                case_id,
            })
            .collect()
    }

    pub fn get_session_report(&self, session_id: SessionId) -> Result<SessionReport, PipelineError> {
        Ok(SessionReport {
            session: self.ledger.session(session_id)?,
            steps: self.ledger.steps(session_id)?,
            entities: self.ledger.entities(session_id)?,
        })
    }

    /// Verify a session against the current taxonomy. Errors only for an
    /// unknown session or an unreadable store.
    pub async fn verify_session(
        &self,
        session_id: SessionId,
    ) -> Result<VerificationReport, PipelineError> {
        let report = self.get_session_report(session_id)?;
        let taxonomy = self.store.snapshot().await?;
        let policy = VerifierPolicy {
            expected_categories: self.config.extracted_categories(),
            mandatory_categories: self.config.mandatory_categories.clone(),
            expected_model: Some(self.provider.model_identity().to_string()),
            ontology_name: self.config.ontology_name(&report.session.case_id),
        };
        let verification = verifier::verify(
            &report.session,
            &report.steps,
            &report.entities,
            &taxonomy,
            &policy,
        );
        tracing::info!(
            session_id = %session_id,
            passed = verification.passed,
            issues = verification.issues.len(),
            "session verified"
        );
        Ok(verification)
    }

    pub fn list_sessions(&self, case_id: Option<&CaseId>) -> Vec<ExtractionSession> {
        self.ledger.list_sessions(case_id)
    }

    pub async fn build_context(
        &self,
        category: Category,
        exclude_case: &CaseId,
    ) -> Result<BuiltContext, PipelineError> {
        let builder = ContextBuilder::new(self.store.clone(), self.config.max_context_entries);
        Ok(builder.build_context(category, exclude_case).await?)
    }
}
