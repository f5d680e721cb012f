//! Session/Trace Recorder over the append-only ledger.

use casegraph_store::{
    CaseId, ExtractionSession, ExtractionStep, Ledger, LedgerError, PublishedEntity,
    SessionAggregates, SessionId, SessionStatus, StepDraft,
};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed,
    Failed { reason: String },
}

#[derive(Clone)]
pub struct SessionRecorder {
    ledger: Arc<Ledger>,
}

impl SessionRecorder {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn start_session(&self, case_id: CaseId) -> Result<ExtractionSession, LedgerError> {
        let session = ExtractionSession::start(case_id);
        self.ledger.insert_session(session.clone())?;
        tracing::info!(session_id = %session.id, case_id = %session.case_id, "session started");
        Ok(session)
    }

    pub fn append_step(
        &self,
        session_id: SessionId,
        draft: StepDraft,
    ) -> Result<ExtractionStep, LedgerError> {
        let step = self.ledger.append_step(session_id, draft)?;
        tracing::debug!(
            session_id = %session_id,
            step = step.step_number,
            phase = %step.phase,
            step_type = %step.step_type,
            "step recorded"
        );
        Ok(step)
    }

    /// Number the next appended step will receive. Valid under the
    /// single-writer-per-session discipline.
    pub fn next_step_number(&self, session_id: SessionId) -> Result<u32, LedgerError> {
        Ok(self.ledger.step_count(session_id)? + 1)
    }

    /// Replace the session's entity set.
    pub fn record_entities(
        &self,
        session_id: SessionId,
        entities: Vec<PublishedEntity>,
    ) -> Result<(), LedgerError> {
        self.ledger.upsert_entities(session_id, entities)
    }

    /// Close the session. Aggregates are recomputed from the step log and the
    /// entity table, never carried over from running counters.
    pub fn complete_session(
        &self,
        session_id: SessionId,
        outcome: SessionOutcome,
    ) -> Result<ExtractionSession, LedgerError> {
        let steps = self.ledger.steps(session_id)?;
        let entities = self.ledger.entities(session_id)?;
        let aggregates = SessionAggregates::from_log(&steps, &entities);

        let (status, reason) = match outcome {
            SessionOutcome::Completed => (SessionStatus::Completed, None),
            SessionOutcome::Failed { reason } => (SessionStatus::Failed, Some(reason)),
        };
        let session = self
            .ledger
            .close_session(session_id, status, aggregates, reason)?;

        match session.status {
            SessionStatus::Failed => tracing::error!(
                session_id = %session_id,
                case_id = %session.case_id,
                reason = session.failure_reason.as_deref().unwrap_or(""),
                total_steps = session.aggregates.total_steps,
                "session failed"
            ),
            _ => tracing::info!(
                session_id = %session_id,
                case_id = %session.case_id,
                total_steps = session.aggregates.total_steps,
                published = session.aggregates.published_entities,
                "session completed"
            ),
        }
        Ok(session)
    }
}
