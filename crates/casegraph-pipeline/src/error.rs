use crate::config::ConfigError;
use crate::documents::DocumentError;
use casegraph_store::{ConceptStoreError, LedgerError, SessionId};

/// Errors surfaced by the pipeline service.
///
/// Provider failures never appear here: they are recorded in the session's
/// step log and reflected in its status.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Ledger(LedgerError),
    #[error(transparent)]
    Store(#[from] ConceptStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl From<LedgerError> for PipelineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownSession(id) => PipelineError::UnknownSession(id),
            other => PipelineError::Ledger(other),
        }
    }
}
