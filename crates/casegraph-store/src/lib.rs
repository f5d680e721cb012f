//! Casegraph Store: the shared concept taxonomy and the extraction ledger
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         CASEGRAPH STORE                             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌──────────────┐   compare-and-create   ┌───────────────────────┐  │
//! │  │  Pipelines   │───────────────────────►│  ConceptStore         │  │
//! │  │  (N cases,   │   (category, label)    │  memory │ taxonomy.json│  │
//! │  │  concurrent) │◄───────────────────────│  classes + provenance │  │
//! │  └──────┬───────┘    winner's class      └───────────────────────┘  │
//! │         │                                                           │
//! │         │ append-only                                               │
//! │         ▼                                                           │
//! │  ┌──────────────┐     ┌─────────────┐                               │
//! │  │    Ledger    │────►│  ledger.wal │  length + SHA-256 + CBOR      │
//! │  │ sessions     │     │  (replayed  │                               │
//! │  │ steps        │     │   on open)  │                               │
//! │  │ entities     │     └─────────────┘                               │
//! │  └──────────────┘                                                   │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Compare-and-create**: at most one class per `(category, normalized_label)`
//! - **Provenance**: first discoverer is immutable, re-derivations accumulate
//! - **Append-only**: steps are numbered `1..=n` per session and never rewritten
//! - **Durable**: the ledger WAL survives restarts and torn tail writes

pub mod concept;
pub mod file_store;
pub mod ledger;
pub mod model;
pub mod normalize;
pub mod persistence;

#[cfg(test)]
mod tests;

pub use concept::{ConceptStore, ConceptStoreError, MemoryConceptStore, DEFAULT_CLASS_URI_BASE};
pub use file_store::FileConceptStore;
pub use ledger::{Ledger, LedgerError};
pub use model::{
    CandidateEntity, CaseId, Category, ClassId, ClassProposal, ConceptClass, ConceptKey,
    EntityKey, ExtractionSession, ExtractionStep, PublishedEntity, SectionScope,
    SessionAggregates, SessionId, SessionStatus, StepDraft, StepType, TaxonomySnapshot,
    TokenUsage, UnknownCategory, ALGORITHMIC_MODEL,
};
pub use normalize::{concept_key, normalize_label};
