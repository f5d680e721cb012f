//! Casegraph Pipeline: multi-pass case concept extraction
//!
//! Reads a case section by section, asks a language model for typed
//! entities, grows the shared concept taxonomy one compare-and-create at a
//! time, and leaves an append-only audit trail that the verifier can check.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        CASE EXTRACTION PIPELINE                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  ┌────────────┐  section text  ┌──────────────┐   known classes          │
//! │  │ CaseSource │───────────────►│ Orchestrator │◄──────────────┐          │
//! │  └────────────┘                │ (per case)   │               │          │
//! │                                └──┬────────┬──┘        ┌──────┴───────┐  │
//! │                      request +    │        │ candidates│   Context    │  │
//! │                      context      ▼        │           │   Builder    │  │
//! │                        ┌──────────────┐    │           └──────▲───────┘  │
//! │                        │  Extraction  │────┘                  │          │
//! │                        │  Provider    │                ┌──────┴───────┐  │
//! │                        │ (LLM + schema│   resolve ───► │ ConceptStore │  │
//! │                        │  validation) │   (merge)      │  (shared)    │  │
//! │                        └──────────────┘                └──────────────┘  │
//! │                                                                          │
//! │   every step ──► SessionRecorder ──► Ledger ──► Verifier ──► report      │
//! │                                                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Passes
//! - `contextual_framework`: roles, states, resources
//! - `normative_requirements`: principles, obligations, constraints, capabilities
//! - `temporal_dynamics`: actions, events
//!
//! Each pass sweeps the case's sections in order (facts, discussion,
//! resolution), followed by an optional whole-case synthesis pass and an
//! algorithmic reconciliation step.
//!
//! ## Failure model
//! - Transient provider errors are retried with exponential backoff, never
//!   sooner than a rate-limit hint allows
//! - Fatal provider errors fail the session, raw response kept in the log
//! - Creation races are resolved by re-reading the winning class
//! - Verification never errors; it returns a report

pub mod config;
pub mod context;
pub mod documents;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod provider;
pub mod recorder;
pub mod service;
pub mod verifier;

pub use config::{default_passes, ConfigError, PassConfig, PipelineConfig, ProviderConfig, RetryPolicy};
pub use context::{BuiltContext, ContextBuilder, ContextEntry};
pub use documents::{CaseDocument, CaseSource, DirectoryCases, DocumentError, InMemoryCases};
pub use error::PipelineError;
pub use merge::{DraftSet, MergeEngine, Reconciled, Resolution};
pub use orchestrator::{ExtractionPlan, Orchestrator, PipelineState, WorkUnit};
pub use provider::{
    ExtractedCandidate, ExtractionProvider, ExtractionRequest, ExtractionResponse,
    ExtractionTarget, ProviderError, SchemaValidatingProvider, ScriptedProvider, ScriptedReply,
};
pub use recorder::{SessionOutcome, SessionRecorder};
pub use service::{BatchOutcome, CasePipeline, SessionReport};
pub use verifier::{
    IssueCode, Severity, VerificationIssue, VerificationReport, VerifierPolicy,
};
