//! Orchestrator tests against a scripted provider
//!
//! Covers:
//! 1. Step layout of a clean run (context → model call, synthesis, reconciliation)
//! 2. Retry on transient errors and call timeouts
//! 3. Fatal responses keep the raw payload
//! 4. Document errors before a session starts
//! 5. Durable stores reopen into a verifiable session

use casegraph_pipeline::provider::candidate;
use casegraph_pipeline::*;
use casegraph_store::{
    CaseId, Category, ConceptStore, FileConceptStore, Ledger, MemoryConceptStore, SectionScope,
    SessionStatus, StepType, ALGORITHMIC_MODEL, DEFAULT_CLASS_URI_BASE,
};
use std::sync::Arc;
use std::time::Duration;

const MODEL: &str = "scripted-extractor";

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
        ..Default::default()
    }
}

fn facts_only(id: &str, text: &str) -> CaseDocument {
    CaseDocument::new(id).with_section(SectionScope::Facts, text)
}

struct Harness {
    pipeline: CasePipeline,
    store: Arc<MemoryConceptStore>,
    provider: Arc<ScriptedProvider>,
}

fn harness(config: PipelineConfig, cases: InMemoryCases, provider: ScriptedProvider) -> Harness {
    let store = Arc::new(MemoryConceptStore::new());
    let provider = Arc::new(provider);
    let pipeline = CasePipeline::new(
        config,
        store.clone(),
        Arc::new(cases),
        provider.clone(),
        Arc::new(Ledger::in_memory()),
    )
    .unwrap();
    Harness {
        pipeline,
        store,
        provider,
    }
}

#[tokio::test]
async fn test_clean_run_step_layout() {
    let cases = InMemoryCases::new().with_case(
        facts_only("case-1", "Engineer A was retained by the county.")
            .with_section(SectionScope::Resolution, "Engineer A acted ethically."),
    );
    let provider = ScriptedProvider::new(MODEL).on(
        Category::Role,
        ScriptedReply::candidates([candidate(Category::Role, "Engineer A", "Retained engineer")]),
    );
    let h = harness(fast_config(), cases, provider);

    let session_id = h.pipeline.run_session(&CaseId::from("case-1")).await.unwrap();
    let report = h.pipeline.get_session_report(session_id).unwrap();

    // 9 categories × 2 sections × (context + model call) + synthesis + reconciliation
    assert_eq!(report.session.status, SessionStatus::Completed);
    assert_eq!(report.steps.len(), 9 * 2 * 2 + 2);
    assert_eq!(report.session.aggregates.total_steps as usize, report.steps.len());
    assert_eq!(report.session.aggregates.llm_calls, 9 * 2 + 1);

    for (idx, step) in report.steps.iter().enumerate() {
        assert_eq!(step.step_number as usize, idx + 1);
    }
    assert_eq!(report.steps[0].step_type, StepType::ContextInjection);
    assert_eq!(report.steps[0].category, Some(Category::Role));
    assert_eq!(report.steps[0].section, Some(SectionScope::Facts));
    assert_eq!(report.steps[1].step_type, StepType::ModelCall);
    assert_eq!(report.steps[1].model_identity.as_deref(), Some(MODEL));
    assert_eq!(report.steps[1].entity_count, 1);
    // Resolution sweep of pass 1 follows the facts sweep.
    assert_eq!(report.steps[6].section, Some(SectionScope::Resolution));

    let synthesis = &report.steps[report.steps.len() - 2];
    assert_eq!(synthesis.phase, "synthesis");
    assert_eq!(synthesis.section, Some(SectionScope::WholeCase));
    let reconciliation = report.steps.last().unwrap();
    assert_eq!(reconciliation.step_type, StepType::Reconciliation);
    assert_eq!(reconciliation.model_identity.as_deref(), Some(ALGORITHMIC_MODEL));

    assert_eq!(report.entities.len(), 1);
    assert!(report.entities[0].published);
    assert_eq!(h.store.len(), 1);
    assert_eq!(
        h.store.case_ontology(&CaseId::from("case-1")).await.unwrap().as_deref(),
        Some("case-case-1")
    );
}

#[tokio::test]
async fn test_context_step_records_digest_and_entries() {
    let cases = InMemoryCases::new().with_case(
        facts_only("case-1", "The Client hired Engineer B.")
            .with_section(SectionScope::Discussion, "The Client relied on Engineer B."),
    );
    let provider = ScriptedProvider::new(MODEL).on_section(
        Category::Role,
        SectionScope::Facts,
        ScriptedReply::candidates([candidate(Category::Role, "Client", "")]),
    );
    let h = harness(fast_config(), cases, provider);
    let session_id = h.pipeline.run_session(&CaseId::from("case-1")).await.unwrap();
    let steps = h.pipeline.get_session_report(session_id).unwrap().steps;

    // The case's own new classes are excluded from its later context.
    let discussion_ctx = steps
        .iter()
        .find(|s| {
            s.step_type == StepType::ContextInjection
                && s.category == Some(Category::Role)
                && s.section == Some(SectionScope::Discussion)
        })
        .unwrap();
    assert_eq!(discussion_ctx.output["entries"], serde_json::json!([]));
    assert_eq!(discussion_ctx.result["digest"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn test_transient_then_success_is_retried() {
    let cases = InMemoryCases::new().with_case(facts_only("case-1", "text"));
    let provider = ScriptedProvider::new(MODEL)
        .on(Category::Role, ScriptedReply::Transient("HTTP 503".into()))
        .on(
            Category::Role,
            ScriptedReply::candidates([candidate(Category::Role, "Owner", "")]),
        );
    let h = harness(fast_config(), cases, provider);

    let session_id = h.pipeline.run_session(&CaseId::from("case-1")).await.unwrap();
    let report = h.pipeline.get_session_report(session_id).unwrap();
    assert_eq!(report.session.status, SessionStatus::Completed);
    assert_eq!(report.steps[1].output["attempts"], serde_json::json!(2));
    assert!(report.steps[1].error.is_none());
    assert_eq!(report.entities.len(), 1);
}

#[tokio::test]
async fn test_call_timeout_counts_as_transient() {
    let cases = InMemoryCases::new().with_case(facts_only("case-1", "text"));
    let provider = ScriptedProvider::new(MODEL)
        .on(Category::Role, ScriptedReply::Stall(Duration::from_millis(500)));
    let config = PipelineConfig {
        call_timeout_ms: 20,
        ..fast_config()
    };
    let h = harness(config, cases, provider);

    let session_id = h.pipeline.run_session(&CaseId::from("case-1")).await.unwrap();
    let report = h.pipeline.get_session_report(session_id).unwrap();
    assert_eq!(report.session.status, SessionStatus::Completed);
    assert_eq!(report.steps[1].output["attempts"], serde_json::json!(2));
}

#[tokio::test]
async fn test_rate_limit_hint_outlasts_backoff() {
    let cases = InMemoryCases::new().with_case(facts_only("case-1", "text"));
    let provider = ScriptedProvider::new(MODEL)
        .on(
            Category::Role,
            ScriptedReply::RateLimited(Duration::from_millis(150)),
        )
        .on(
            Category::Role,
            ScriptedReply::candidates([candidate(Category::Role, "Owner", "")]),
        );
    let h = harness(fast_config(), cases, provider);

    let started = std::time::Instant::now();
    let session_id = h.pipeline.run_session(&CaseId::from("case-1")).await.unwrap();
    let elapsed = started.elapsed();

    let report = h.pipeline.get_session_report(session_id).unwrap();
    assert_eq!(report.session.status, SessionStatus::Completed);
    assert_eq!(report.steps[1].output["attempts"], serde_json::json!(2));
    // fast_config backs off at most 4ms; the endpoint asked for 150ms.
    assert!(elapsed >= Duration::from_millis(150), "retried after {elapsed:?}");
}

#[tokio::test]
async fn test_fatal_response_fails_without_retry() {
    let cases = InMemoryCases::new().with_case(facts_only("case-1", "text"));
    let provider = ScriptedProvider::new(MODEL).on(
        Category::State,
        ScriptedReply::Fatal {
            message: "response is not valid JSON".into(),
            raw_response: "{oops".into(),
        },
    );
    let h = harness(fast_config(), cases, provider);

    let session_id = h.pipeline.run_session(&CaseId::from("case-1")).await.unwrap();
    let report = h.pipeline.get_session_report(session_id).unwrap();

    assert_eq!(report.session.status, SessionStatus::Failed);
    // role (2 steps) + state (2 steps), then stop
    assert_eq!(report.steps.len(), 4);
    assert_eq!(h.provider.call_count(), 2);

    let last = report.steps.last().unwrap();
    assert_eq!(last.category, Some(Category::State));
    assert_eq!(last.output["raw_response"], serde_json::json!("{oops"));
    assert_eq!(last.output["attempts"], serde_json::json!(1));
    assert!(last.error.as_deref().unwrap().contains("not valid JSON"));
    assert!(report
        .session
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with("contextual_framework"));
}

#[tokio::test]
async fn test_synthesis_sees_session_drafts() {
    let cases = InMemoryCases::new().with_case(
        facts_only("case-1", "Engineer A inspected the dam.")
            .with_section(SectionScope::Discussion, "The inspection was late."),
    );
    let provider = ScriptedProvider::new(MODEL)
        .on(
            Category::Role,
            ScriptedReply::candidates([candidate(Category::Role, "Engineer A", "Inspector")]),
        )
        .on_synthesis(ScriptedReply::candidates([candidate(
            Category::Event,
            "Late Inspection",
            "Inspection past its deadline",
        )]));
    let h = harness(fast_config(), cases, provider);

    let session_id = h.pipeline.run_session(&CaseId::from("case-1")).await.unwrap();
    let calls = h.provider.calls();
    let synthesis = calls.last().unwrap();
    assert!(matches!(synthesis.target, ExtractionTarget::Synthesis { .. }));
    assert!(synthesis.section_text.starts_with("## Facts"));
    assert!(synthesis.section_text.contains("## Discussion"));
    assert_eq!(synthesis.context.len(), 1);
    assert_eq!(synthesis.context[0].label, "Engineer A");

    let entities = h.pipeline.get_session_report(session_id).unwrap().entities;
    let event = entities.iter().find(|e| e.category == Category::Event).unwrap();
    assert_eq!(event.sections, vec![SectionScope::WholeCase]);
}

#[tokio::test]
async fn test_cross_section_mentions_reconcile() {
    let cases = InMemoryCases::new().with_case(
        facts_only("case-1", "The Owner paid.")
            .with_section(SectionScope::Discussion, "The owner complained."),
    );
    let mut owner = candidate(Category::Role, "Owner", "");
    owner.attributes.insert("paid".into(), serde_json::json!(true));
    let provider = ScriptedProvider::new(MODEL)
        .on_section(
            Category::Role,
            SectionScope::Facts,
            ScriptedReply::candidates([owner]),
        )
        .on_section(
            Category::Role,
            SectionScope::Discussion,
            ScriptedReply::candidates([candidate(Category::Role, "OWNER!", "")]),
        );
    let config = PipelineConfig {
        synthesis: false,
        ..fast_config()
    };
    let h = harness(config, cases, provider);

    let session_id = h.pipeline.run_session(&CaseId::from("case-1")).await.unwrap();
    let report = h.pipeline.get_session_report(session_id).unwrap();
    assert_eq!(report.session.status, SessionStatus::Completed);
    assert_eq!(report.entities.len(), 1);

    let owner = &report.entities[0];
    assert_eq!(owner.source_labels, vec!["Owner", "OWNER!"]);
    assert_eq!(owner.source_steps.len(), 2);
    assert_eq!(owner.attributes["paid"], serde_json::json!(true));
    assert_eq!(report.session.aggregates.recorded_entities, 2);
    assert_eq!(report.session.aggregates.discarded_duplicates, 1);
    assert_eq!(report.session.aggregates.committed_entities, 1);
}

#[tokio::test]
async fn test_document_errors_fail_before_session_start() {
    let cases = InMemoryCases::new().with_case(CaseDocument::new("empty"));
    let h = harness(fast_config(), cases, ScriptedProvider::new(MODEL));

    let err = h.pipeline.run_session(&CaseId::from("missing")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Document(DocumentError::UnknownCase(_))));

    let err = h.pipeline.run_session(&CaseId::from("empty")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Document(DocumentError::NoSections(_))));

    assert!(h.pipeline.list_sessions(None).is_empty());
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_session_queries() {
    let h = harness(fast_config(), InMemoryCases::new(), ScriptedProvider::new(MODEL));
    let id = uuid::Uuid::new_v4();
    assert!(matches!(
        h.pipeline.get_session_report(id),
        Err(PipelineError::UnknownSession(_))
    ));
    assert!(matches!(
        h.pipeline.verify_session(id).await,
        Err(PipelineError::UnknownSession(_))
    ));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = PipelineConfig {
        worker_count: 0,
        ..Default::default()
    };
    let result = CasePipeline::new(
        config,
        Arc::new(MemoryConceptStore::new()),
        Arc::new(InMemoryCases::new()),
        Arc::new(ScriptedProvider::new(MODEL)),
        Arc::new(Ledger::in_memory()),
    );
    assert!(matches!(result, Err(PipelineError::Config(ConfigError::ZeroWorkers))));
}

#[tokio::test]
async fn test_durable_run_reopens_and_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let cases_dir = dir.path().join("cases");
    std::fs::create_dir_all(&cases_dir).unwrap();
    std::fs::write(
        cases_dir.join("case-24.json"),
        r#"{ "id": "case-24", "title": "Dam", "sections": { "Facts": "Engineer C signed the report.", "appendix": "ignored" } }"#,
    )
    .unwrap();

    let config = PipelineConfig {
        mandatory_categories: vec![Category::Role],
        ..fast_config()
    };
    let taxonomy_path = dir.path().join("taxonomy.json");
    let ledger_path = dir.path().join("ledger.wal");

    let session_id = {
        let store = Arc::new(FileConceptStore::open(&taxonomy_path, DEFAULT_CLASS_URI_BASE).unwrap());
        let provider = ScriptedProvider::new(MODEL).on(
            Category::Role,
            ScriptedReply::candidates([candidate(Category::Role, "Engineer C", "Signatory")]),
        );
        let pipeline = CasePipeline::new(
            config.clone(),
            store,
            Arc::new(DirectoryCases::new(&cases_dir)),
            Arc::new(provider),
            Arc::new(Ledger::open(&ledger_path).unwrap()),
        )
        .unwrap();
        pipeline.run_session(&CaseId::from("case-24")).await.unwrap()
    };

    let store = Arc::new(FileConceptStore::open(&taxonomy_path, DEFAULT_CLASS_URI_BASE).unwrap());
    let pipeline = CasePipeline::new(
        config,
        store,
        Arc::new(DirectoryCases::new(&cases_dir)),
        Arc::new(ScriptedProvider::new(MODEL)),
        Arc::new(Ledger::open(&ledger_path).unwrap()),
    )
    .unwrap();

    let report = pipeline.get_session_report(session_id).unwrap();
    assert_eq!(report.session.status, SessionStatus::Completed);
    assert_eq!(report.entities.len(), 1);

    let verification = pipeline.verify_session(session_id).await.unwrap();
    assert!(verification.passed, "{verification}");
    // Non-mandatory categories surface as warnings only.
    assert_eq!(verification.issues_with(IssueCode::Missing).count(), 8);
}
