//! Store and ledger tests

use super::*;
use std::sync::Arc;
use tempfile::tempdir;

fn proposal(category: Category, label: &str, case: &str) -> ClassProposal {
    ClassProposal {
        category,
        normalized_label: normalize_label(label),
        label: label.to_string(),
        definition: format!("{label} definition"),
        case_id: CaseId::from(case),
    }
}

fn model_step(phase: &str, entity_count: u32) -> StepDraft {
    let mut draft = StepDraft::new(phase, StepType::ModelCall);
    draft.model_identity = Some("test-model".into());
    draft.entity_count = entity_count;
    draft.output = serde_json::json!({ "candidates": entity_count });
    draft
}

// ============================================================================
// Concept store
// ============================================================================

#[tokio::test]
async fn test_create_if_absent_is_compare_and_create() {
    let store = MemoryConceptStore::new();

    let (first, created) = store
        .create_if_absent(proposal(Category::Role, "Engineer A", "case-1"))
        .await
        .unwrap();
    assert!(created);
    assert_eq!(first.id, "urn:casegraph:concept:role/engineer-a");

    let (second, created) = store
        .create_if_absent(proposal(Category::Role, "engineer  a.", "case-2"))
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);
    assert_eq!(second.first_discovered_in_case, CaseId::from("case-1"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_same_label_different_category_is_distinct() {
    let store = MemoryConceptStore::new();
    let (a, _) = store
        .create_if_absent(proposal(Category::Obligation, "Public Safety", "case-1"))
        .await
        .unwrap();
    let (b, created) = store
        .create_if_absent(proposal(Category::Principle, "Public Safety", "case-1"))
        .await
        .unwrap();
    assert!(created);
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn test_discovery_reference_is_idempotent() {
    let store = MemoryConceptStore::new();
    let (class, _) = store
        .create_if_absent(proposal(Category::Role, "Client", "case-1"))
        .await
        .unwrap();

    let case_2 = CaseId::from("case-2");
    store.add_discovery_reference(&class.id, &case_2).await.unwrap();
    let updated = store.add_discovery_reference(&class.id, &case_2).await.unwrap();
    assert_eq!(updated.discovered_in_cases.len(), 1);

    // The first discoverer never appears in the re-derivation set.
    let updated = store
        .add_discovery_reference(&class.id, &CaseId::from("case-1"))
        .await
        .unwrap();
    assert_eq!(updated.discovered_in_cases.len(), 1);
    assert!(updated.references_case(&CaseId::from("case-1")));
    assert!(updated.references_case(&case_2));
}

#[tokio::test]
async fn test_unknown_class_reference_fails() {
    let store = MemoryConceptStore::new();
    let err = store
        .add_discovery_reference("urn:casegraph:concept:role/ghost", &CaseId::from("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConceptStoreError::UnknownClass(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_converges() {
    let store = Arc::new(MemoryConceptStore::new());
    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .create_if_absent(proposal(
                    Category::Resource,
                    "NSPE Code of Ethics",
                    &format!("case-{i}"),
                ))
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    let mut ids = std::collections::BTreeSet::new();
    for handle in handles {
        let (class, was_created) = handle.await.unwrap();
        ids.insert(class.id);
        if was_created {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(ids.len(), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_snapshot_is_sorted_and_tracks_ontologies() {
    let store = MemoryConceptStore::new();
    for label in ["Zoning Board", "Architect", "Municipality"] {
        store
            .create_if_absent(proposal(Category::Role, label, "case-1"))
            .await
            .unwrap();
    }
    store
        .register_case_ontology(&CaseId::from("case-1"), "case-case-1")
        .await
        .unwrap();

    let snapshot = store.snapshot().await.unwrap();
    let ids: Vec<&str> = snapshot.classes.iter().map(|c| c.id.as_str()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert!(snapshot.class("urn:casegraph:concept:role/architect").is_some());
    assert_eq!(
        snapshot.case_ontologies.get(&CaseId::from("case-1")),
        Some(&"case-case-1".to_string())
    );
    assert_eq!(snapshot.classes_referencing(&CaseId::from("case-1")).count(), 3);
}

#[tokio::test]
async fn test_file_store_reload_preserves_provenance() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("taxonomy.json");
    let class_id = {
        let store = FileConceptStore::open(&path, DEFAULT_CLASS_URI_BASE).unwrap();
        let (class, _) = store
            .create_if_absent(proposal(Category::Constraint, "Budget Limit", "case-1"))
            .await
            .unwrap();
        store
            .add_discovery_reference(&class.id, &CaseId::from("case-7"))
            .await
            .unwrap();
        store
            .register_case_ontology(&CaseId::from("case-1"), "case-case-1")
            .await
            .unwrap();
        class.id
    };

    let reopened = FileConceptStore::open(&path, DEFAULT_CLASS_URI_BASE).unwrap();
    let class = reopened.get(&class_id).await.unwrap().expect("class survives reload");
    assert_eq!(class.first_discovered_in_case, CaseId::from("case-1"));
    assert!(class.discovered_in_cases.contains(&CaseId::from("case-7")));
    assert_eq!(
        reopened.case_ontology(&CaseId::from("case-1")).await.unwrap(),
        Some("case-case-1".to_string())
    );
    let (_, created) = reopened
        .create_if_absent(proposal(Category::Constraint, "budget limit", "case-9"))
        .await
        .unwrap();
    assert!(!created);
}

// ============================================================================
// Ledger
// ============================================================================

#[test]
fn test_step_numbers_are_contiguous() {
    let ledger = Ledger::in_memory();
    let session = ExtractionSession::start(CaseId::from("case-1"));
    let id = session.id;
    ledger.insert_session(session).unwrap();

    for n in 1..=5 {
        let step = ledger.append_step(id, model_step("pass", n)).unwrap();
        assert_eq!(step.step_number, n);
    }
    let numbers: Vec<u32> = ledger.steps(id).unwrap().iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

proptest::proptest! {
    #[test]
    fn interleaved_sessions_stay_contiguous(order in proptest::collection::vec(0usize..3, 1..40)) {
        let ledger = Ledger::in_memory();
        let ids: Vec<SessionId> = (0..3)
            .map(|i| {
                let session = ExtractionSession::start(CaseId::from(format!("case-{i}")));
                let id = session.id;
                ledger.insert_session(session).unwrap();
                id
            })
            .collect();

        for which in &order {
            ledger.append_step(ids[*which], model_step("pass", 1)).unwrap();
        }

        for (i, id) in ids.iter().enumerate() {
            let expected = order.iter().filter(|w| **w == i).count() as u32;
            let numbers: Vec<u32> = ledger.steps(*id).unwrap().iter().map(|s| s.step_number).collect();
            proptest::prop_assert_eq!(numbers, (1..=expected).collect::<Vec<_>>());
            proptest::prop_assert_eq!(ledger.step_count(*id).unwrap(), expected);
        }
    }
}

#[test]
fn test_closed_session_rejects_writes() {
    let ledger = Ledger::in_memory();
    let session = ExtractionSession::start(CaseId::from("case-1"));
    let id = session.id;
    ledger.insert_session(session).unwrap();
    ledger.append_step(id, model_step("pass", 1)).unwrap();

    let steps = ledger.steps(id).unwrap();
    let aggregates = SessionAggregates::from_log(&steps, std::iter::empty());
    let closed = ledger
        .close_session(id, SessionStatus::Completed, aggregates, None)
        .unwrap();
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(closed.ended_at.is_some());

    assert!(matches!(
        ledger.append_step(id, model_step("late", 0)),
        Err(LedgerError::SessionClosed(_))
    ));
    assert!(matches!(
        ledger.upsert_entities(id, Vec::new()),
        Err(LedgerError::SessionClosed(_))
    ));
    assert_eq!(ledger.steps(id).unwrap().len(), 1);
}

#[test]
fn test_unknown_session() {
    let ledger = Ledger::in_memory();
    let ghost = uuid::Uuid::new_v4();
    assert!(matches!(ledger.session(ghost), Err(LedgerError::UnknownSession(_))));
    assert!(matches!(
        ledger.append_step(ghost, model_step("x", 0)),
        Err(LedgerError::UnknownSession(_))
    ));
}

#[test]
fn test_wal_replay_restores_ledger() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger.wal");
    let case = CaseId::from("case-42");

    let (session_id, entity) = {
        let ledger = Ledger::open(&path).unwrap();
        let session = ExtractionSession::start(case.clone());
        let session_id = session.id;
        ledger.insert_session(session).unwrap();
        ledger.append_step(session_id, model_step("contextual_framework", 2)).unwrap();
        ledger.append_step(session_id, model_step("normative_requirements", 1)).unwrap();

        let mut entity = PublishedEntity::from_candidate(
            session_id,
            case.clone(),
            "urn:casegraph:concept:role/engineer".into(),
            &CandidateEntity {
                label: "Engineer".into(),
                definition: "Licensed engineer".into(),
                category: Category::Role,
                section: SectionScope::Facts,
                attributes: [("license".to_string(), serde_json::json!("PE"))]
                    .into_iter()
                    .collect(),
                confidence: Some(0.9),
                step_number: 1,
            },
        );
        entity.published = true;
        ledger.upsert_entities(session_id, vec![entity.clone()]).unwrap();

        let steps = ledger.steps(session_id).unwrap();
        let aggregates = SessionAggregates::from_log(&steps, [&entity]);
        ledger
            .close_session(session_id, SessionStatus::Completed, aggregates, None)
            .unwrap();
        (session_id, entity)
    };

    let reopened = Ledger::open(&path).unwrap();
    assert!(reopened.is_durable());
    let session = reopened.session(session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.aggregates.total_steps, 2);
    assert_eq!(session.aggregates.recorded_entities, 3);
    assert_eq!(reopened.steps(session_id).unwrap().len(), 2);
    assert_eq!(reopened.entities(session_id).unwrap(), vec![entity]);
    assert_eq!(reopened.list_sessions(Some(&case)).len(), 1);
    assert!(reopened.list_sessions(Some(&CaseId::from("other"))).is_empty());
}

#[test]
fn test_read_only_open_does_not_cut_a_step_being_written() {
    use std::io::Write;

    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger.wal");
    let session = ExtractionSession::start(CaseId::from("case-1"));
    let session_id = session.id;
    {
        let ledger = Ledger::open(&path).unwrap();
        ledger.insert_session(session).unwrap();
        ledger.append_step(session_id, model_step("pass", 1)).unwrap();
    }

    // A running session is halfway through flushing its step frame.
    let full = std::fs::read(&path).unwrap();
    let cut = full.len() - 40;
    std::fs::write(&path, &full[..cut]).unwrap();

    let audit = Ledger::open_read_only(&path).unwrap();
    assert!(audit.is_read_only());
    assert_eq!(audit.steps(session_id).unwrap().len(), 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), cut as u64);
    assert!(matches!(
        audit.append_step(session_id, model_step("audit", 0)),
        Err(LedgerError::ReadOnly)
    ));

    let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(&full[cut..]).unwrap();
    drop(f);

    let reopened = Ledger::open(&path).unwrap();
    assert_eq!(reopened.steps(session_id).unwrap().len(), 1);
}

#[test]
fn test_read_only_open_of_missing_ledger_is_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger.wal");
    let ledger = Ledger::open_read_only(&path).unwrap();
    assert!(ledger.list_sessions(None).is_empty());
    assert!(matches!(
        ledger.insert_session(ExtractionSession::start(CaseId::from("case-1"))),
        Err(LedgerError::ReadOnly)
    ));
    assert!(!path.exists());
}

#[test]
fn test_failed_write_does_not_poison_later_steps() {
    use std::io::Write;

    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger.wal");
    let session = ExtractionSession::start(CaseId::from("case-1"));
    let session_id = session.id;
    {
        let ledger = Ledger::open(&path).unwrap();
        ledger.insert_session(session).unwrap();

        // Leftovers of an append that hit ENOSPC mid-frame.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[64, 1, 0, 0, 9, 9, 9]).unwrap();
        drop(f);

        ledger.append_step(session_id, model_step("pass", 1)).unwrap();
    }

    let reopened = Ledger::open(&path).unwrap();
    assert_eq!(reopened.session(session_id).unwrap().case_id, CaseId::from("case-1"));
    assert_eq!(reopened.steps(session_id).unwrap().len(), 1);
}

#[test]
fn test_list_sessions_in_start_order() {
    let ledger = Ledger::in_memory();
    let mut ids = Vec::new();
    for case in ["a", "b", "a"] {
        let session = ExtractionSession::start(CaseId::from(case));
        ids.push(session.id);
        ledger.insert_session(session).unwrap();
    }
    let all: Vec<_> = ledger.list_sessions(None).iter().map(|s| s.id).collect();
    assert_eq!(all, ids);
    assert_eq!(ledger.list_sessions(Some(&CaseId::from("a"))).len(), 2);
}
