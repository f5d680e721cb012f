//! Property-Based Tests for the pipeline
//!
//! 1. Context assembly is independent of store iteration order
//! 2. The state machine visits every (pass, section) exactly once, in order
//! 3. Reconciliation accounts for every draft

use casegraph_pipeline::context::assemble;
use casegraph_pipeline::*;
use casegraph_store::{
    normalize_label, CandidateEntity, CaseId, Category, ClassProposal, ConceptClass,
    MemoryConceptStore, SectionScope,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Strategies
// ============================================================================

fn label_strategy() -> impl Strategy<Value = String> {
    "[A-Z][a-z]{2,10}( [A-Z][a-z]{2,8})?"
}

fn case_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just("case-1".to_string()), Just("case-2".to_string()), Just("case-3".to_string())]
}

fn section_strategy() -> impl Strategy<Value = SectionScope> {
    prop_oneof![
        Just(SectionScope::Facts),
        Just(SectionScope::Discussion),
        Just(SectionScope::Resolution),
    ]
}

fn classes(entries: &[(String, String)]) -> Vec<ConceptClass> {
    let store = MemoryConceptStore::new();
    for (label, case) in entries {
        store.create_if_absent_sync(ClassProposal {
            category: Category::Role,
            normalized_label: normalize_label(label),
            label: label.clone(),
            definition: format!("{label} definition"),
            case_id: CaseId::from(case.as_str()),
        });
    }
    store.list_by_category_sync(Category::Role)
}

// ============================================================================
// Context determinism
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn context_ignores_input_order(
        entries in prop::collection::vec((label_strategy(), case_strategy()), 0..30),
        max in 1usize..20,
        seed in any::<u64>(),
    ) {
        let listed = classes(&entries);
        let mut shuffled = listed.clone();
        // Deterministic rotation stands in for arbitrary store iteration order.
        if !shuffled.is_empty() {
            let k = (seed as usize) % shuffled.len();
            shuffled.rotate_left(k);
            shuffled.reverse();
        }

        let exclude = CaseId::from("case-1");
        let a = assemble(listed.clone(), &exclude, max);
        let b = assemble(shuffled, &exclude, max);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.digest(), b.digest());

        let visible = listed.iter().filter(|c| !c.discovered_only_by(&exclude)).count();
        prop_assert_eq!(a.len() + a.omitted, visible);
        prop_assert!(a.len() <= max);
    }
}

// ============================================================================
// State machine order
// ============================================================================

proptest! {
    #[test]
    fn plan_visits_each_stage_once(
        present in prop::collection::btree_set(section_strategy(), 1..=3),
        synthesis in any::<bool>(),
    ) {
        let config = PipelineConfig { synthesis, ..Default::default() };
        let present: Vec<SectionScope> = present.into_iter().rev().collect();
        let plan = ExtractionPlan::build(&config, &present);
        let states = plan.states();

        let stages: Vec<(usize, SectionScope)> = states
            .iter()
            .filter_map(|s| match s {
                PipelineState::Pass { pass, section } => Some((*pass, *section)),
                _ => None,
            })
            .collect();
        let mut expected = Vec::new();
        for pass in 0..config.passes.len() {
            for section in SectionScope::ORDERED {
                if present.contains(&section) {
                    expected.push((pass, section));
                }
            }
        }
        prop_assert_eq!(stages, expected);
        prop_assert_eq!(states.first(), Some(&PipelineState::Pending));
        prop_assert_eq!(states.last(), Some(&PipelineState::Completed));
        prop_assert_eq!(states.contains(&PipelineState::Synthesis), synthesis);
        prop_assert_eq!(plan.units().len(), Category::ALL.len() * present.len());
    }
}

// ============================================================================
// Reconciliation accounting
// ============================================================================

proptest! {
    #[test]
    fn reconcile_accounts_for_every_draft(
        mentions in prop::collection::vec(
            (prop_oneof![Just("Engineer"), Just("Owner"), Just("Board")], section_strategy()),
            0..40,
        ),
    ) {
        let session = uuid::Uuid::new_v4();
        let case = CaseId::from("case-1");
        let mut drafts = DraftSet::new();
        let mut merged_in_section = 0u32;

        for (step, (label, section)) in mentions.iter().enumerate() {
            let candidate = CandidateEntity {
                label: label.to_string(),
                definition: String::new(),
                category: Category::Role,
                section: *section,
                attributes: BTreeMap::new(),
                confidence: None,
                step_number: step as u32 + 1,
            };
            let class_id = format!("urn:casegraph:concept:role/{}", label.to_lowercase());
            if drafts.record(session, &case, class_id, &candidate) {
                merged_in_section += 1;
            }
        }

        let reconciled = drafts.reconcile();
        let distinct: BTreeSet<&str> = mentions.iter().map(|(l, _)| *l).collect();
        prop_assert_eq!(reconciled.entities.len(), distinct.len());
        prop_assert_eq!(
            mentions.len() as u32 - merged_in_section - reconciled.discarded,
            reconciled.entities.len() as u32
        );
    }
}
