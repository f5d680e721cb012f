//! Deduplication & Merge Engine.
//!
//! Resolution is exact-key only: `(category, normalize_label(label))`. No
//! similarity fallback is attempted, so synonyms such as "Structural Engineer"
//! and "Structural Engineering Role" stay distinct classes.

use casegraph_store::{
    normalize_label, CandidateEntity, CaseId, Category, ClassId, ClassProposal, ConceptClass,
    ConceptKey, ConceptStore, ConceptStoreError, EntityKey, PublishedEntity, SectionScope,
    SessionId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub class: ConceptClass,
    pub created: bool,
}

pub struct MergeEngine {
    store: Arc<dyn ConceptStore>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn ConceptStore>) -> Self {
        Self { store }
    }

    /// Resolve a candidate to its concept class, creating it when absent.
    ///
    /// An existing class gains `case_id` as a discovery reference. A lost
    /// creation race is indistinguishable from finding the class up front.
    pub async fn resolve(
        &self,
        candidate: &CandidateEntity,
        case_id: &CaseId,
    ) -> Result<Resolution, ConceptStoreError> {
        let key = ConceptKey::new(candidate.category, normalize_label(&candidate.label));

        if let Some(existing) = self.store.find_by_key(&key).await? {
            let class = self
                .store
                .add_discovery_reference(&existing.id, case_id)
                .await?;
            return Ok(Resolution {
                class,
                created: false,
            });
        }

        let proposal = ClassProposal {
            category: candidate.category,
            normalized_label: key.normalized_label.clone(),
            label: candidate.label.clone(),
            definition: candidate.definition.clone(),
            case_id: case_id.clone(),
        };
        match self.store.create_if_absent(proposal).await {
            Ok((class, true)) => Ok(Resolution {
                class,
                created: true,
            }),
            Ok((winner, false)) => {
                tracing::debug!(class_id = %winner.id, case_id = %case_id, "lost class creation race");
                let class = self
                    .store
                    .add_discovery_reference(&winner.id, case_id)
                    .await?;
                Ok(Resolution {
                    class,
                    created: false,
                })
            }
            Err(ConceptStoreError::Conflict { key }) => {
                tracing::debug!(%key, case_id = %case_id, "creation conflict, re-reading winner");
                let winner = self
                    .store
                    .find_by_key(&key)
                    .await?
                    .ok_or_else(|| ConceptStoreError::UnknownClass(key.to_string()))?;
                let class = self
                    .store
                    .add_discovery_reference(&winner.id, case_id)
                    .await?;
                Ok(Resolution {
                    class,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Draft entities
// ============================================================================

type DraftKey = (SectionScope, Category, ClassId);

/// Draft entities of one session, merged per section in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct DraftSet {
    entries: Vec<PublishedEntity>,
    index: HashMap<DraftKey, usize>,
}

/// Outcome of collapsing drafts across sections.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    /// One entity per `(category, class_id)`, in key order
    pub entities: Vec<PublishedEntity>,
    /// Drafts absorbed into an earlier draft of the same class
    pub discarded: u32,
}

impl DraftSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolved candidate. Returns `true` when it merged into an
    /// existing draft for the same class in the same section.
    pub fn record(
        &mut self,
        session_id: SessionId,
        case_id: &CaseId,
        class_id: ClassId,
        candidate: &CandidateEntity,
    ) -> bool {
        let key = (candidate.section, candidate.category, class_id.clone());
        let entity = PublishedEntity::from_candidate(session_id, case_id.clone(), class_id, candidate);
        match self.index.get(&key) {
            Some(&idx) => {
                self.entries[idx].absorb(&entity);
                true
            }
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entity);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublishedEntity> {
        self.entries.iter()
    }

    /// Collapse drafts sharing `(category, class_id)` across sections.
    /// Earlier drafts win attribute conflicts.
    pub fn reconcile(&self) -> Reconciled {
        let mut merged: BTreeMap<EntityKey, PublishedEntity> = BTreeMap::new();
        for draft in &self.entries {
            match merged.get_mut(&draft.key()) {
                Some(existing) => existing.absorb(draft),
                None => {
                    merged.insert(draft.key(), draft.clone());
                }
            }
        }
        let discarded = (self.entries.len() - merged.len()) as u32;
        Reconciled {
            entities: merged.into_values().collect(),
            discarded,
        }
    }
}
