//! Concept Store: the shared taxonomy of concept classes.
//!
//! Class creation is compare-and-create keyed by `(category, normalized_label)`.
//! Two pipelines racing on the same new key converge on one class; the loser
//! receives the winner's class with `created = false`.

use crate::model::{
    CaseId, Category, ClassId, ClassProposal, ConceptClass, ConceptKey, TaxonomySnapshot,
};
use crate::normalize::slug;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// Default prefix for class URIs.
pub const DEFAULT_CLASS_URI_BASE: &str = "urn:casegraph:concept:";

#[derive(Debug, thiserror::Error)]
pub enum ConceptStoreError {
    /// A racing writer created the key between lookup and insert
    #[error("concurrent creation conflict on {key}")]
    Conflict { key: ConceptKey },
    #[error("unknown concept class: {0}")]
    UnknownClass(ClassId),
    #[error("taxonomy I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("taxonomy serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Collaborator interface to the shared taxonomy.
#[async_trait]
pub trait ConceptStore: Send + Sync {
    async fn find_by_key(&self, key: &ConceptKey)
        -> Result<Option<ConceptClass>, ConceptStoreError>;

    /// Atomic: returns the existing class untouched when the key is taken.
    async fn create_if_absent(
        &self,
        proposal: ClassProposal,
    ) -> Result<(ConceptClass, bool), ConceptStoreError>;

    /// Idempotent. Adding the first discoverer is a no-op.
    async fn add_discovery_reference(
        &self,
        class_id: &str,
        case_id: &CaseId,
    ) -> Result<ConceptClass, ConceptStoreError>;

    async fn list_by_category(
        &self,
        category: Category,
    ) -> Result<Vec<ConceptClass>, ConceptStoreError>;

    async fn register_case_ontology(
        &self,
        case_id: &CaseId,
        name: &str,
    ) -> Result<(), ConceptStoreError>;

    async fn case_ontology(&self, case_id: &CaseId) -> Result<Option<String>, ConceptStoreError>;

    async fn get(&self, class_id: &str) -> Result<Option<ConceptClass>, ConceptStoreError>;

    async fn snapshot(&self) -> Result<TaxonomySnapshot, ConceptStoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Concurrent in-memory taxonomy.
///
/// Mutations hold the shared side of `epoch`; `snapshot` holds the exclusive
/// side so it observes no half-applied writes.
pub struct MemoryConceptStore {
    uri_base: String,
    classes: DashMap<ConceptKey, ConceptClass>,
    by_id: DashMap<ClassId, ConceptKey>,
    ontologies: DashMap<CaseId, String>,
    epoch: RwLock<()>,
}

impl MemoryConceptStore {
    pub fn new() -> Self {
        Self::with_uri_base(DEFAULT_CLASS_URI_BASE)
    }

    pub fn with_uri_base(uri_base: impl Into<String>) -> Self {
        Self {
            uri_base: uri_base.into(),
            classes: DashMap::new(),
            by_id: DashMap::new(),
            ontologies: DashMap::new(),
            epoch: RwLock::new(()),
        }
    }

    /// Rebuild from a previously taken snapshot.
    pub fn from_snapshot(uri_base: impl Into<String>, snapshot: TaxonomySnapshot) -> Self {
        let store = Self::with_uri_base(uri_base);
        for class in snapshot.classes {
            store.by_id.insert(class.id.clone(), class.key());
            store.classes.insert(class.key(), class);
        }
        for (case_id, name) in snapshot.case_ontologies {
            store.ontologies.insert(case_id, name);
        }
        store
    }

    pub fn uri_base(&self) -> &str {
        &self.uri_base
    }

    pub fn class_uri(&self, key: &ConceptKey) -> ClassId {
        format!(
            "{}{}/{}",
            self.uri_base,
            key.category,
            slug(&key.normalized_label)
        )
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn find_by_key_sync(&self, key: &ConceptKey) -> Option<ConceptClass> {
        self.classes.get(key).map(|c| c.value().clone())
    }

    pub fn create_if_absent_sync(&self, proposal: ClassProposal) -> (ConceptClass, bool) {
        let _epoch = self.epoch.read();
        let key = proposal.key();
        match self.classes.entry(key.clone()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let class = ConceptClass {
                    id: self.class_uri(&key),
                    category: proposal.category,
                    label: proposal.label.trim().to_string(),
                    definition: proposal.definition.trim().to_string(),
                    normalized_label: proposal.normalized_label,
                    first_discovered_in_case: proposal.case_id,
                    discovered_in_cases: BTreeSet::new(),
                    created_at: Utc::now(),
                };
                // Index while the shard lock on `classes` is still held.
                self.by_id.insert(class.id.clone(), key);
                slot.insert(class.clone());
                tracing::debug!(class_id = %class.id, case_id = %class.first_discovered_in_case, "created concept class");
                (class, true)
            }
        }
    }

    pub fn add_discovery_reference_sync(
        &self,
        class_id: &str,
        case_id: &CaseId,
    ) -> Result<ConceptClass, ConceptStoreError> {
        let _epoch = self.epoch.read();
        let key = self
            .by_id
            .get(class_id)
            .map(|k| k.value().clone())
            .ok_or_else(|| ConceptStoreError::UnknownClass(class_id.to_string()))?;
        let mut class = self
            .classes
            .get_mut(&key)
            .ok_or_else(|| ConceptStoreError::UnknownClass(class_id.to_string()))?;
        if &class.first_discovered_in_case != case_id {
            class.discovered_in_cases.insert(case_id.clone());
        }
        Ok(class.clone())
    }

    pub fn list_by_category_sync(&self, category: Category) -> Vec<ConceptClass> {
        let mut out: Vec<ConceptClass> = self
            .classes
            .iter()
            .filter(|entry| entry.key().category == category)
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn register_case_ontology_sync(&self, case_id: &CaseId, name: &str) {
        let _epoch = self.epoch.read();
        self.ontologies.insert(case_id.clone(), name.to_string());
    }

    pub fn snapshot_sync(&self) -> TaxonomySnapshot {
        let _epoch = self.epoch.write();
        let mut classes: Vec<ConceptClass> =
            self.classes.iter().map(|e| e.value().clone()).collect();
        classes.sort_by(|a, b| a.id.cmp(&b.id));
        let case_ontologies: BTreeMap<CaseId, String> = self
            .ontologies
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        TaxonomySnapshot {
            classes,
            case_ontologies,
        }
    }
}

impl Default for MemoryConceptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConceptStore for MemoryConceptStore {
    async fn find_by_key(
        &self,
        key: &ConceptKey,
    ) -> Result<Option<ConceptClass>, ConceptStoreError> {
        Ok(self.find_by_key_sync(key))
    }

    async fn create_if_absent(
        &self,
        proposal: ClassProposal,
    ) -> Result<(ConceptClass, bool), ConceptStoreError> {
        Ok(self.create_if_absent_sync(proposal))
    }

    async fn add_discovery_reference(
        &self,
        class_id: &str,
        case_id: &CaseId,
    ) -> Result<ConceptClass, ConceptStoreError> {
        self.add_discovery_reference_sync(class_id, case_id)
    }

    async fn list_by_category(
        &self,
        category: Category,
    ) -> Result<Vec<ConceptClass>, ConceptStoreError> {
        Ok(self.list_by_category_sync(category))
    }

    async fn register_case_ontology(
        &self,
        case_id: &CaseId,
        name: &str,
    ) -> Result<(), ConceptStoreError> {
        self.register_case_ontology_sync(case_id, name);
        Ok(())
    }

    async fn case_ontology(&self, case_id: &CaseId) -> Result<Option<String>, ConceptStoreError> {
        Ok(self.ontologies.get(case_id).map(|n| n.value().clone()))
    }

    async fn get(&self, class_id: &str) -> Result<Option<ConceptClass>, ConceptStoreError> {
        let Some(key) = self.by_id.get(class_id).map(|k| k.value().clone()) else {
            return Ok(None);
        };
        Ok(self.find_by_key_sync(&key))
    }

    async fn snapshot(&self) -> Result<TaxonomySnapshot, ConceptStoreError> {
        Ok(self.snapshot_sync())
    }
}
