//! Context Builder: the known-class listing injected into extraction requests.
//!
//! Output is a pure function of the taxonomy at call time. Entries are ordered
//! lexically by label (ties by normalized label, then class id) and truncated
//! to a fixed maximum, so identical taxonomies yield identical prompts.

use casegraph_store::{CaseId, Category, ConceptClass, ConceptStore, ConceptStoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub category: Category,
    pub label: String,
    pub definition: String,
}

impl From<&ConceptClass> for ContextEntry {
    fn from(class: &ConceptClass) -> Self {
        Self {
            category: class.category,
            label: class.label.clone(),
            definition: class.definition.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltContext {
    pub entries: Vec<ContextEntry>,
    /// Entries dropped by truncation
    pub omitted: usize,
}

impl BuiltContext {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            omitted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered `(label, definition)` pairs.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.label.clone(), e.definition.clone()))
            .collect()
    }

    /// Render as a bullet list, with a trailing `…and N more` marker when truncated.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str("- ");
            out.push_str(&entry.label);
            if !entry.definition.is_empty() {
                out.push_str(": ");
                out.push_str(&entry.definition);
            }
            out.push('\n');
        }
        if self.omitted > 0 {
            out.push_str(&format!("…and {} more\n", self.omitted));
        }
        out
    }

    /// Hex SHA-256 of the rendered context.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.render().as_bytes());
        hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

pub struct ContextBuilder {
    store: Arc<dyn ConceptStore>,
    max_entries: usize,
}

impl ContextBuilder {
    pub fn new(store: Arc<dyn ConceptStore>, max_entries: usize) -> Self {
        Self { store, max_entries }
    }

    /// Known classes of `category`, minus those only `exclude_case` has discovered.
    pub async fn build_context(
        &self,
        category: Category,
        exclude_case: &CaseId,
    ) -> Result<BuiltContext, ConceptStoreError> {
        let classes = self.store.list_by_category(category).await?;
        Ok(assemble(classes, exclude_case, self.max_entries))
    }
}

/// Filter, order and truncate a class listing.
pub fn assemble(
    classes: Vec<ConceptClass>,
    exclude_case: &CaseId,
    max_entries: usize,
) -> BuiltContext {
    let mut visible: Vec<ConceptClass> = classes
        .into_iter()
        .filter(|c| !c.discovered_only_by(exclude_case))
        .collect();
    visible.sort_by(|a, b| {
        a.label
            .cmp(&b.label)
            .then_with(|| a.normalized_label.cmp(&b.normalized_label))
            .then_with(|| a.id.cmp(&b.id))
    });

    let omitted = visible.len().saturating_sub(max_entries);
    visible.truncate(max_entries);
    BuiltContext {
        entries: visible.iter().map(ContextEntry::from).collect(),
        omitted,
    }
}
