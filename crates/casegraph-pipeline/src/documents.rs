//! Case document collaborator.
//!
//! Cases are read-only here. A case file on disk looks like:
//!
//! ```json
//! { "id": "case-24-2", "title": "Dam Inspection", "sections": { "facts": "...", "discussion": "..." } }
//! ```

use async_trait::async_trait;
use casegraph_store::{CaseId, SectionScope};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("unknown case: {0}")]
    UnknownCase(CaseId),
    #[error("case {case_id} has no `{section}` section")]
    MissingSection {
        case_id: CaseId,
        section: SectionScope,
    },
    #[error("case {0} has no recognised sections")]
    NoSections(CaseId),
    #[error("case I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("case {case_id} is not valid JSON: {message}")]
    Parse { case_id: CaseId, message: String },
}

#[async_trait]
pub trait CaseSource: Send + Sync {
    /// Sections present in the case, in processing order.
    async fn sections(&self, case_id: &CaseId) -> Result<Vec<SectionScope>, DocumentError>;

    async fn get_section_text(
        &self,
        case_id: &CaseId,
        section: SectionScope,
    ) -> Result<String, DocumentError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDocument {
    pub id: CaseId,
    pub title: Option<String>,
    pub sections: BTreeMap<SectionScope, String>,
}

impl CaseDocument {
    pub fn new(id: impl Into<CaseId>) -> Self {
        Self {
            id: id.into(),
            title: None,
            sections: BTreeMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_section(mut self, section: SectionScope, text: impl Into<String>) -> Self {
        self.sections.insert(section, text.into());
        self
    }

    fn present_sections(&self) -> Vec<SectionScope> {
        SectionScope::ORDERED
            .iter()
            .copied()
            .filter(|s| self.sections.get(s).is_some_and(|t| !t.trim().is_empty()))
            .collect()
    }

    fn section_text(&self, section: SectionScope) -> Result<String, DocumentError> {
        self.sections
            .get(&section)
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .ok_or_else(|| DocumentError::MissingSection {
                case_id: self.id.clone(),
                section,
            })
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct InMemoryCases {
    cases: RwLock<HashMap<CaseId, CaseDocument>>,
}

impl InMemoryCases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: CaseDocument) {
        self.cases.write().insert(document.id.clone(), document);
    }

    pub fn with_case(self, document: CaseDocument) -> Self {
        self.insert(document);
        self
    }

    fn document(&self, case_id: &CaseId) -> Result<CaseDocument, DocumentError> {
        self.cases
            .read()
            .get(case_id)
            .cloned()
            .ok_or_else(|| DocumentError::UnknownCase(case_id.clone()))
    }
}

#[async_trait]
impl CaseSource for InMemoryCases {
    async fn sections(&self, case_id: &CaseId) -> Result<Vec<SectionScope>, DocumentError> {
        let sections = self.document(case_id)?.present_sections();
        if sections.is_empty() {
            return Err(DocumentError::NoSections(case_id.clone()));
        }
        Ok(sections)
    }

    async fn get_section_text(
        &self,
        case_id: &CaseId,
        section: SectionScope,
    ) -> Result<String, DocumentError> {
        self.document(case_id)?.section_text(section)
    }
}

// ============================================================================
// Directory of `<case_id>.json` files
// ============================================================================

#[derive(Debug, Deserialize)]
struct CaseFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    sections: BTreeMap<String, String>,
}

pub struct DirectoryCases {
    root: PathBuf,
}

impl DirectoryCases {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Case ids of every `*.json` file in the directory, sorted.
    pub fn list_cases(&self) -> Result<Vec<CaseId>, DocumentError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(CaseId::from(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn case_path(&self, case_id: &CaseId) -> Result<PathBuf, DocumentError> {
        let id = case_id.as_str();
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(DocumentError::UnknownCase(case_id.clone()));
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    async fn load(&self, case_id: &CaseId) -> Result<CaseDocument, DocumentError> {
        let path = self.case_path(case_id)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DocumentError::UnknownCase(case_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let file: CaseFile = serde_json::from_str(&text).map_err(|e| DocumentError::Parse {
            case_id: case_id.clone(),
            message: e.to_string(),
        })?;

        if let Some(id) = file.id.as_deref() {
            if id != case_id.as_str() {
                tracing::warn!(case_id = %case_id, file_id = id, "case file id differs from file name");
            }
        }

        let mut document = CaseDocument::new(case_id.clone());
        document.title = file.title;
        for (name, text) in file.sections {
            match SectionScope::parse(&name) {
                Some(SectionScope::WholeCase) | None => {
                    tracing::debug!(case_id = %case_id, section = %name, "ignoring unrecognised section");
                }
                Some(section) => {
                    document.sections.insert(section, text);
                }
            }
        }
        Ok(document)
    }
}

#[async_trait]
impl CaseSource for DirectoryCases {
    async fn sections(&self, case_id: &CaseId) -> Result<Vec<SectionScope>, DocumentError> {
        let sections = self.load(case_id).await?.present_sections();
        if sections.is_empty() {
            return Err(DocumentError::NoSections(case_id.clone()));
        }
        Ok(sections)
    }

    async fn get_section_text(
        &self,
        case_id: &CaseId,
        section: SectionScope,
    ) -> Result<String, DocumentError> {
        self.load(case_id).await?.section_text(section)
    }
}
