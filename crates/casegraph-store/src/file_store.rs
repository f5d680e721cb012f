//! File-backed concept store: the in-memory store plus a JSON snapshot that is
//! rewritten after every mutation.

use crate::concept::{ConceptStore, ConceptStoreError, MemoryConceptStore};
use crate::model::{CaseId, Category, ClassProposal, ConceptClass, ConceptKey, TaxonomySnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

pub struct FileConceptStore {
    inner: MemoryConceptStore,
    path: PathBuf,
    /// Serializes snapshot writes so the file always holds the newest state
    write_lock: Mutex<()>,
}

impl FileConceptStore {
    /// Open (or create) a taxonomy file.
    pub fn open(path: impl AsRef<Path>, uri_base: &str) -> Result<Self, ConceptStoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let snapshot: TaxonomySnapshot = serde_json::from_str(&contents)?;
            tracing::info!(
                path = %path.display(),
                classes = snapshot.classes.len(),
                "loaded taxonomy snapshot"
            );
            MemoryConceptStore::from_snapshot(uri_base, snapshot)
        } else {
            MemoryConceptStore::with_uri_base(uri_base)
        };

        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), ConceptStoreError> {
        let _guard = self.write_lock.lock();
        let snapshot = self.inner.snapshot_sync();
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl ConceptStore for FileConceptStore {
    async fn find_by_key(
        &self,
        key: &ConceptKey,
    ) -> Result<Option<ConceptClass>, ConceptStoreError> {
        Ok(self.inner.find_by_key_sync(key))
    }

    async fn create_if_absent(
        &self,
        proposal: ClassProposal,
    ) -> Result<(ConceptClass, bool), ConceptStoreError> {
        let (class, created) = self.inner.create_if_absent_sync(proposal);
        if created {
            self.persist()?;
        }
        Ok((class, created))
    }

    async fn add_discovery_reference(
        &self,
        class_id: &str,
        case_id: &CaseId,
    ) -> Result<ConceptClass, ConceptStoreError> {
        let before = self.inner.get(class_id).await?;
        let class = self.inner.add_discovery_reference_sync(class_id, case_id)?;
        if before.as_ref() != Some(&class) {
            self.persist()?;
        }
        Ok(class)
    }

    async fn list_by_category(
        &self,
        category: Category,
    ) -> Result<Vec<ConceptClass>, ConceptStoreError> {
        Ok(self.inner.list_by_category_sync(category))
    }

    async fn register_case_ontology(
        &self,
        case_id: &CaseId,
        name: &str,
    ) -> Result<(), ConceptStoreError> {
        self.inner.register_case_ontology_sync(case_id, name);
        self.persist()
    }

    async fn case_ontology(&self, case_id: &CaseId) -> Result<Option<String>, ConceptStoreError> {
        self.inner.case_ontology(case_id).await
    }

    async fn get(&self, class_id: &str) -> Result<Option<ConceptClass>, ConceptStoreError> {
        self.inner.get(class_id).await
    }

    async fn snapshot(&self) -> Result<TaxonomySnapshot, ConceptStoreError> {
        Ok(self.inner.snapshot_sync())
    }
}
