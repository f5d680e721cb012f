//! On-disk layout of a casegraph data directory.
//!
//! ```text
//! <data-dir>/
//!   taxonomy.json   shared concept classes + case ontologies
//!   ledger.wal      sessions, steps and entities
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use casegraph_pipeline::provider::{OpenAiCompatibleClient, SchemaValidatingProvider};
use casegraph_pipeline::{
    CasePipeline, CaseSource, DirectoryCases, ExtractionProvider, ExtractionRequest,
    ExtractionResponse, InMemoryCases, PipelineConfig, ProviderError,
};
use casegraph_store::{FileConceptStore, Ledger};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const TAXONOMY_FILE: &str = "taxonomy.json";
pub const LEDGER_FILE: &str = "ledger.wal";

pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating data directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self, config: &PipelineConfig) -> Result<Arc<FileConceptStore>> {
        let path = self.root.join(TAXONOMY_FILE);
        let store = FileConceptStore::open(&path, &config.class_uri_base)
            .with_context(|| format!("opening taxonomy {}", path.display()))?;
        Ok(Arc::new(store))
    }

    pub fn ledger(&self) -> Result<Arc<Ledger>> {
        let path = self.root.join(LEDGER_FILE);
        let ledger =
            Ledger::open(&path).with_context(|| format!("opening ledger {}", path.display()))?;
        Ok(Arc::new(ledger))
    }

    /// Ledger view for audits; safe while a `run` is appending.
    pub fn ledger_read_only(&self) -> Result<Arc<Ledger>> {
        let path = self.root.join(LEDGER_FILE);
        let ledger = Ledger::open_read_only(&path)
            .with_context(|| format!("reading ledger {}", path.display()))?;
        Ok(Arc::new(ledger))
    }

    /// Pipeline that calls the configured model endpoint.
    pub fn live_pipeline(&self, config: PipelineConfig, cases_dir: &Path) -> Result<CasePipeline> {
        let client = OpenAiCompatibleClient::from_config(&config.provider, config.call_timeout())
            .context("configuring model provider")?;
        let provider = SchemaValidatingProvider::from_config(client, &config.provider);
        let ledger = self.ledger()?;
        self.pipeline(
            config,
            Arc::new(DirectoryCases::new(cases_dir)),
            Arc::new(provider),
            ledger,
        )
    }

    /// Pipeline for audit commands: no cases, no model calls, no ledger writes.
    pub fn audit_pipeline(&self, config: PipelineConfig) -> Result<CasePipeline> {
        let provider = OfflineProvider {
            model: config.provider.model.clone(),
        };
        let ledger = self.ledger_read_only()?;
        self.pipeline(
            config,
            Arc::new(InMemoryCases::new()),
            Arc::new(provider),
            ledger,
        )
    }

    fn pipeline(
        &self,
        config: PipelineConfig,
        cases: Arc<dyn CaseSource>,
        provider: Arc<dyn ExtractionProvider>,
        ledger: Arc<Ledger>,
    ) -> Result<CasePipeline> {
        let store = self.store(&config)?;
        Ok(CasePipeline::new(config, store, cases, provider, ledger)?)
    }
}

/// Carries the configured model identity for verification; refuses to extract.
struct OfflineProvider {
    model: String,
}

#[async_trait]
impl ExtractionProvider for OfflineProvider {
    async fn extract(
        &self,
        _request: &ExtractionRequest,
    ) -> Result<ExtractionResponse, ProviderError> {
        Err(ProviderError::fatal("no model provider in audit mode", None))
    }

    fn model_identity(&self) -> &str {
        &self.model
    }
}
