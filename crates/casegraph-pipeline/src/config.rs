//! Pipeline configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! max_context_entries = 50
//! worker_count = 4
//!
//! [retry]
//! max_attempts = 3
//!
//! [[passes]]
//! name = "contextual_framework"
//! categories = ["role", "state", "resource"]
//!
//! [provider]
//! model = "gpt-4o-mini"
//! ```

use casegraph_store::{Category, DEFAULT_CLASS_URI_BASE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no extraction passes configured")]
    EmptyPasses,
    #[error("pass `{0}` has no categories")]
    EmptyPass(String),
    #[error("category `{category}` appears in both `{first}` and `{second}`")]
    OverlappingCategory {
        category: Category,
        first: String,
        second: String,
    },
    #[error("worker_count must be at least 1")]
    ZeroWorkers,
    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("retry.initial_backoff_ms ({initial}) exceeds retry.max_backoff_ms ({max})")]
    InvalidBackoff { initial: u64, max: u64 },
    #[error("mandatory category `{0}` is not extracted by any pass")]
    MandatoryNotExtracted(Category),
}

/// One ordered sweep over a case's sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassConfig {
    pub name: String,
    pub categories: Vec<Category>,
}

impl PassConfig {
    pub fn new(name: impl Into<String>, categories: impl IntoIterator<Item = Category>) -> Self {
        Self {
            name: name.into(),
            categories: categories.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per (pass, section, category), including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the delay after the first failure).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Settings for the OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    /// Falls back to `OPENAI_API_KEY` when unset
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ordered, category-disjoint passes
    pub passes: Vec<PassConfig>,
    /// Upper bound on known classes injected per request
    pub max_context_entries: usize,
    pub worker_count: usize,
    /// Per provider call
    pub call_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Run the whole-case synthesis pass
    pub synthesis: bool,
    /// Categories whose absence is a critical verification issue
    pub mandatory_categories: Vec<Category>,
    /// Case ontologies are registered as `{ontology_prefix}{case_id}`
    pub ontology_prefix: String,
    pub class_uri_base: String,
    pub provider: ProviderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            passes: default_passes(),
            max_context_entries: 50,
            worker_count: 4,
            call_timeout_ms: 120_000,
            retry: RetryPolicy::default(),
            synthesis: true,
            mandatory_categories: Category::ALL.to_vec(),
            ontology_prefix: "case-".to_string(),
            class_uri_base: DEFAULT_CLASS_URI_BASE.to_string(),
            provider: ProviderConfig::default(),
        }
    }
}

pub fn default_passes() -> Vec<PassConfig> {
    vec![
        PassConfig::new(
            "contextual_framework",
            [Category::Role, Category::State, Category::Resource],
        ),
        PassConfig::new(
            "normative_requirements",
            [
                Category::Principle,
                Category::Obligation,
                Category::Constraint,
                Category::Capability,
            ],
        ),
        PassConfig::new("temporal_dynamics", [Category::Action, Category::Event]),
    ]
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passes.is_empty() {
            return Err(ConfigError::EmptyPasses);
        }
        let mut owner: BTreeMap<Category, &str> = BTreeMap::new();
        for pass in &self.passes {
            if pass.categories.is_empty() {
                return Err(ConfigError::EmptyPass(pass.name.clone()));
            }
            for category in &pass.categories {
                if let Some(first) = owner.insert(*category, &pass.name) {
                    return Err(ConfigError::OverlappingCategory {
                        category: *category,
                        first: first.to_string(),
                        second: pass.name.clone(),
                    });
                }
            }
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                initial: self.retry.initial_backoff_ms,
                max: self.retry.max_backoff_ms,
            });
        }
        if let Some(missing) = self
            .mandatory_categories
            .iter()
            .find(|c| !owner.contains_key(c))
        {
            return Err(ConfigError::MandatoryNotExtracted(*missing));
        }
        Ok(())
    }

    /// Every category extracted by some pass, in pass order.
    pub fn extracted_categories(&self) -> Vec<Category> {
        self.passes
            .iter()
            .flat_map(|p| p.categories.iter().copied())
            .collect()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ontology_name(&self, case_id: &casegraph_store::CaseId) -> String {
        format!("{}{}", self.ontology_prefix, case_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.extracted_categories().len(), Category::ALL.len());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            worker_count = 8

            [retry]
            max_attempts = 5

            [provider]
            model = "local-model"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.provider.model, "local-model");
        assert_eq!(config.passes.len(), 3);
    }

    #[test]
    fn test_overlapping_categories_rejected() {
        let text = r#"
            mandatory_categories = ["role"]

            [[passes]]
            name = "a"
            categories = ["role", "state"]

            [[passes]]
            name = "b"
            categories = ["state"]
        "#;
        let err = PipelineConfig::from_toml_str(text).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OverlappingCategory {
                category: Category::State,
                ..
            }
        ));
    }

    #[test]
    fn test_mandatory_category_must_be_extracted() {
        let config = PipelineConfig {
            passes: vec![PassConfig::new("only_roles", [Category::Role])],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MandatoryNotExtracted(Category::State))
        ));
    }

    #[test]
    fn test_zero_workers_and_attempts_rejected() {
        let mut config = PipelineConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers)));
        config.worker_count = 1;
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroAttempts)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
    }
}
