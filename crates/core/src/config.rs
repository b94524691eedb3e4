//! # Studio Configuration
//!
//! Defaults in code, partial overrides in `.scriptorium/config.json`.
//! Only the keys present in the file replace defaults; map entries merge.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::intent::ClassifierVocabulary;
use crate::llm::{LlmProvider, ModelSettings};
use crate::phase::PhaseStateMachine;

/// Default location of the override file
pub const CONFIG_PATH: &str = ".scriptorium/config.json";

/// Effective configuration for the decision-and-scheduling core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudioConfig {
    /// Ordered production phases
    pub phase_order: Vec<String>,
    /// Phases that continue without waiting for a human
    pub autonomy: BTreeMap<String, bool>,
    pub models: ModelSettings,
    pub handler_timeout_secs: u64,
    pub classifier_timeout_secs: u64,
    /// Units generated concurrently inside one batch
    pub max_parallel_units: usize,
    /// Upper bound on intents executed in one turn, including auto-advance
    pub max_intents_per_turn: usize,
    /// Transcript entries handed to the model as context
    pub transcript_window: usize,
    pub vocabulary: ClassifierVocabulary,
    pub db_path: PathBuf,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            phase_order: ["brief", "research", "outline", "draft", "review"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            autonomy: BTreeMap::new(),
            models: ModelSettings::default(),
            handler_timeout_secs: 300,
            classifier_timeout_secs: 30,
            max_parallel_units: 3,
            max_intents_per_turn: 8,
            transcript_window: 12,
            vocabulary: ClassifierVocabulary::default(),
            db_path: PathBuf::from(".scriptorium/studio.db"),
        }
    }
}

impl StudioConfig {
    /// Defaults merged with `.scriptorium/config.json`
    pub async fn load() -> Self {
        Self::load_from(CONFIG_PATH).await
    }

    /// Defaults merged with the overrides at `path`. A missing or unreadable
    /// file yields the defaults.
    pub async fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let mut config = Self::default();
        config.merge(ConfigOverrides::load(path.as_ref()).await);
        config
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier_timeout_secs)
    }

    /// Fresh phase machine from the configured order and autonomy flags
    pub fn initial_phases(&self) -> PhaseStateMachine {
        self.autonomy.iter().fold(
            PhaseStateMachine::new(self.phase_order.iter().cloned()),
            |machine, (phase, flag)| machine.with_autonomy(phase, *flag),
        )
    }

    /// Apply the keys present in `other`
    pub fn merge(&mut self, other: ConfigOverrides) {
        if let Some(order) = other.phase_order.filter(|o| !o.is_empty()) {
            self.phase_order = order;
        }
        self.autonomy.extend(other.autonomy);
        if let Some(provider) = other.provider {
            self.models.provider = provider;
        }
        if other.model.is_some() {
            self.models.model = other.model;
        }
        if other.base_url.is_some() {
            self.models.base_url = other.base_url;
        }
        self.models.per_handler_models.extend(other.per_handler_models);
        self.models
            .per_handler_providers
            .extend(other.per_handler_providers);
        if let Some(secs) = other.handler_timeout_secs {
            self.handler_timeout_secs = secs;
        }
        if let Some(secs) = other.classifier_timeout_secs {
            self.classifier_timeout_secs = secs;
        }
        if let Some(n) = other.max_parallel_units {
            self.max_parallel_units = n.max(1);
        }
        if let Some(n) = other.max_intents_per_turn {
            self.max_intents_per_turn = n.max(1);
        }
        if let Some(n) = other.transcript_window {
            self.transcript_window = n;
        }
        if let Some(vocabulary) = other.vocabulary {
            self.vocabulary = vocabulary;
        }
        if let Some(path) = other.db_path {
            self.db_path = path;
        }
    }
}

/// Persisted, partial configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_order: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub autonomy: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<LlmProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_handler_models: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_handler_providers: HashMap<String, LlmProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_units: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_intents_per_turn: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_window: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocabulary: Option<ClassifierVocabulary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl ConfigOverrides {
    pub async fn load(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(overrides) => overrides,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid config file");
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let config = StudioConfig::load_from(".scriptorium/does_not_exist.json").await;
        assert_eq!(config, StudioConfig::default());
    }

    #[tokio::test]
    async fn test_partial_override_merges() {
        let path = PathBuf::from(".scriptorium/test_config_merge.json");
        let mut overrides = ConfigOverrides {
            phase_order: Some(vec!["plan".to_string(), "write".to_string()]),
            max_parallel_units: Some(0),
            model: Some("gpt-4o-mini".to_string()),
            db_path: Some(PathBuf::from(".scriptorium/projects.db")),
            ..ConfigOverrides::default()
        };
        overrides.autonomy.insert("plan".to_string(), true);
        overrides.save(&path).await.unwrap();

        let config = StudioConfig::load_from(&path).await;
        assert_eq!(config.phase_order, vec!["plan", "write"]);
        assert_eq!(config.max_parallel_units, 1);
        assert_eq!(config.models.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.handler_timeout_secs, 300);
        assert_eq!(config.db_path, PathBuf::from(".scriptorium/projects.db"));

        let phases = config.initial_phases();
        assert!(phases.is_autonomous("plan"));
        assert!(!phases.is_autonomous("write"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_invalid_file_is_ignored() {
        let path = PathBuf::from(".scriptorium/test_config_invalid.json");
        tokio::fs::create_dir_all(".scriptorium").await.unwrap();
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let config = StudioConfig::load_from(&path).await;
        assert_eq!(config.max_intents_per_turn, 8);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
