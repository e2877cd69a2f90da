use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::RetryPolicy;
use crate::search::RetrievalSettings;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub novelty: NoveltyConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// Graph store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Relations with a single current value per subject; a new target
    /// supersedes the old one.
    #[serde(default = "default_exclusive_relations")]
    pub exclusive_relations: Vec<String>,
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            dimensions: default_dimensions(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_hop_limit")]
    pub hop_limit: usize,
    #[serde(default = "default_max_facts")]
    pub max_facts: usize,
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
    #[serde(default = "default_max_keyword_hints")]
    pub max_keyword_hints: usize,
    /// How often a running service reloads node embeddings written by
    /// workers in other processes. 0 disables periodic reloads.
    #[serde(default = "default_index_refresh_ms")]
    pub index_refresh_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            hop_limit: default_hop_limit(),
            max_facts: default_max_facts(),
            latency_budget_ms: default_latency_budget_ms(),
            max_keyword_hints: default_max_keyword_hints(),
            index_refresh_ms: default_index_refresh_ms(),
        }
    }
}

/// Novelty detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NoveltyConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
        }
    }
}

/// Task dispatcher and worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            dedup_window_secs: default_dedup_window_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_index_refresh_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_exclusive_relations() -> Vec<String> {
    vec![
        "LIVES_IN".to_string(),
        "WORKS_AT".to_string(),
        "MARRIED_TO".to_string(),
    ]
}

fn default_provider() -> String {
    "hash".to_string()
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_dimensions() -> usize {
    256
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_top_k() -> usize {
    8
}

fn default_hop_limit() -> usize {
    1
}

fn default_max_facts() -> usize {
    20
}

fn default_latency_budget_ms() -> u64 {
    800
}

fn default_max_keyword_hints() -> usize {
    8
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_visibility_timeout_ms() -> u64 {
    60_000
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in FACTGRAPH_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_path = std::env::var("FACTGRAPH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        match self.embeddings.provider.as_str() {
            "hash" => {}
            "openai" => {
                std::env::var(&self.embeddings.api_key_env).with_context(|| {
                    format!(
                        "Environment variable {} not set. Set it in your .env file or as an environment variable.",
                        self.embeddings.api_key_env
                    )
                })?;
            }
            other => anyhow::bail!("embeddings.provider must be \"hash\" or \"openai\", got {}", other),
        }

        if self.embeddings.dimensions == 0 {
            anyhow::bail!("embeddings.dimensions must be greater than 0");
        }

        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be greater than 0");
        }

        if self.retrieval.max_facts == 0 {
            anyhow::bail!("retrieval.max_facts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.novelty.min_confidence) {
            anyhow::bail!("novelty.min_confidence must be between 0.0 and 1.0");
        }

        if self.dispatcher.workers == 0 {
            anyhow::bail!("dispatcher.workers must be greater than 0");
        }

        if self.dispatcher.max_attempts == 0 {
            anyhow::bail!("dispatcher.max_attempts must be greater than 0");
        }

        if self.dispatcher.visibility_timeout_ms <= self.dispatcher.attempt_timeout_ms {
            anyhow::bail!(
                "dispatcher.visibility_timeout_ms must exceed attempt_timeout_ms, otherwise a live attempt gets redelivered"
            );
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.store.db_path
    }

    /// Retrieval knobs in engine form
    pub fn retrieval_settings(&self) -> RetrievalSettings {
        RetrievalSettings {
            top_k: self.retrieval.top_k,
            hop_limit: self.retrieval.hop_limit,
            max_facts: self.retrieval.max_facts,
            latency_budget: Duration::from_millis(self.retrieval.latency_budget_ms),
            max_keyword_hints: self.retrieval.max_keyword_hints,
        }
    }

    /// Dispatcher knobs in queue form
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dispatcher.max_attempts,
            backoff_base: Duration::from_millis(self.dispatcher.backoff_base_ms),
            backoff_max: Duration::from_millis(self.dispatcher.backoff_max_ms),
            visibility_timeout: Duration::from_millis(self.dispatcher.visibility_timeout_ms),
            dedup_window: Duration::from_secs(self.dispatcher.dedup_window_secs),
        }
    }

    /// Period of the vector index reload, `None` when disabled.
    pub fn index_refresh_interval(&self) -> Option<Duration> {
        (self.retrieval.index_refresh_ms > 0).then(|| Duration::from_millis(self.retrieval.index_refresh_ms))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher.attempt_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const MINIMAL: &str = r#"
[store]
db_path = "./test.db"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.store.log_level, "info");
        assert_eq!(config.embeddings.provider, "hash");
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.retrieval.hop_limit, 1);
        assert_eq!(config.dispatcher.max_attempts, 3);
        assert_eq!(config.index_refresh_interval(), Some(Duration::from_secs(30)));
        assert!(config
            .store
            .exclusive_relations
            .contains(&"LIVES_IN".to_string()));
    }

    #[test]
    fn test_full_config_overrides() {
        let config = Config::from_toml_str(
            r#"
[store]
db_path = "./kg.db"
log_level = "debug"
exclusive_relations = ["LIVES_IN"]

[embeddings]
provider = "hash"
dimensions = 64

[retrieval]
top_k = 4
max_facts = 10
latency_budget_ms = 250
index_refresh_ms = 0

[novelty]
min_confidence = 0.7

[dispatcher]
workers = 2
max_attempts = 5
visibility_timeout_ms = 5000
attempt_timeout_ms = 1000
"#,
        )
        .unwrap();
        assert_eq!(config.store.exclusive_relations, vec!["LIVES_IN".to_string()]);
        assert_eq!(config.embeddings.dimensions, 64);
        let settings = config.retrieval_settings();
        assert_eq!(settings.top_k, 4);
        assert_eq!(settings.latency_budget, Duration::from_millis(250));
        assert_eq!(config.index_refresh_interval(), None);
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.visibility_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_rejects_out_of_range_confidence() {
        let err = Config::from_toml_str(
            r#"
[store]
db_path = "./kg.db"

[novelty]
min_confidence = 1.5
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_confidence"));
    }

    #[test]
    fn test_rejects_visibility_not_exceeding_attempt_timeout() {
        let err = Config::from_toml_str(
            r#"
[store]
db_path = "./kg.db"

[dispatcher]
visibility_timeout_ms = 1000
attempt_timeout_ms = 1000
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("visibility_timeout_ms"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = Config::from_toml_str(
            r#"
[store]
db_path = "./kg.db"

[embeddings]
provider = "word2vec"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("provider"));
    }

    #[test]
    fn test_openai_provider_requires_api_key() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("FACTGRAPH_TEST_KEY").ok();
        std::env::remove_var("FACTGRAPH_TEST_KEY");
        let text = r#"
[store]
db_path = "./kg.db"

[embeddings]
provider = "openai"
api_key_env = "FACTGRAPH_TEST_KEY"
"#;
        let err = Config::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("FACTGRAPH_TEST_KEY"));

        std::env::set_var("FACTGRAPH_TEST_KEY", "test-key");
        assert!(Config::from_toml_str(text).is_ok());
        std::env::remove_var("FACTGRAPH_TEST_KEY");
        if let Some(v) = original {
            std::env::set_var("FACTGRAPH_TEST_KEY", v);
        }
    }

    #[test]
    fn test_config_load_from_env_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, MINIMAL).unwrap();

        let original = std::env::var("FACTGRAPH_CONFIG").ok();
        std::env::set_var("FACTGRAPH_CONFIG", config_path.to_str().unwrap());
        let config = Config::load();
        std::env::remove_var("FACTGRAPH_CONFIG");
        if let Some(v) = original {
            std::env::set_var("FACTGRAPH_CONFIG", v);
        }
        let config = config.unwrap();
        assert_eq!(config.db_path(), Path::new("./test.db"));
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("FACTGRAPH_CONFIG").ok();
        std::env::set_var("FACTGRAPH_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("FACTGRAPH_CONFIG");
        if let Some(v) = original {
            std::env::set_var("FACTGRAPH_CONFIG", v);
        }
    }
}
