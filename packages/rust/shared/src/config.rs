//! Application configuration for larder.
//!
//! User config lives at `~/.larder/larder.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LarderError, Result};
use crate::types::Stage;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "larder.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".larder";

// ---------------------------------------------------------------------------
// Config structs (matching larder.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Recipe source settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Retry policy shared by all stages.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-stage worker pool settings.
    #[serde(default)]
    pub stages: StagesConfig,

    /// Which validator and revalidator implementations to use.
    #[serde(default)]
    pub strategy: StrategyConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the database, assets and the exported dataset.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Items per checkpoint batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.larder/data".into()
}
fn default_batch_size() -> usize {
    100
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Site root, without trailing slash.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the paged listing, relative to `base_url`.
    #[serde(default = "default_list_path")]
    pub list_path: String,

    /// Stop after this many listing pages. Unset means until the listing is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u64>,

    /// Per-request timeout.
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            list_path: default_list_path(),
            max_pages: None,
            timeout_secs: default_source_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://www.10000recipe.com".into()
}
fn default_list_path() -> String {
    "/recipe/list.html".into()
}
fn default_source_timeout() -> u64 {
    10
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for transform, validate and revalidate calls.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// API base URL.
    #[serde(default = "default_openrouter_url")]
    pub base_url: String,

    /// Per-call timeout.
    #[serde(default = "default_openrouter_timeout")]
    pub timeout_secs: u64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_openrouter_url(),
            timeout_secs: default_openrouter_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "google/gemini-2.0-flash-001".into()
}
fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_openrouter_timeout() -> u64 {
    60
}

/// `[retry]` section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per item, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles on each further attempt.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff sleep.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    30_000
}

/// `[stages.<name>]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,

    /// Minimum spacing between two requests issued by the same worker.
    #[serde(default)]
    pub min_interval_ms: u64,
}

impl StageConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// `[stages]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "default_fetch_stage")]
    pub fetch: StageConfig,
    #[serde(default = "default_service_stage")]
    pub enrich: StageConfig,
    #[serde(default = "default_service_stage")]
    pub validate: StageConfig,
    #[serde(default = "default_service_stage")]
    pub revalidate: StageConfig,
    #[serde(default = "default_asset_stage")]
    pub asset_fetch: StageConfig,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            fetch: default_fetch_stage(),
            enrich: default_service_stage(),
            validate: default_service_stage(),
            revalidate: default_service_stage(),
            asset_fetch: default_asset_stage(),
        }
    }
}

fn default_fetch_stage() -> StageConfig {
    StageConfig {
        concurrency: 4,
        min_interval_ms: 500,
    }
}
fn default_service_stage() -> StageConfig {
    StageConfig {
        concurrency: 10,
        min_interval_ms: 500,
    }
}
fn default_asset_stage() -> StageConfig {
    StageConfig {
        concurrency: 20,
        min_interval_ms: 0,
    }
}

/// Validate-stage implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorKind {
    /// Ask the transform service for a cleaned name.
    #[default]
    Llm,
    /// Local prefix/suffix stripping, no external calls.
    Rules,
}

/// Revalidate-stage implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevalidatorKind {
    /// Ask the transform service whether the record is a bundle.
    Llm,
    /// Local keyword heuristics.
    #[default]
    Heuristic,
}

/// `[strategy]` section.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub validator: ValidatorKind,
    #[serde(default)]
    pub revalidator: RevalidatorKind,
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, derived from [`AppConfig`] and validated.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Resolved data directory (tilde expanded).
    pub data_dir: PathBuf,
    pub batch_size: usize,
    pub max_pages: Option<u64>,
    pub retry: RetryConfig,
    pub stages: StagesConfig,
}

impl PipelineConfig {
    /// Build and validate a runtime config. Any violation is a `Config` error.
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        let pipeline = Self {
            data_dir: expand_tilde(&config.defaults.data_dir),
            batch_size: config.defaults.batch_size,
            max_pages: config.source.max_pages,
            retry: config.retry,
            stages: config.stages.clone(),
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Check the invariants the controller relies on.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LarderError::config("defaults.batch_size must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(LarderError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(LarderError::config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        for stage in Stage::ALL {
            if self.stage(stage).concurrency == 0 {
                return Err(LarderError::config(format!(
                    "stages.{stage}.concurrency must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// Worker pool settings for `stage`. Filter is a local pass and runs on one worker.
    pub fn stage(&self, stage: Stage) -> StageConfig {
        match stage {
            Stage::Fetch => self.stages.fetch,
            Stage::Enrich => self.stages.enrich,
            Stage::Validate => self.stages.validate,
            Stage::Revalidate => self.stages.revalidate,
            Stage::AssetFetch => self.stages.asset_fetch,
            Stage::Filter => StageConfig {
                concurrency: 1,
                min_interval_ms: 0,
            },
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("larder.db")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.data_dir.join("assets")
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.data_dir.join("dataset.jsonl")
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let app = AppConfig::default();
        Self {
            data_dir: expand_tilde(&app.defaults.data_dir),
            batch_size: app.defaults.batch_size,
            max_pages: None,
            retry: app.retry,
            stages: app.stages,
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.larder/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| LarderError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.larder/larder.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LarderError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LarderError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    init_config_in(&dir)
}

/// Write a default config file into `dir`, creating it if needed.
pub fn init_config_in(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| LarderError::io(dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LarderError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LarderError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(LarderError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("[stages.asset_fetch]"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.retry.max_attempts, 3);
        assert_eq!(parsed.stages.asset_fetch.concurrency, 20);
        assert_eq!(parsed.strategy.revalidator, RevalidatorKind::Heuristic);
    }

    #[test]
    fn partial_stage_sections() {
        let toml_str = r#"
[defaults]
data_dir = "/tmp/larder"
batch_size = 25

[stages.enrich]
concurrency = 2
min_interval_ms = 1500

[strategy]
validator = "rules"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.stages.enrich.concurrency, 2);
        assert_eq!(config.stages.enrich.min_interval_ms, 1500);
        assert_eq!(config.stages.validate.concurrency, 10);
        assert_eq!(config.stages.fetch.min_interval_ms, 500);
        assert_eq!(config.strategy.validator, ValidatorKind::Rules);

        let pipeline = PipelineConfig::from_app(&config).expect("valid");
        assert_eq!(pipeline.batch_size, 25);
        assert_eq!(pipeline.dataset_path(), PathBuf::from("/tmp/larder/dataset.jsonl"));
        assert_eq!(pipeline.stage(Stage::Filter).concurrency, 1);
    }

    #[test]
    fn invalid_pipeline_config_rejected() {
        let mut app = AppConfig::default();
        app.retry.max_attempts = 0;
        let err = PipelineConfig::from_app(&app).unwrap_err();
        assert!(matches!(err, LarderError::Config { .. }));

        let mut app = AppConfig::default();
        app.stages.revalidate.concurrency = 0;
        let err = PipelineConfig::from_app(&app).unwrap_err();
        assert!(err.to_string().contains("revalidate"));

        let mut app = AppConfig::default();
        app.defaults.batch_size = 0;
        assert!(PipelineConfig::from_app(&app).is_err());
    }

    #[test]
    fn init_config_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = init_config_in(dir.path()).expect("init");
        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.defaults.batch_size, 100);
        assert_eq!(loaded.source.base_url, "https://www.10000recipe.com");
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "LARDER_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
