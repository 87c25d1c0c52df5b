use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data").join("startup_data.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_organizations")]
    pub organizations: PathBuf,
    #[serde(default = "default_people")]
    pub people: PathBuf,
    #[serde(default = "default_jobs")]
    pub jobs: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            organizations: default_organizations(),
            people: default_people(),
            jobs: default_jobs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_organizations() -> PathBuf {
    PathBuf::from("organizations.csv")
}
fn default_people() -> PathBuf {
    PathBuf::from("people.csv")
}
fn default_jobs() -> PathBuf {
    PathBuf::from("jobs.csv")
}

impl SourcesConfig {
    /// Resolve a source file against the data directory (absolute paths win).
    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir.join(file)
        }
    }

    pub fn organizations_path(&self) -> PathBuf {
        self.resolve(&self.organizations)
    }

    pub fn people_path(&self) -> PathBuf {
        self.resolve(&self.people)
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.resolve(&self.jobs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            key: String::new(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

impl ApiConfig {
    /// Enrichment is attempted only when a base URL is configured.
    pub fn is_enabled(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_incremental")]
    pub incremental: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            incremental: default_incremental(),
            max_workers: default_max_workers(),
            state_file: default_state_file(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_incremental() -> bool {
    true
}
fn default_max_workers() -> usize {
    4
}
fn default_state_file() -> PathBuf {
    PathBuf::from("data").join("pipeline_state.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load configuration: TOML file (optional), then environment overrides,
/// then validation.
///
/// A missing file is not an error; every field has a default.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Overlay environment-style settings onto `config`. `lookup` is injected so
/// tests do not have to mutate the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("DB_PATH") {
        config.db.path = PathBuf::from(v);
    }
    if let Some(v) = lookup("DATA_DIR") {
        config.sources.data_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("ORGANIZATIONS_CSV") {
        config.sources.organizations = PathBuf::from(v);
    }
    if let Some(v) = lookup("PEOPLE_CSV") {
        config.sources.people = PathBuf::from(v);
    }
    if let Some(v) = lookup("JOBS_CSV") {
        config.sources.jobs = PathBuf::from(v);
    }
    if let Some(v) = lookup("API_BASE_URL") {
        config.api.base_url = v;
    }
    if let Some(v) = lookup("API_KEY") {
        config.api.key = v;
    }
    if let Some(v) = lookup("API_MAX_RETRIES") {
        config.api.max_retries = parse_env("API_MAX_RETRIES", &v)?;
    }
    if let Some(v) = lookup("API_RETRY_DELAY_MS") {
        config.api.retry_delay_ms = parse_env("API_RETRY_DELAY_MS", &v)?;
    }
    if let Some(v) = lookup("API_TIMEOUT_SECS") {
        config.api.timeout_secs = parse_env("API_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = lookup("BATCH_SIZE") {
        config.pipeline.batch_size = parse_env("BATCH_SIZE", &v)?;
    }
    if let Some(v) = lookup("INCREMENTAL_MODE") {
        config.pipeline.incremental = parse_bool_env("INCREMENTAL_MODE", &v)?;
    }
    if let Some(v) = lookup("MAX_WORKERS") {
        config.pipeline.max_workers = parse_env("MAX_WORKERS", &v)?;
    }
    if let Some(v) = lookup("STATE_FILE") {
        config.pipeline.state_file = PathBuf::from(v);
    }
    if let Some(v) = lookup("LOG_LEVEL") {
        config.logging.level = v.to_lowercase();
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("{} must be a number, got '{}'", name, raw))
}

fn parse_bool_env(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => bail!("{} must be true or false, got '{}'", name, raw),
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.batch_size == 0 {
        bail!("pipeline.batch_size must be > 0");
    }
    if config.pipeline.max_workers == 0 {
        bail!("pipeline.max_workers must be > 0");
    }
    Ok(())
}
