//! Configuration management for Maestro
//!
//! TOML configuration with environment-variable overrides. The state root
//! defaults to `~/.maestro` and can be moved with `MAESTRO_HOME`; every
//! recognized option also has a `MAESTRO_*` override so scripts can steer
//! the engine without touching the config file.

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;

/// Global configuration instance
static CONFIG: Lazy<RwLock<Option<MaestroConfig>>> = Lazy::new(|| RwLock::new(None));

/// Complete Maestro configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaestroConfig {
    pub state_root: PathBuf,
    pub llm: LlmConfig,
    pub router: RouterConfig,
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
    pub iterative: IterativeConfig,
    pub feedback: FeedbackConfig,
    pub sandbox: SandboxConfig,
    pub logging: LoggingConfig,
}

/// LLM backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider kind: "http" or "scripted"
    pub provider: String,
    /// Base URL for the HTTP provider
    pub base_url: String,
    /// Default model name when no tier mapping applies
    pub model: String,
    pub max_tokens: u32,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Operator override: route every request to this tier
    pub force_model: Option<String>,
    pub enable_fallback: bool,
    pub max_fallbacks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_workers: usize,
    pub step_deadline_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IterativeConfig {
    /// Iterations per batch before the continue prompt
    pub batch_size: u32,
    /// Absolute cap across all batches
    pub max_total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub sample_rate: f64,
    pub prompts_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Roots the sandbox allows tool operations under (empty = home dir)
    pub allowed_paths: Vec<PathBuf>,
    pub read_only_paths: Vec<PathBuf>,
    pub subprocess_timeout_seconds: u64,
    pub allow_network: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            state_root: get_state_root(),
            llm: LlmConfig::default(),
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
            executor: ExecutorConfig::default(),
            iterative: IterativeConfig::default(),
            feedback: FeedbackConfig::default(),
            sandbox: SandboxConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "http".to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3".to_string(),
            max_tokens: 4096,
            api_key: None,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            force_model: None,
            enable_fallback: true,
            max_fallbacks: 2,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            max_entries: 500,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().min(4),
            step_deadline_seconds: 300,
        }
    }
}

impl Default for IterativeConfig {
    fn default() -> Self {
        Self {
            batch_size: 12,
            max_total: 50,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.1,
            prompts_enabled: true,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            read_only_paths: vec![
                PathBuf::from("/usr"),
                PathBuf::from("/lib"),
                PathBuf::from("/bin"),
            ],
            subprocess_timeout_seconds: 30,
            allow_network: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl MaestroConfig {
    /// Apply `MAESTRO_*` environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MAESTRO_HOME") {
            self.state_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MAESTRO_LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Ok(v) = std::env::var("MAESTRO_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("MAESTRO_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                self.llm.max_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_FORCE_MODEL") {
            if !v.is_empty() {
                self.router.force_model = Some(v);
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_FEEDBACK_SAMPLE_RATE") {
            if let Ok(n) = v.parse() {
                self.feedback.sample_rate = n;
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_FEEDBACK_PROMPTS") {
            self.feedback.prompts_enabled =
                !matches!(v.to_lowercase().as_str(), "false" | "0" | "no" | "off");
        }
        if let Ok(v) = std::env::var("MAESTRO_CACHE_TTL_SECONDS") {
            if let Ok(n) = v.parse() {
                self.cache.ttl_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_CACHE_MAX_ENTRIES") {
            if let Ok(n) = v.parse() {
                self.cache.max_entries = n;
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.executor.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_STEP_DEADLINE_SECONDS") {
            if let Ok(n) = v.parse() {
                self.executor.step_deadline_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.iterative.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("MAESTRO_MAX_ITERATIONS") {
            if let Ok(n) = v.parse() {
                self.iterative.max_total = n;
            }
        }
    }
}

/// Resolve the Maestro state directory
pub fn get_state_root() -> PathBuf {
    if let Ok(home) = std::env::var("MAESTRO_HOME") {
        PathBuf::from(home)
    } else if let Some(home) = dirs::home_dir() {
        home.join(".maestro")
    } else {
        PathBuf::from(".maestro")
    }
}

/// Load configuration from `<state_root>/config.toml` or create defaults
pub async fn load_config() -> Result<MaestroConfig> {
    let config_path = get_state_root().join("config.toml");

    let mut config = if config_path.exists() {
        let contents = fs::read_to_string(&config_path).await?;
        toml::from_str(&contents)?
    } else {
        MaestroConfig::default()
    };

    config.apply_env_overrides();

    let mut global = CONFIG.write().await;
    *global = Some(config.clone());

    Ok(config)
}

/// Get the current configuration, loading it on first use
pub async fn get_config() -> Result<MaestroConfig> {
    let guard = CONFIG.read().await;
    if let Some(ref config) = *guard {
        Ok(config.clone())
    } else {
        drop(guard);
        load_config().await
    }
}

/// Replace the global configuration (tests inject temp state roots here)
pub async fn set_config(config: MaestroConfig) {
    let mut global = CONFIG.write().await;
    *global = Some(config);
}

/// Save configuration to `<state_root>/config.toml`
pub async fn save_config(config: &MaestroConfig) -> Result<()> {
    fs::create_dir_all(&config.state_root).await?;
    let config_path = config.state_root.join("config.toml");
    let toml_str = toml::to_string_pretty(config)?;
    fs::write(&config_path, toml_str).await?;
    Ok(())
}
