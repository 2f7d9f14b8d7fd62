//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding `pool.size`.
pub const ENV_POOL_SIZE: &str = "PAGEPOOL_SIZE";
/// Environment variable overriding `pool.task_timeout_ms`.
pub const ENV_TASK_TIMEOUT_MS: &str = "PAGEPOOL_TASK_TIMEOUT_MS";
/// Environment variable overriding `pool.idle_timeout_ms`.
pub const ENV_IDLE_TIMEOUT_MS: &str = "PAGEPOOL_IDLE_TIMEOUT_MS";
/// Environment variable overriding `browser.chrome_path`.
pub const ENV_CHROME_PATH: &str = "PAGEPOOL_CHROME_PATH";

/// Top-level pagepool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Worker pool sizing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker slots (default: 3).
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Upper bound for a single task in ms (default: 30000).
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,

    /// Idle timeout in ms. Accepted for compatibility; no reaping is performed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            task_timeout_ms: default_task_timeout(),
            idle_timeout_ms: None,
        }
    }
}

fn default_pool_size() -> usize {
    3
}

fn default_task_timeout() -> u64 {
    30_000
}

/// Browser launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Path to Chrome/Chromium binary for the primary launch (auto-detected if omitted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<String>,

    /// Executable used when the primary launch fails.
    #[serde(default = "default_fallback_path")]
    pub fallback_path: String,

    /// Run in headless mode (default: true).
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Extra command-line flags appended to every launch.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            fallback_path: default_fallback_path(),
            headless: true,
            extra_args: Vec::new(),
        }
    }
}

impl BrowserConfig {
    /// Primary executable with `~` expanded.
    pub fn chrome_path(&self) -> Option<PathBuf> {
        self.chrome_path.as_deref().map(expand_path)
    }

    /// Fallback executable with `~` expanded.
    pub fn fallback_path(&self) -> PathBuf {
        expand_path(&self.fallback_path)
    }
}

fn default_fallback_path() -> String {
    if cfg!(target_os = "macos") {
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome".into()
    } else if cfg!(target_os = "windows") {
        r"C:\Program Files\Google\Chrome\Application\chrome.exe".into()
    } else {
        "/usr/bin/chromium".into()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "pagepool_browser=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

fn env_number<T: std::str::FromStr>(name: &str) -> crate::error::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| crate::error::PagePoolError::Config(format!("{name}: invalid number '{raw}'"))),
        _ => Ok(None),
    }
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::PagePoolError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::PagePoolError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Apply `PAGEPOOL_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> crate::error::Result<()> {
        if let Some(size) = env_number::<usize>(ENV_POOL_SIZE)? {
            self.pool.get_or_insert_with(PoolConfig::default).size = size;
        }
        if let Some(ms) = env_number::<u64>(ENV_TASK_TIMEOUT_MS)? {
            self.pool.get_or_insert_with(PoolConfig::default).task_timeout_ms = ms;
        }
        if let Some(ms) = env_number::<u64>(ENV_IDLE_TIMEOUT_MS)? {
            self.pool.get_or_insert_with(PoolConfig::default).idle_timeout_ms = Some(ms);
        }
        if let Ok(path) = std::env::var(ENV_CHROME_PATH) {
            if !path.is_empty() {
                self.browser.get_or_insert_with(BrowserConfig::default).chrome_path = Some(path);
            }
        }
        Ok(())
    }

    /// Default config file path.
    pub fn config_dir() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Number of worker slots.
    pub fn pool_size(&self) -> usize {
        self.pool
            .as_ref()
            .map(|p| p.size)
            .unwrap_or_else(default_pool_size)
    }

    /// Per-task timeout.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(
            self.pool
                .as_ref()
                .map(|p| p.task_timeout_ms)
                .unwrap_or_else(default_task_timeout),
        )
    }

    /// Configured idle timeout, if any.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.pool
            .as_ref()
            .and_then(|p| p.idle_timeout_ms)
            .map(Duration::from_millis)
    }

    /// Browser section, falling back to defaults.
    pub fn browser(&self) -> BrowserConfig {
        self.browser.clone().unwrap_or_default()
    }

    /// Get a config value by dotted path (e.g. "pool.size", "browser.headless").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(pool) = &self.pool {
            if pool.size == 0 {
                errors.push("Pool size must be at least 1".to_string());
            }
            if pool.task_timeout_ms == 0 {
                errors.push("Task timeout cannot be 0".to_string());
            }
            if pool.idle_timeout_ms.is_some() {
                warnings.push(
                    "pool.idle_timeout_ms is accepted but idle workers are never reaped"
                        .to_string(),
                );
            }
        }

        if let Some(browser) = &self.browser {
            if let Some(path) = browser.chrome_path() {
                if !path.exists() {
                    warnings.push(format!(
                        "Chrome binary not found: {}",
                        path.display()
                    ));
                }
            }
            let fallback = browser.fallback_path();
            if !fallback.exists() {
                warnings.push(format!(
                    "Fallback browser executable not found: {}",
                    fallback.display()
                ));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for pagepool data: `~/.pagepool/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pagepool")
}
