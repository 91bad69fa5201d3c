use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::api::DEFAULT_BASE_URL;
use crate::channel::ChannelConfig;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_CONFIG_PATH: &str = "STAGEHAND_CONFIG_PATH";
const ENV_WORKER_URL: &str = "STAGEHAND_WORKER_URL";
const ENV_POLL_INTERVAL_MS: &str = "STAGEHAND_POLL_INTERVAL_MS";
const ENV_TASK_TIMEOUT_SECS: &str = "STAGEHAND_TASK_TIMEOUT_SECS";
const ENV_PUSH_ENABLED: &str = "STAGEHAND_PUSH_ENABLED";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    worker_url: String,
    poll_interval_ms: u64,
    task_timeout_secs: u64,
    push_enabled: bool,
    push_backoff_max_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let path = match config_file_override() {
            Some(path) => path,
            None => Self::default_config_path()?,
        };
        Self::load_from(&path)
    }

    /// Defaults, then `path` if it exists, then environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        if path.exists() {
            config.apply_partial(read_partial(path)?);
        }
        config.apply_env()?;
        Ok(config)
    }

    pub fn worker_url(&self) -> &str {
        &self.worker_url
    }

    pub fn push_enabled(&self) -> bool {
        self.push_enabled
    }

    pub fn channel_config(&self) -> ChannelConfig {
        let defaults = ChannelConfig::default();
        ChannelConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            task_timeout: Duration::from_secs(self.task_timeout_secs.max(1)),
            push_backoff_initial: defaults.push_backoff_initial,
            push_backoff_max: Duration::from_secs(self.push_backoff_max_secs)
                .max(defaults.push_backoff_initial),
        }
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("com", "Stagehand", "Stagehand")
            .ok_or_else(|| anyhow!("unable to determine config directory"))?;
        Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(url) = partial.worker_url.filter(|url| !url.trim().is_empty()) {
            self.worker_url = url;
        }
        if let Some(interval) = partial.poll_interval_ms {
            self.poll_interval_ms = interval;
        }
        if let Some(timeout) = partial.task_timeout_secs {
            self.task_timeout_secs = timeout;
        }
        if let Some(enabled) = partial.push_enabled {
            self.push_enabled = enabled;
        }
        if let Some(backoff) = partial.push_backoff_max_secs {
            self.push_backoff_max_secs = backoff;
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_value(ENV_WORKER_URL) {
            self.worker_url = value;
        }
        if let Some(value) = env_value(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = value
                .parse()
                .with_context(|| format!("{ENV_POLL_INTERVAL_MS} must be a whole number"))?;
        }
        if let Some(value) = env_value(ENV_TASK_TIMEOUT_SECS) {
            self.task_timeout_secs = value
                .parse()
                .with_context(|| format!("{ENV_TASK_TIMEOUT_SECS} must be a whole number"))?;
        }
        if let Some(value) = env_value(ENV_PUSH_ENABLED) {
            self.push_enabled = parse_flag(&value)
                .ok_or_else(|| anyhow!("{ENV_PUSH_ENABLED} must be true or false"))?;
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_url: DEFAULT_BASE_URL.into(),
            poll_interval_ms: 1500,
            task_timeout_secs: 30 * 60,
            push_enabled: true,
            push_backoff_max_secs: 10,
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_file_override() -> Option<PathBuf> {
    let value = env::var_os(ENV_CONFIG_PATH)?;
    if value.is_empty() {
        return None;
    }
    let path = PathBuf::from(value);
    if path.is_dir() {
        return Some(path.join(CONFIG_FILE_NAME));
    }
    Some(path)
}

fn read_partial(path: &Path) -> Result<PartialConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let partial: PartialConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(partial)
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PartialConfig {
    worker_url: Option<String>,
    poll_interval_ms: Option<u64>,
    task_timeout_secs: Option<u64>,
    push_enabled: Option<bool>,
    push_backoff_max_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "worker_url = \"http://gpu-box:8001\"\npoll_interval_ms = 500\npush_enabled = false\n",
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.apply_partial(read_partial(&path).unwrap());

        assert_eq!(config.worker_url(), "http://gpu-box:8001");
        assert!(!config.push_enabled());
        let channel = config.channel_config();
        assert_eq!(channel.poll_interval, Duration::from_millis(500));
        assert_eq!(channel.task_timeout, Duration::from_secs(1800));
        assert_eq!(channel.push_backoff_max, Duration::from_secs(10));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "poll_interval_ms = \"soon\"").unwrap();
        assert!(read_partial(&path).is_err());
    }

    #[test]
    fn defaults_match_channel_defaults() {
        assert_eq!(AppConfig::default().channel_config(), ChannelConfig::default());
    }

    #[test]
    fn push_flag_accepts_common_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
