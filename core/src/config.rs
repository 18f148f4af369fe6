use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "clipstack";
const DATA_DIR_ENV: &str = "CLIPSTACK_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    /// Maximum number of unpinned entries.
    pub capacity: usize,
    pub poll_interval_ms: u64,
    pub clipboard_timeout_ms: u64,
    pub flush_interval_ms: u64,
    /// Text beyond this many bytes is truncated before it is stored.
    pub max_text_bytes: usize,
    /// Images whose raw RGBA exceeds this are not stored.
    pub max_image_bytes: usize,
    pub trim_whitespace: bool,
    pub write_retries: u32,
    /// Overrides the strategy's wait before the paste keystroke.
    pub paste_delay_ms: Option<u64>,
    /// Program (and arguments) launched on TOGGLE, e.g. a popup.
    pub toggle_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(APP_DIR)
            });

        Self {
            data_dir,
            socket_path: default_socket_path(),
            capacity: 500,
            poll_interval_ms: 150,
            clipboard_timeout_ms: 500,
            flush_interval_ms: 1000,
            max_text_bytes: 1024 * 1024,
            max_image_bytes: 64 * 1024 * 1024,
            trim_whitespace: false,
            write_retries: 3,
            paste_delay_ms: None,
            toggle_command: Vec::new(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("clipstack.sock"),
        #[cfg(unix)]
        None => std::env::temp_dir().join(format!("clipstack-{}.sock", unsafe { libc::getuid() })),
        #[cfg(not(unix))]
        None => std::env::temp_dir().join("clipstack.sock"),
    }
}

impl Config {
    /// Reads `$XDG_CONFIG_HOME/clipstack/config.toml`, writing the defaults
    /// there on first run.
    pub fn load() -> Result<Self> {
        let config_path = dirs::config_dir()
            .unwrap_or_default()
            .join(APP_DIR)
            .join("config.toml");
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        Self::load_with_env(config_path, |key| std::env::var_os(key))
    }

    /// Environment overrides win over the file, including the defaults
    /// written on first run.
    fn load_with_env<F>(config_path: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            let config = Self::default();
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(config_path, toml::to_string_pretty(&config)?)?;
            config
        };

        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|dir| !dir.is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn clipboard_timeout(&self) -> Duration {
        Duration::from_millis(self.clipboard_timeout_ms.max(10))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(50))
    }

    pub fn paste_delay(&self) -> Option<Duration> {
        self.paste_delay_ms.map(Duration::from_millis)
    }
}
