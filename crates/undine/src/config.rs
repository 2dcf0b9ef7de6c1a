//! Daemon configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use undine_core::{UndineError, UndineResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[daemon]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            max_children: default_max_children(),
            queue_capacity: default_queue_capacity(),
            read_chunk_size: default_read_chunk_size(),
            max_frame_len: default_max_frame_len(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

/// `[heartbeat]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_ping_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub exit_on_timeout: bool,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: default_ping_interval(),
            timeout_secs: default_ping_timeout(),
            exit_on_timeout: false,
        }
    }
}

/// `[log]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

fn default_max_children() -> usize {
    1024
}
fn default_queue_capacity() -> usize {
    1
}
fn default_read_chunk_size() -> usize {
    1024 * 1024
}
fn default_max_frame_len() -> usize {
    undine_core::codec::DEFAULT_MAX_FRAME_LEN
}
fn default_drain_grace_ms() -> u64 {
    100
}
fn default_ping_interval() -> u64 {
    5
}
fn default_ping_timeout() -> u64 {
    10
}
fn default_log_file() -> String {
    "./log.txt".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Overrides taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_file: Option<String>,
    pub log_level: Option<String>,
    pub ping_interval: Option<u64>,
    pub ping_timeout: Option<u64>,
    pub exit_on_ping_timeout: bool,
    pub max_children: Option<usize>,
}

/// Heartbeat timing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub exit_on_timeout: bool,
}

/// Where the file-level settings came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    File(PathBuf),
    /// A path was given but nothing exists there.
    Missing(PathBuf),
}

/// Resolved daemon configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub max_children: usize,
    pub queue_capacity: usize,
    pub read_chunk_size: usize,
    pub max_frame_len: usize,
    pub drain_grace: Duration,
    pub heartbeat: HeartbeatConfig,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub source: ConfigSource,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &CliOverrides::default())
    }
}

impl DaemonConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> UndineResult<Self> {
        let (file_config, source) = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    let content = std::fs::read_to_string(&expanded)?;
                    (parse(&content)?, ConfigSource::File(expanded))
                } else {
                    (ConfigFile::default(), ConfigSource::Missing(expanded))
                }
            }
            None => (ConfigFile::default(), ConfigSource::Defaults),
        };
        let mut config = Self::resolve(file_config, cli);
        config.source = source;
        Ok(config)
    }

    fn resolve(file: ConfigFile, cli: &CliOverrides) -> Self {
        let log_file = cli.log_file.clone().unwrap_or(file.log.file);
        // "-" keeps logs on stderr.
        let log_file = if log_file.is_empty() || log_file == "-" {
            None
        } else {
            Some(expand_tilde_str(&log_file))
        };

        Self {
            max_children: cli.max_children.unwrap_or(file.daemon.max_children),
            queue_capacity: file.daemon.queue_capacity.max(1),
            read_chunk_size: file.daemon.read_chunk_size.max(1),
            max_frame_len: file.daemon.max_frame_len,
            drain_grace: Duration::from_millis(file.daemon.drain_grace_ms),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(
                    cli.ping_interval.unwrap_or(file.heartbeat.interval_secs).max(1),
                ),
                timeout: Duration::from_secs(
                    cli.ping_timeout.unwrap_or(file.heartbeat.timeout_secs).max(1),
                ),
                exit_on_timeout: cli.exit_on_ping_timeout || file.heartbeat.exit_on_timeout,
            },
            log_file,
            log_level: cli.log_level.clone().unwrap_or(file.log.level),
            source: ConfigSource::Defaults,
        }
    }
}

fn parse(content: &str) -> UndineResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| UndineError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
