//! Program configuration, loaded once at startup and immutable thereafter.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level program options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Which runtime mode to dispatch. Only `"proxy"` exists today.
    pub mode: String,

    /// Logger construction options, consumed by [`crate::logging`].
    pub log: LogConfig,

    /// Forwarding rules for proxy mode.
    pub proxy: ProxyConfig,
}

/// Options for the console and file log sinks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Suppress all console output.
    pub silent: bool,

    /// Do not create any log files or directories.
    pub nofile: bool,

    /// Directory where log files are stored.
    pub directory: String,

    /// Log filename, used when rotation is disabled.
    pub filename: String,

    /// Timestamp format for log lines, as a `time` crate format description.
    pub format: String,

    /// Per-sink severity thresholds.
    pub severity: SeverityConfig,

    /// Rotating-file options.
    pub rotate: RotateConfig,
}

/// Minimum severities for each sink, one of `debug`, `info`, `warning`,
/// `error`, or `fatal`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeverityConfig {
    /// Threshold for the console sink.
    pub console: String,

    /// Threshold for the file sink.
    pub file: String,
}

/// Rotating log file options.
///
/// The size and free-space quotas are accepted for compatibility with older
/// configuration files; rolling is time-based, so they are advisory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RotateConfig {
    /// Use rotating log files instead of a single file.
    pub enabled: bool,

    /// Maximum size (in bytes) of one rotating log file.
    pub size: u64,

    /// Filename prefix of the rotating log files.
    pub filename: String,

    /// Maximum size (in bytes) of all rotating log files combined.
    pub all_files_max_size: u64,

    /// Minimum free disk space (in bytes) to keep rotating.
    pub min_free_space: u64,
}

/// Forwarding rules, kept as four parallel vectors: index *i* across them
/// defines rule *i*. The engine validates that all four have equal length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Local interfaces to bind to, hostnames or IP literals.
    pub local_host: Vec<String>,

    /// Local ports to bind to (1..65535).
    pub local_port: Vec<u16>,

    /// Remote hosts to forward to.
    pub remote_host: Vec<String>,

    /// Remote ports to forward to.
    pub remote_port: Vec<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: "proxy".into(),
            log: LogConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            silent: false,
            nofile: false,
            directory: "logs".into(),
            filename: "tunneld.log".into(),
            format: "[hour]:[minute]:[second].[subsecond digits:6]".into(),
            severity: SeverityConfig::default(),
            rotate: RotateConfig::default(),
        }
    }
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            console: "info".into(),
            file: "info".into(),
        }
    }
}

impl Default for RotateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 1_048_576,
            filename: "tunneld".into(),
            all_files_max_size: 1_073_741_824,
            min_free_space: 1_073_741_824,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            local_host: Vec::new(),
            local_port: Vec::new(),
            remote_host: Vec::new(),
            remote_port: Vec::new(),
        }
    }
}

impl Config {
    /// Read and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not open configuration file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("could not parse configuration file {}", path.display()))
    }

    /// Write the default configuration to `path`, refusing to overwrite an
    /// existing file.
    pub fn generate(path: &Path) -> Result<()> {
        if path.exists() {
            bail!(
                "refusing to overwrite existing configuration file {}",
                path.display()
            );
        }
        let text = toml::to_string_pretty(&Config::default())
            .context("could not serialize default configuration")?;
        fs::write(path, text)
            .with_context(|| format!("could not write configuration file {}", path.display()))?;
        Ok(())
    }
}
