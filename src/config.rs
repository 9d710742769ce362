use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from stoker.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct StokerConfig {
    /// Stop after this many generations; absent means run forever.
    pub max_generations: Option<u64>,
    pub child: ChildConfig,
    pub watchdog: WatchdogConfig,
    pub backoff: BackoffConfig,
}

/// The command line to supervise.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ChildConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Silence longer than this restarts the child.
    pub stale_timeout_secs: u64,
    /// Bounded-wait granularity of the inner receive loop.
    pub poll_interval_secs: u64,
    /// How long teardown waits between SIGTERM and SIGKILL.
    pub term_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_spawn_failures: u32,
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A merged value the supervisor cannot run with.
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config: {} {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl StokerConfig {
    /// Load configuration from `path`.
    ///
    /// A missing file is not an error: defaults apply and the child command
    /// may come from the CLI instead. An unreadable or unparsable file is.
    pub fn load(path: &Path) -> Result<StokerConfig, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(StokerConfig::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Merge CLI overrides on top of file values.
    ///
    /// `command` is the trailing `-- command args…` vector; when non-empty
    /// it replaces `[child]` wholesale.
    pub fn apply_overrides(
        &mut self,
        command: &[String],
        timeout_secs: Option<u64>,
        max_generations: Option<u64>,
    ) {
        if let Some((program, args)) = command.split_first() {
            self.child.command = program.clone();
            self.child.args = args.to_vec();
        }
        if let Some(secs) = timeout_secs {
            self.watchdog.stale_timeout_secs = secs;
        }
        if let Some(n) = max_generations {
            self.max_generations = Some(n);
        }
    }

    /// Check merged values before they reach the supervisor.
    ///
    /// A zero poll interval would turn the bounded wait into a busy spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "watchdog.poll_interval_secs",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

// --- Default implementations ---

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stale_timeout_secs: 3,
            poll_interval_secs: 1,
            term_grace_secs: 5,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 2,
            max_delay_secs: 600,
            max_spawn_failures: 5,
        }
    }
}
