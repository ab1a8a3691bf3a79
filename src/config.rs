use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{ChainError, Result};
use crate::repo::DEFAULT_PREFIX;
use crate::telemetry;

/// Backoff applied between attempts of a failing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Delay grows by `multiplier` per attempt, capped at `max_delay_ms`.
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    Linear {
        delay_ms: u64,
    },
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Wait before the attempt after `failed_attempt` (1-based).
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        match self {
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exp = failed_attempt.saturating_sub(1) as f64;
                let base = (*initial_delay_ms as f64 * multiplier.powf(exp)).round();
                let base = if base.is_finite() {
                    (base as u64).min(*max_delay_ms)
                } else {
                    *max_delay_ms
                };
                // up to 10% jitter
                let jitter = fastrand::u64(0..=base / 10);
                Duration::from_millis(base.saturating_add(jitter).min(*max_delay_ms))
            }
            Self::Linear { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Immediate => Duration::ZERO,
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

/// Where chains are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RepoConfig {
    Memory {
        #[serde(default = "default_prefix")]
        prefix: String,
    },
    Sled {
        path: PathBuf,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
    Redis {
        url: String,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self::Memory {
            prefix: default_prefix(),
        }
    }
}

impl RepoConfig {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::Sled { .. } => "sled",
            Self::Redis { .. } => "redis",
        }
    }

    pub fn prefix(&self) -> &str {
        match self {
            Self::Memory { prefix } | Self::Sled { prefix, .. } | Self::Redis { prefix, .. } => {
                prefix
            }
        }
    }
}

/// Runner configuration, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub log_level: String,
    /// Attempts for specs that do not set their own.
    pub default_tries: u32,
    /// Keep repository records of chains that reached a terminal state.
    pub keep_finished_chains: bool,
    pub retry: RetryStrategy,
    pub chain_repo: RepoConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            default_tries: 1,
            keep_finished_chains: false,
            retry: RetryStrategy::default(),
            chain_repo: RepoConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        telemetry::parse_level(&self.log_level)?;

        if self.default_tries == 0 {
            return Err(ChainError::configuration(
                "default_tries must be greater than 0",
            ));
        }

        if let RetryStrategy::Exponential {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        } = &self.retry
        {
            if *multiplier < 1.0 {
                return Err(ChainError::configuration("retry multiplier must be >= 1.0"));
            }
            if initial_delay_ms > max_delay_ms {
                return Err(ChainError::configuration(
                    "retry initial_delay_ms cannot exceed max_delay_ms",
                ));
            }
        }

        if self.chain_repo.prefix().is_empty() {
            return Err(ChainError::configuration("chain_repo prefix cannot be empty"));
        }
        match &self.chain_repo {
            RepoConfig::Sled { path, .. } if path.as_os_str().is_empty() => {
                Err(ChainError::configuration("chain_repo path cannot be empty"))
            }
            RepoConfig::Redis { url, .. } if url.is_empty() => {
                Err(ChainError::configuration("chain_repo url cannot be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Reads and validates a YAML config file.
pub fn load(path: impl AsRef<Path>) -> Result<RunnerConfig> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config: RunnerConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    debug!(path = %path.as_ref().display(), repo = config.chain_repo.backend(), "Loaded config");
    Ok(config)
}

pub struct RunnerConfigBuilder {
    config: RunnerConfig,
}

impl RunnerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RunnerConfig::default(),
        }
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn default_tries(mut self, tries: u32) -> Self {
        self.config.default_tries = tries;
        self
    }

    pub fn keep_finished_chains(mut self, keep: bool) -> Self {
        self.config.keep_finished_chains = keep;
        self
    }

    pub fn retry(mut self, strategy: RetryStrategy) -> Self {
        self.config.retry = strategy;
        self
    }

    pub fn chain_repo(mut self, repo: RepoConfig) -> Self {
        self.config.chain_repo = repo;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<RunnerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RunnerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
