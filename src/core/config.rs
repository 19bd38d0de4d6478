//! DT-010: detent.yaml configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetentConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Directory holding the row database and event logs
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub write_back: WriteBackConfig,

    /// Optional dictionary override (YAML). Built-in dictionary otherwise.
    #[serde(default)]
    pub dictionary: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl Default for DetentConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            state_dir: default_state_dir(),
            token: TokenConfig::default(),
            execution: ExecutionConfig::default(),
            write_back: WriteBackConfig::default(),
            dictionary: None,
        }
    }
}

impl DetentConfig {
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("rows.db")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }
}

/// Confirmation token settings. The secret itself only ever comes from
/// the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
}

fn default_secret_env() -> String {
    "FILTER_TOKEN_SECRET".to_string()
}

fn default_ttl() -> u64 {
    600
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            ttl_seconds: default_ttl(),
        }
    }
}

/// Row execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Concurrent external calls per batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deferred recovery passes before a row escalates to needs_review
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_concurrency() -> usize {
    5
}

fn default_max_recovery_attempts() -> u32 {
    3
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

/// Write-back worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBackConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dt010_minimal_yaml_gets_defaults() {
        let cfg: DetentConfig = serde_yaml_ng::from_str("version: \"1.0\"\n").unwrap();
        assert_eq!(cfg.state_dir, PathBuf::from("state"));
        assert_eq!(cfg.token.secret_env, "FILTER_TOKEN_SECRET");
        assert_eq!(cfg.token.ttl_seconds, 600);
        assert_eq!(cfg.execution.concurrency, 5);
        assert_eq!(cfg.execution.max_recovery_attempts, 3);
        assert_eq!(cfg.write_back.max_retries, 3);
        assert!(cfg.dictionary.is_none());
    }

    #[test]
    fn test_dt010_paths() {
        let cfg = DetentConfig {
            state_dir: PathBuf::from("/var/lib/detent"),
            ..DetentConfig::default()
        };
        assert_eq!(cfg.database_path(), PathBuf::from("/var/lib/detent/rows.db"));
        assert_eq!(cfg.artifact_dir(), PathBuf::from("/var/lib/detent/artifacts"));
    }
}
