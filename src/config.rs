//! Database configuration.
//!
//! Every field has a default, so an empty TOML document (or
//! [`DbConfig::default`]) is a complete configuration:
//!
//! ```toml
//! rev_limit = 1000
//! deterministic_revs = true
//! view_batch_size = 50
//!
//! [writer]
//! batch_timeout_ms = 10
//! batch_max_size = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::writer::{WriterConfig, DEFAULT_BATCH_MAX_SIZE, DEFAULT_BATCH_TIMEOUT_MS};

/// Group-commit settings as they appear in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSection {
    /// Longest a write waits for companions before its batch commits.
    pub batch_timeout_ms: u64,
    /// Requests per batch before committing early.
    pub batch_max_size: usize,
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

/// Tunables for one database instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Revision tree stemming depth.
    pub rev_limit: usize,
    /// Derive revision ids from content (md5) instead of randomly.
    pub deterministic_revs: bool,
    /// Documents indexed per view-update transaction.
    pub view_batch_size: usize,
    /// Change rows fetched per round trip by feeds and replication.
    pub changes_batch_size: usize,
    /// Capacity of the live-change broadcast channel.
    pub broadcast_capacity: usize,
    /// Evaluation steps a single map/reduce/filter call may take.
    pub script_step_limit: u64,
    /// Parsed scripts kept in memory.
    pub script_cache_size: usize,
    /// Read-modify-write attempts for one checkpoint write.
    pub checkpoint_max_retries: usize,
    /// Group commit.
    pub writer: WriterSection,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            rev_limit: 1000,
            deterministic_revs: true,
            view_batch_size: 50,
            changes_batch_size: 100,
            broadcast_capacity: 1024,
            script_step_limit: 100_000,
            script_cache_size: 128,
            checkpoint_max_retries: 16,
            writer: WriterSection::default(),
        }
    }
}

impl DbConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: DbConfig =
            toml::from_str(text).map_err(|e| Error::Schema(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Schema(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Rejects values that would stall the engine.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("rev_limit", self.rev_limit),
            ("view_batch_size", self.view_batch_size),
            ("changes_batch_size", self.changes_batch_size),
            ("broadcast_capacity", self.broadcast_capacity),
            ("script_cache_size", self.script_cache_size),
            ("checkpoint_max_retries", self.checkpoint_max_retries),
            ("writer.batch_max_size", self.writer.batch_max_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Schema(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// The writer thread's settings.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_timeout: Duration::from_millis(self.writer.batch_timeout_ms),
            batch_max_size: self.writer.batch_max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(DbConfig::from_toml_str("").unwrap(), DbConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = DbConfig::from_toml_str(
            r#"
            rev_limit = 20
            deterministic_revs = false

            [writer]
            batch_timeout_ms = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.rev_limit, 20);
        assert!(!config.deterministic_revs);
        assert_eq!(config.writer.batch_timeout_ms, 2);
        assert_eq!(config.writer.batch_max_size, DEFAULT_BATCH_MAX_SIZE);
        assert_eq!(config.writer_config().batch_timeout, Duration::from_millis(2));
    }

    #[test]
    fn test_zero_rejected() {
        assert!(matches!(
            DbConfig::from_toml_str("view_batch_size = 0"),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_unparseable() {
        assert!(DbConfig::from_toml_str("rev_limit = \"many\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sofadb.toml");
        std::fs::write(&path, "changes_batch_size = 7\n").unwrap();
        assert_eq!(DbConfig::load(&path).unwrap().changes_batch_size, 7);
    }
}
