//! Engine configuration.
//!
//! The engine reads its settings from the `evalpool` section of a
//! [`ConfigSource`]. Every field is optional; zero or missing values fall back
//! to the defaults below.
//!
//! | field | default | range |
//! |---|---|---|
//! | `pool_size` | 4 | 1..=100 |
//! | `default_timeout_ms` | 30000 | 100..=3600000 |
//! | `interrupt_grace_ms` | 1000 | 1..=60000 |
//! | `instruction_budget` | 1024 | >= 1 |
//!
//! # Example
//!
//! ```
//! use evalpool_server::config::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::new()
//!     .with_pool_size(8)
//!     .with_default_timeout(Duration::from_secs(5));
//! assert!(config.validate().is_ok());
//! ```

use evalpool_common::protocol::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Section key the engine configuration lives under.
pub const CONFIG_SECTION: &str = "evalpool";

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const MAX_POOL_SIZE: usize = 100;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MIN_TIMEOUT_MS: u64 = 100;
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;
pub const DEFAULT_INTERRUPT_GRACE_MS: u64 = 1_000;
pub const MAX_INTERRUPT_GRACE_MS: u64 = 60_000;
pub const DEFAULT_INSTRUCTION_BUDGET: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of interpreters, fixed for the engine's lifetime
    pub pool_size: usize,
    /// Deadline used when a request does not carry a positive `timeout_ms`
    pub default_timeout_ms: u64,
    /// How long a timed-out script may take to honor its interrupt before
    /// its interpreter is discarded
    pub interrupt_grace_ms: u64,
    /// VM instructions between two interrupt check-points
    pub instruction_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            interrupt_grace_ms: DEFAULT_INTERRUPT_GRACE_MS,
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace_ms = duration_ms(grace);
        self
    }

    pub fn with_instruction_budget(mut self, budget: u32) -> Self {
        self.instruction_budget = budget;
        self
    }

    /// Replaces zero values with their defaults.
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.pool_size == 0 {
            self.pool_size = defaults.pool_size;
        }
        if self.default_timeout_ms == 0 {
            self.default_timeout_ms = defaults.default_timeout_ms;
        }
        if self.interrupt_grace_ms == 0 {
            self.interrupt_grace_ms = defaults.interrupt_grace_ms;
        }
        if self.instruction_budget == 0 {
            self.instruction_budget = defaults.instruction_budget;
        }
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    /// Checks every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns a description of the first field out of range.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.pool_size == 0 || self.pool_size > MAX_POOL_SIZE {
            return Err(format!(
                "pool_size must be between 1 and {} (got {})",
                MAX_POOL_SIZE, self.pool_size
            ));
        }

        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.default_timeout_ms) {
            return Err(format!(
                "default_timeout_ms must be between {} and {} (got {})",
                MIN_TIMEOUT_MS, MAX_TIMEOUT_MS, self.default_timeout_ms
            ));
        }

        if !(1..=MAX_INTERRUPT_GRACE_MS).contains(&self.interrupt_grace_ms) {
            return Err(format!(
                "interrupt_grace_ms must be between 1 and {} (got {})",
                MAX_INTERRUPT_GRACE_MS, self.interrupt_grace_ms
            ));
        }

        if self.instruction_budget == 0 {
            return Err("instruction_budget must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Reads, defaults and validates the `evalpool` section of `source`.
    ///
    /// # Errors
    ///
    /// - `EvalError::NotConfigured` if the section is missing
    /// - `EvalError::InvalidConfig` if it cannot be decoded or fails validation
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let section = source
            .section(CONFIG_SECTION)
            .ok_or_else(|| EvalError::NotConfigured(CONFIG_SECTION.to_string()))?;

        let config: EngineConfig = match section {
            // An empty section (`evalpool:` with nothing under it) means all defaults.
            Value::Null => EngineConfig::default(),
            other => serde_json::from_value(other)
                .map_err(|e| EvalError::InvalidConfig(e.to_string()))?,
        };

        let config = config.with_defaults();
        config.validate().map_err(EvalError::InvalidConfig)?;
        Ok(config)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Where configuration sections come from.
pub trait ConfigSource: Send + Sync {
    fn has(&self, key: &str) -> bool;

    /// The raw section stored under `key`, if any.
    fn section(&self, key: &str) -> Option<Value>;
}

/// A [`ConfigSource`] over a JSON document whose top-level keys are sections.
#[derive(Debug, Clone, Default)]
pub struct JsonConfigSource {
    root: Value,
}

impl JsonConfigSource {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Loads a JSON document from disk.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::Io` if the file cannot be read and
    /// `EvalError::InvalidConfig` if it is not valid JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let root = serde_json::from_str(&text).map_err(|e| {
            EvalError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        Ok(Self { root })
    }

    /// Sets (or overwrites) a field of a section, creating the section as
    /// needed.
    pub fn set(&mut self, section: &str, field: &str, value: Value) {
        if !self.root.is_object() {
            self.root = Value::Object(Default::default());
        }
        if let Value::Object(root) = &mut self.root {
            let entry = root
                .entry(section.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if !entry.is_object() {
                *entry = Value::Object(Default::default());
            }
            if let Value::Object(fields) = entry {
                fields.insert(field.to_string(), value);
            }
        }
    }
}

impl ConfigSource for JsonConfigSource {
    fn has(&self, key: &str) -> bool {
        self.root.get(key).is_some()
    }

    fn section(&self, key: &str) -> Option<Value> {
        self.root.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.interrupt_grace(), Duration::from_secs(1));
        assert_eq!(config.instruction_budget, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_pool_size(2)
            .with_default_timeout(Duration::from_millis(250))
            .with_interrupt_grace(Duration::from_millis(50))
            .with_instruction_budget(64);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.default_timeout_ms, 250);
        assert_eq!(config.interrupt_grace_ms, 50);
        assert_eq!(config.instruction_budget, 64);
    }

    #[test]
    fn test_zero_values_take_defaults() {
        let config = EngineConfig {
            pool_size: 0,
            default_timeout_ms: 0,
            interrupt_grace_ms: 0,
            instruction_budget: 0,
        }
        .with_defaults();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_validate_pool_size() {
        assert!(EngineConfig::new().with_pool_size(1).validate().is_ok());
        assert!(EngineConfig::new().with_pool_size(100).validate().is_ok());
        let err = EngineConfig::new().with_pool_size(101).validate().unwrap_err();
        assert!(err.contains("pool_size"));
        assert!(EngineConfig::new().with_pool_size(0).validate().is_err());
    }

    #[test]
    fn test_validate_timeouts() {
        let too_short = EngineConfig::new().with_default_timeout(Duration::from_millis(99));
        assert!(too_short.validate().unwrap_err().contains("default_timeout_ms"));

        let too_long = EngineConfig::new().with_default_timeout(Duration::from_secs(3601));
        assert!(too_long.validate().is_err());

        let grace = EngineConfig::new().with_interrupt_grace(Duration::from_secs(61));
        assert!(grace.validate().unwrap_err().contains("interrupt_grace_ms"));
    }

    #[test]
    fn test_missing_section_is_not_configured() {
        let source = JsonConfigSource::from_value(json!({"other": {}}));
        assert!(!source.has(CONFIG_SECTION));
        let err = EngineConfig::from_source(&source).unwrap_err();
        assert!(matches!(err, EvalError::NotConfigured(_)));
    }

    #[test]
    fn test_empty_section_uses_defaults() {
        let source = JsonConfigSource::from_value(json!({"evalpool": null}));
        assert_eq!(
            EngineConfig::from_source(&source).unwrap(),
            EngineConfig::default()
        );

        let source = JsonConfigSource::from_value(json!({"evalpool": {}}));
        assert_eq!(
            EngineConfig::from_source(&source).unwrap(),
            EngineConfig::default()
        );
    }

    #[test]
    fn test_partial_section() {
        let source = JsonConfigSource::from_value(json!({"evalpool": {"pool_size": 2}}));
        let config = EngineConfig::from_source(&source).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_invalid_section() {
        let out_of_range =
            JsonConfigSource::from_value(json!({"evalpool": {"pool_size": 500}}));
        assert!(matches!(
            EngineConfig::from_source(&out_of_range),
            Err(EvalError::InvalidConfig(_))
        ));

        let wrong_type =
            JsonConfigSource::from_value(json!({"evalpool": {"pool_size": "many"}}));
        assert!(matches!(
            EngineConfig::from_source(&wrong_type),
            Err(EvalError::InvalidConfig(_))
        ));

        let unknown = JsonConfigSource::from_value(json!({"evalpool": {"max_memory": 1}}));
        assert!(matches!(
            EngineConfig::from_source(&unknown),
            Err(EvalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_set_overrides_and_creates_section() {
        let mut source = JsonConfigSource::default();
        source.set(CONFIG_SECTION, "pool_size", json!(3));
        let config = EngineConfig::from_source(&source).unwrap();
        assert_eq!(config.pool_size, 3);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"evalpool": {{"default_timeout_ms": 500}}}}"#).unwrap();

        let source = JsonConfigSource::from_path(file.path()).unwrap();
        let config = EngineConfig::from_source(&source).unwrap();
        assert_eq!(config.default_timeout_ms, 500);
    }

    #[test]
    fn test_from_path_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            JsonConfigSource::from_path(file.path()),
            Err(EvalError::InvalidConfig(_))
        ));
    }
}
