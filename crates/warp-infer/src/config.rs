//! Configuration
//!
//! [`ManagerConfig`] holds process-wide settings and is loaded by
//! [`ConfigLoader`] from defaults, an optional TOML file and `WARP_INFER_*`
//! environment overrides, applied in that order. [`ModelConfig`] describes a
//! single model and is usually embedded in the caller's own config files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ProviderPreference;
use crate::error::{Error, Result};
use crate::logging::LogConfig;
use crate::manager::EvictionPolicy;
use crate::options::{OptionValue, TuningOptions};

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "WARP_INFER";

/// Default sweeper poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Session manager configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Eviction settings
    pub eviction: EvictionConfig,
    /// Logging settings
    pub log: LogConfig,
}

impl ManagerConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.eviction.ttl_secs < -1 {
            return Err(Error::Config(format!(
                "eviction.ttl_secs must be -1, 0 or positive, got {}",
                self.eviction.ttl_secs
            )));
        }
        if self.eviction.poll_interval_ms == 0 {
            return Err(Error::Config("eviction.poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Eviction settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Idle timeout in seconds: -1 disables eviction, 0 flushes run sessions
    pub ttl_secs: i64,
    /// How often the sweeper scans access clocks
    pub poll_interval_ms: u64,
}

impl EvictionConfig {
    /// Typed eviction policy
    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::from_ttl_secs(self.ttl_secs)
    }

    /// Sweeper poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: -1,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File(PathBuf),
    Env(String),
}

/// Layered configuration loader
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
}

impl ConfigLoader {
    /// Loader that starts from defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer a TOML file
    #[must_use]
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources.push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Layer environment overrides with the given prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.sources.push(ConfigSource::Env(prefix.to_string()));
        self
    }

    /// Layer `WARP_INFER_*` environment overrides
    #[must_use]
    pub fn with_env(self) -> Self {
        self.with_env_prefix(ENV_PREFIX)
    }

    /// Load and validate
    pub fn load(&self) -> Result<ManagerConfig> {
        let mut config = ManagerConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::File(path) => {
                    let content = std::fs::read_to_string(path)
                        .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;
                    config = Self::parse(&content)?;
                }
                ConfigSource::Env(prefix) => {
                    Self::apply_env_overrides(&mut config, prefix, |key| std::env::var(key).ok())?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML string
    pub fn load_from_str(toml: &str) -> Result<ManagerConfig> {
        let config = Self::parse(toml)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(toml: &str) -> Result<ManagerConfig> {
        toml::from_str(toml).map_err(|e| Error::Config(e.to_string()))
    }

    fn apply_env_overrides(
        config: &mut ManagerConfig,
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(val) = lookup(&format!("{prefix}_EVICTION_TTL_SECS")) {
            config.eviction.ttl_secs = val
                .parse()
                .map_err(|_| Error::Config(format!("Invalid ttl_secs value: {val}")))?;
        }
        if let Some(val) = lookup(&format!("{prefix}_EVICTION_POLL_INTERVAL_MS")) {
            config.eviction.poll_interval_ms = val
                .parse()
                .map_err(|_| Error::Config(format!("Invalid poll_interval_ms value: {val}")))?;
        }
        if let Some(val) = lookup(&format!("{prefix}_LOG_LEVEL")) {
            config.log.level = val.parse()?;
        }
        if let Some(val) = lookup(&format!("{prefix}_LOG_FORMAT")) {
            config.log.format = val.parse()?;
        }
        Ok(())
    }
}

/// Description of one model
///
/// ```toml
/// path = "models/detector.onnx.enc"
/// encrypted = true
///
/// [options]
/// intra_ops_threads = 4
/// graph_optimization_level = 3
///
/// [[providers]]
/// name = "OpenVINOExecutionProvider"
/// options = { device_type = "GPU" }
///
/// [[providers]]
/// name = "CPUExecutionProvider"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model file
    pub path: PathBuf,

    /// Whether the file is XOR-encoded
    #[serde(default)]
    pub encrypted: bool,

    /// Session tuning options
    #[serde(default)]
    pub options: TuningOptions,

    /// Ranked backend preferences, best first
    #[serde(default)]
    pub providers: Vec<ProviderPreference>,
}

impl ModelConfig {
    /// Plain model at `path` with default options and no preferences
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            encrypted: false,
            options: TuningOptions::new(),
            providers: Vec::new(),
        }
    }

    /// Mark the model file as encrypted
    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Set a tuning option
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Append a backend preference
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderPreference) -> Self {
        self.providers.push(provider);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::backend::{CPU_PROVIDER, DEVICE_TYPE_OPTION, OPENVINO_PROVIDER};
    use crate::logging::{LogFormat, LogLevel};
    use crate::options::INTRA_OPS_THREADS;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.eviction.ttl_secs, -1);
        assert_eq!(config.eviction.poll_interval(), Duration::from_millis(5));
        assert_eq!(config.eviction.policy(), EvictionPolicy::Disabled);
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_load_from_str() {
        let config = ConfigLoader::load_from_str(
            r#"
            [eviction]
            ttl_secs = 30

            [log]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.eviction.policy(), EvictionPolicy::Idle(Duration::from_secs(30)));
        assert_eq!(config.eviction.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_validation() {
        assert!(ConfigLoader::load_from_str("[eviction]\nttl_secs = -5").is_err());
        assert!(ConfigLoader::load_from_str("[eviction]\npoll_interval_ms = 0").is_err());
        assert!(ConfigLoader::load_from_str("[eviction]\nttl_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<String, String> = [
            ("TEST_EVICTION_TTL_SECS", "0"),
            ("TEST_EVICTION_POLL_INTERVAL_MS", "20"),
            ("TEST_LOG_LEVEL", "warn"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = ManagerConfig::default();
        ConfigLoader::apply_env_overrides(&mut config, "TEST", |k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.eviction.policy(), EvictionPolicy::Flush);
        assert_eq!(config.eviction.poll_interval_ms, 20);
        assert_eq!(config.log.level, LogLevel::Warn);

        let bad: HashMap<String, String> = [("TEST_EVICTION_TTL_SECS".to_string(), "x".to_string())].into();
        let err = ConfigLoader::apply_env_overrides(&mut config, "TEST", |k| bad.get(k).cloned()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("infer.toml");
        std::fs::write(&path, "[eviction]\nttl_secs = 2\npoll_interval_ms = 10\n").unwrap();

        let config = ConfigLoader::new().with_file(&path).load().unwrap();
        assert_eq!(config.eviction.ttl_secs, 2);
        assert_eq!(config.eviction.poll_interval_ms, 10);

        let missing = ConfigLoader::new().with_file(dir.path().join("nope.toml")).load();
        assert!(matches!(missing, Err(Error::Config(_))));
    }

    #[test]
    fn test_model_config_from_toml() {
        let config: ModelConfig = toml::from_str(
            r#"
            path = "models/detector.onnx.enc"
            encrypted = true

            [options]
            intra_ops_threads = 4

            [[providers]]
            name = "OpenVINOExecutionProvider"
            options = { device_type = "GPU" }

            [[providers]]
            name = "CPUExecutionProvider"
            "#,
        )
        .unwrap();

        assert!(config.encrypted);
        assert_eq!(config.options.get(INTRA_OPS_THREADS), Some(&OptionValue::Int(4)));
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].name, OPENVINO_PROVIDER);
        assert_eq!(
            config.providers[0].options.as_ref().and_then(|o| o.get(DEVICE_TYPE_OPTION)).map(String::as_str),
            Some("GPU")
        );
        assert_eq!(config.providers[1].name, CPU_PROVIDER);
        assert!(config.providers[1].options.is_none());
    }

    #[test]
    fn test_model_config_builder() {
        let config = ModelConfig::new("m.onnx")
            .encrypted()
            .with_option(INTRA_OPS_THREADS, 2_i64)
            .with_provider(ProviderPreference::new(CPU_PROVIDER));
        assert!(config.encrypted);
        assert_eq!(config.options.len(), 1);
        assert_eq!(config.providers.len(), 1);
    }
}
