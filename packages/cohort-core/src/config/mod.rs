//! Runtime configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file
//! (schema `version: 1`), then `COHORT__*` environment variables.
//!
//! # Examples
//!
//! ```rust,ignore
//! use cohort_core::config::CohortConfig;
//!
//! // Defaults overridden by the environment
//! let config = CohortConfig::load(None)?;
//!
//! // File + environment
//! let config = CohortConfig::load(Some("cohort.yaml".as_ref()))?;
//! println!("{}", config.to_yaml()?);
//! ```

pub mod error;

pub use error::{ConfigError, ConfigResult};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Supported YAML schema versions
const SUPPORTED_VERSIONS: &[u64] = &[1];

const MAX_PARALLEL_TASKS: usize = 1024;

pub const ENV_CACHE_DIR: &str = "COHORT__CACHE_DIR";
pub const ENV_MAX_PARALLEL_TASKS: &str = "COHORT__MAX_PARALLEL_TASKS";
pub const ENV_LOG_FILTER: &str = "COHORT__LOG_FILTER";

/// How column candidates are ranked before `order` picks one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTieBreak {
    /// Acquisition rank first (unranked items last), then path
    #[default]
    Acquisition,
    /// Path only
    Path,
}

/// Effective runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CohortConfig {
    /// Root of the local item cache and engine work directories
    pub cache_dir: PathBuf,
    pub max_parallel_tasks: usize,
    pub order_tie_break: OrderTieBreak,
    /// Match regex source paths against the whole item path
    pub regex_full_match: bool,
    pub log_filter: String,
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("cohort-cache"),
            max_parallel_tasks: default_parallelism(),
            order_tie_break: OrderTieBreak::default(),
            regex_full_match: true,
            log_filter: "info".to_string(),
        }
    }
}

/// Three quarters of the available CPUs, at least one
fn default_parallelism() -> usize {
    (num_cpus::get() * 3 / 4).max(1)
}

/// YAML Schema v1; every field but `version` is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFileV1 {
    version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_parallel_tasks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order_tie_break: Option<OrderTieBreak>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regex_full_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_filter: Option<String>,
}

impl CohortConfig {
    /// Defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::read_yaml(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by a YAML file (no environment)
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config = Self::read_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        let version = raw
            .get("version")
            .ok_or(ConfigError::MissingVersion)?
            .as_u64()
            .ok_or_else(|| ConfigError::Custom("'version' must be an integer".to_string()))?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let file: ConfigFileV1 = serde_yaml::from_value(raw)?;
        let mut config = Self::default();
        if let Some(cache_dir) = file.cache_dir {
            config.cache_dir = cache_dir;
        }
        if let Some(n) = file.max_parallel_tasks {
            config.max_parallel_tasks = n;
        }
        if let Some(tie_break) = file.order_tie_break {
            config.order_tie_break = tie_break;
        }
        if let Some(full) = file.regex_full_match {
            config.regex_full_match = full;
        }
        if let Some(filter) = file.log_filter {
            config.log_filter = filter;
        }
        config.validate()?;
        Ok(config)
    }

    fn read_yaml(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Apply `COHORT__*` overrides looked up through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_MAX_PARALLEL_TASKS) {
            self.max_parallel_tasks = value.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Env {
                    var: ENV_MAX_PARALLEL_TASKS.to_string(),
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(filter) = lookup(ENV_LOG_FILTER) {
            self.log_filter = filter;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=MAX_PARALLEL_TASKS).contains(&self.max_parallel_tasks) {
            return Err(ConfigError::range_with_hint(
                "max_parallel_tasks",
                self.max_parallel_tasks,
                1,
                MAX_PARALLEL_TASKS,
                "At least one task must be able to run",
            ));
        }
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::Custom(
                "log_filter must not be empty (use e.g. 'info')".to_string(),
            ));
        }
        Ok(())
    }

    /// Export the effective configuration as a complete v1 document
    pub fn to_yaml(&self) -> ConfigResult<String> {
        let file = ConfigFileV1 {
            version: 1,
            cache_dir: Some(self.cache_dir.clone()),
            max_parallel_tasks: Some(self.max_parallel_tasks),
            order_tie_break: Some(self.order_tie_break),
            regex_full_match: Some(self.regex_full_match),
            log_filter: Some(self.log_filter.clone()),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_max_parallel_tasks(mut self, n: usize) -> Self {
        self.max_parallel_tasks = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let config = CohortConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.max_parallel_tasks >= 1);
        assert!(config.regex_full_match);
        assert_eq!(config.order_tie_break, OrderTieBreak::Acquisition);
    }

    #[test]
    fn test_yaml_loading() {
        let yaml_content = r#"
version: 1
cache_dir: /var/cache/cohort
max_parallel_tasks: 8
order_tie_break: path
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = CohortConfig::from_yaml(temp_file.path()).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/cohort"));
        assert_eq!(config.max_parallel_tasks, 8);
        assert_eq!(config.order_tie_break, OrderTieBreak::Path);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = CohortConfig::default()
            .with_cache_dir("/tmp/cohort-test")
            .with_max_parallel_tasks(3);
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("max_parallel_tasks: 3"));

        let back = CohortConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_yaml_missing_version() {
        let result = CohortConfig::from_yaml_str("max_parallel_tasks: 2\n");
        assert!(matches!(result, Err(ConfigError::MissingVersion)));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let result = CohortConfig::from_yaml_str("version: 2\n");
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let result = CohortConfig::from_yaml_str("version: 1\nmax_paralel_tasks: 2\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_range_violation() {
        let result = CohortConfig::from_yaml_str("version: 1\nmax_parallel_tasks: 0\n");
        assert!(matches!(result, Err(ConfigError::Range { .. })));
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_PARALLEL_TASKS, "5"),
            (ENV_LOG_FILTER, "cohort_core=debug"),
        ]
        .into_iter()
        .collect();
        let mut config = CohortConfig::from_yaml_str("version: 1\nmax_parallel_tasks: 2\n").unwrap();
        config
            .apply_env_from(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_parallel_tasks, 5);
        assert_eq!(config.log_filter, "cohort_core=debug");
    }

    #[test]
    fn test_env_parse_failure() {
        let mut config = CohortConfig::default();
        let err = config
            .apply_env_from(|var| (var == ENV_MAX_PARALLEL_TASKS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }
}
