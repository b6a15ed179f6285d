//! Layered configuration for heapscope
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. An optional TOML file (`--config`)
//! 3. Environment variables such as `HEAPSCOPE__SAMPLER__PERIOD_SECS=10`

use crate::api::ApiServerConfig;
use crate::error::{HeapscopeError, Result};
use crate::trace::TraceOptions;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "HEAPSCOPE";

/// Census sampler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Seconds between census ticks
    pub period_secs: u64,
    /// Samples kept per type
    pub max_history: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            period_secs: 5,
            max_history: 300,
        }
    }
}

impl SamplerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Tracer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub max_depth: Option<usize>,
    pub max_results: Option<usize>,
    /// Result bound of the tree view
    pub tree_max_results: usize,
    pub ignore_modules: bool,
    pub repr_limit: usize,
    pub attribute_repr_limit: usize,
    /// Objects whose type name or frame origin starts with one of these are never reported
    pub self_type_prefixes: Vec<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        let options = TraceOptions::default();
        Self {
            max_depth: options.max_depth,
            max_results: options.max_results,
            tree_max_results: 1000,
            ignore_modules: options.ignore_modules,
            repr_limit: options.repr_limit,
            attribute_repr_limit: 250,
            self_type_prefixes: options.self_prefixes,
        }
    }
}

impl TraceConfig {
    /// Traversal options for a tracer walk
    pub fn options(&self) -> TraceOptions {
        TraceOptions {
            max_depth: self.max_depth,
            max_results: self.max_results,
            ignore_modules: self.ignore_modules,
            self_prefixes: self.self_type_prefixes.clone(),
            repr_limit: self.repr_limit,
        }
    }
}

/// Complete heapscope configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapscopeConfig {
    pub sampler: SamplerConfig,
    pub trace: TraceConfig,
    pub api: ApiServerConfig,
}

impl HeapscopeConfig {
    /// Load from defaults, `path` if given, and `HEAPSCOPE__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, ENV_PREFIX)
    }

    /// Load with a custom environment prefix
    pub fn load_from(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: HeapscopeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            period_secs = config.sampler.period_secs,
            max_history = config.sampler.max_history,
            addr = %config.api.addr,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Reject settings the sampler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sampler.period_secs < 1 {
            return Err(HeapscopeError::InvalidConfig(
                "sampler.period_secs must be at least 1".to_string(),
            ));
        }
        if self.sampler.max_history < 1 {
            return Err(HeapscopeError::InvalidConfig(
                "sampler.max_history must be at least 1".to_string(),
            ));
        }
        if self.api.event_capacity < 1 {
            return Err(HeapscopeError::InvalidConfig(
                "api.event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HeapscopeConfig::default();
        assert_eq!(config.sampler.period(), Duration::from_secs(5));
        assert_eq!(config.sampler.max_history, 300);
        assert_eq!(config.trace.tree_max_results, 1000);
        assert_eq!(config.trace.attribute_repr_limit, 250);
        assert_eq!(config.trace.self_type_prefixes, vec!["heapscope".to_string()]);
        assert!(config.trace.max_results.is_none());
        assert_eq!(config.api.addr.to_string(), "127.0.0.1:8088");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_period() {
        let mut config = HeapscopeConfig::default();
        config.sampler.period_secs = 0;
        assert!(matches!(config.validate(), Err(HeapscopeError::InvalidConfig(_))));

        let mut config = HeapscopeConfig::default();
        config.sampler.max_history = 0;
        assert!(matches!(config.validate(), Err(HeapscopeError::InvalidConfig(_))));
    }

    #[test]
    fn test_trace_options_follow_config() {
        let mut trace = TraceConfig::default();
        trace.max_depth = Some(4);
        trace.ignore_modules = false;
        let options = trace.options();
        assert_eq!(options.max_depth, Some(4));
        assert!(!options.ignore_modules);
        assert_eq!(options.repr_limit, 100);
    }

    #[test]
    fn test_load_without_sources_uses_defaults() {
        let config = HeapscopeConfig::load_from(None, "HEAPSCOPE_UNIT_UNSET").unwrap();
        assert_eq!(config, HeapscopeConfig::default());
    }
}
