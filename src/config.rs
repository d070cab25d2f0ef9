//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    ControllerOptions, PolicyRule, RouteRules, DEFAULT_MAX_TRACKED_CLIENTS,
    DEFAULT_PURGE_PROBABILITY,
};

/// Prefix for environment variable overrides, e.g.
/// `TURNSTILE__LIMITER__MAX_TRACKED_CLIENTS=500`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Controller settings shared by every rule
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Route rules; defaults to the storefront's stock policies
    #[serde(default = "default_rules")]
    pub rules: Vec<PolicyRule>,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterSettings::default(),
            logging: LoggingConfig::default(),
            rules: default_rules(),
        }
    }
}

fn default_rules() -> Vec<PolicyRule> {
    RouteRules::default().rules
}

/// Controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Ceiling on tracked clients per controller
    #[serde(default = "default_max_tracked_clients")]
    pub max_tracked_clients: usize,

    /// Chance that a request triggers a purge sweep
    #[serde(default = "default_purge_probability")]
    pub purge_probability: f64,

    /// Background purge interval in milliseconds; 0 disables the task
    #[serde(default = "default_purge_interval")]
    pub purge_interval_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_tracked_clients: default_max_tracked_clients(),
            purge_probability: default_purge_probability(),
            purge_interval_ms: default_purge_interval(),
        }
    }
}

fn default_max_tracked_clients() -> usize {
    DEFAULT_MAX_TRACKED_CLIENTS
}

fn default_purge_probability() -> f64 {
    DEFAULT_PURGE_PROBABILITY
}

fn default_purge_interval() -> u64 {
    60_000
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` env-filter directive, e.g. `info` or `turnstile=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer defaults, an optional file and `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting and rule.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.max_tracked_clients == 0 {
            return Err(TurnstileError::Config(
                "limiter.max_tracked_clients must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.limiter.purge_probability) {
            return Err(TurnstileError::Config(format!(
                "limiter.purge_probability must be within [0, 1], got {}",
                self.limiter.purge_probability
            )));
        }
        self.route_rules().validate()
    }

    /// The configured rules.
    pub fn route_rules(&self) -> RouteRules {
        RouteRules {
            rules: self.rules.clone(),
        }
    }

    /// Controller options derived from the limiter settings.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions::default()
            .with_max_tracked_clients(self.limiter.max_tracked_clients)
            .with_purge_probability(self.limiter.purge_probability)
    }

    /// Background purge interval, `None` when disabled.
    pub fn purge_interval(&self) -> Option<Duration> {
        match self.limiter.purge_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TimeUnit;

    #[test]
    fn test_default_config() {
        let config = TurnstileConfig::default();
        assert_eq!(config.limiter.max_tracked_clients, 10_000);
        assert_eq!(config.limiter.purge_probability, 0.01);
        assert_eq!(config.purge_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.rules.len(), 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_config() {
        let yaml = r#"
limiter:
  max_tracked_clients: 500
  purge_interval_ms: 0
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.max_tracked_clients, 500);
        assert_eq!(config.limiter.purge_probability, 0.01);
        assert_eq!(config.purge_interval(), None);
        // Rules fall back to the stock set
        assert!(config.route_rules().get("orders").is_some());
    }

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
logging:
  level: debug
  json: true
rules:
  - name: api
    max_requests: 200
    unit: minute
    routes: ["/api"]
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert!(config.logging.json);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].unit, TimeUnit::Minute);

        let options = config.controller_options();
        assert_eq!(options.max_tracked_clients, 10_000);
    }

    #[test]
    fn test_reject_invalid_config() {
        let yaml = "limiter:\n  max_tracked_clients: 0\n";
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));

        let yaml = "limiter:\n  purge_probability: 2.0\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_err());

        let yaml = "rules:\n  - name: x\n    max_requests: 0\n    unit: second\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml_is_a_yaml_error() {
        let yaml = "limiter:\n  max_tracked_clients: lots\n";
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Yaml(_))
        ));
    }

    #[test]
    fn test_from_file_accepts_path() {
        let path = std::env::temp_dir().join(format!(
            "turnstile-from-file-{}.yaml",
            std::process::id()
        ));
        std::fs::write(&path, "logging:\n  json: true\n").unwrap();

        let config = TurnstileConfig::from_file(&path);
        std::fs::remove_file(&path).ok();

        assert!(config.unwrap().logging.json);
        assert!(matches!(
            TurnstileConfig::from_file("/nonexistent/turnstile.yaml"),
            Err(TurnstileError::Io(_))
        ));
    }

    #[test]
    fn test_load_layers_file() {
        let path = std::env::temp_dir().join(format!(
            "turnstile-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "limiter:\n  max_tracked_clients: 42\nrules:\n  - name: only\n    max_requests: 3\n    unit: second\n    routes: [\"/\"]\n",
        )
        .unwrap();

        let config = TurnstileConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.limiter.max_tracked_clients, 42);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.route_rules().find_rule("/x").unwrap().name, "only");
    }

    #[test]
    fn test_load_env_override() {
        std::env::set_var("TURNSTILE__LOGGING__LEVEL", "trace");
        let config = TurnstileConfig::load(None);
        std::env::remove_var("TURNSTILE__LOGGING__LEVEL");

        let config = config.unwrap();
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.rules.len(), 3);
    }
}
