//! Configuration handling for the soak driver.
//!
//! Settings come from the shared YAML config file (the `services.plctag`
//! section), then `PLCTAG_*` environment variables, then command line flags.

use anyhow::{bail, Result};
use plctag_session::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Soak run configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoakConfig {
    /// Gateway label of the session under test
    pub gateway: String,
    /// Routing path behind the gateway
    pub path: Option<String>,
    /// Number of producer threads creating and attaching requests
    pub producers: usize,
    /// Requests each producer creates
    pub requests_per_producer: usize,
    /// The reaper keeps every n-th request attached (0 keeps none)
    pub keep_every: usize,
    /// Pause between walks of the pending list
    pub walk_interval: Duration,
    /// Request registry settings
    pub registry: RegistrySettings,
}

/// Registry section of the configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Upper bound on live requests
    pub max_requests: Option<usize>,
    /// Escalate detaching a request from the wrong session
    pub strict_detach: bool,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            gateway: "127.0.0.1:44818".to_string(),
            path: Some("1,0".to_string()),
            producers: 4,
            requests_per_producer: 100,
            keep_every: 10,
            walk_interval: Duration::from_millis(1),
            registry: RegistrySettings::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    plctag: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl SoakConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                }
            },
            Err(_) => {
                warn!(
                    "Config file {:?} not found, using defaults",
                    config_path.as_ref()
                );
            }
        }

        config.apply_overrides_from(|key| std::env::var(key).ok());

        info!(
            "Final soak configuration: producers={}, requests_per_producer={}, keep_every={}, max_requests={:?}, strict_detach={}",
            config.producers,
            config.requests_per_producer,
            config.keep_every,
            config.registry.max_requests,
            config.registry.strict_detach
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(service) = root_config.services.and_then(|s| s.plctag) {
            self.apply_service_config(service);
        }
    }

    fn apply_service_config(&mut self, service_config: ServiceConfig) {
        for arg in service_config.args.unwrap_or_default() {
            if let Some(gateway) = arg.strip_prefix("--gateway=") {
                self.gateway = gateway.to_string();
            } else if let Some(path) = arg.strip_prefix("--path=") {
                self.path = Some(path.to_string());
            }
        }

        for (key, value) in service_config.config.unwrap_or_default() {
            match key.as_str() {
                "services.plctag.producers" => {
                    if let Ok(n) = value.parse() {
                        self.producers = n;
                    }
                }
                "services.plctag.requests_per_producer" => {
                    if let Ok(n) = value.parse() {
                        self.requests_per_producer = n;
                    }
                }
                "services.plctag.keep_every" => {
                    if let Ok(n) = value.parse() {
                        self.keep_every = n;
                    }
                }
                "services.plctag.walk_interval" => {
                    if let Ok(d) = humantime::parse_duration(&value) {
                        self.walk_interval = d;
                    }
                }
                "services.plctag.registry.max_requests" => {
                    if let Ok(n) = value.parse() {
                        self.registry.max_requests = Some(n);
                    }
                }
                "services.plctag.registry.strict_detach" => {
                    self.registry.strict_detach = value.eq_ignore_ascii_case("true");
                }
                _ => {
                    // Ignore unknown configuration keys
                }
            }
        }
    }

    /// Apply `PLCTAG_*` overrides looked up through `var`
    fn apply_overrides_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = var("PLCTAG_PRODUCERS").and_then(|v| v.parse().ok()) {
            self.producers = n;
            info!("Producers overridden by environment: {}", n);
        }

        if let Some(n) = var("PLCTAG_REQUESTS_PER_PRODUCER").and_then(|v| v.parse().ok()) {
            self.requests_per_producer = n;
            info!("Requests per producer overridden by environment: {}", n);
        }

        if let Some(n) = var("PLCTAG_MAX_REQUESTS").and_then(|v| v.parse().ok()) {
            self.registry.max_requests = Some(n);
            info!("Request pool bound overridden by environment: {}", n);
        }

        if let Some(v) = var("PLCTAG_STRICT_DETACH") {
            self.registry.strict_detach = v.eq_ignore_ascii_case("true");
            info!(
                "Strict detach overridden by environment: {}",
                self.registry.strict_detach
            );
        }
    }

    /// Total requests the producers will create
    pub fn total_requests(&self) -> usize {
        self.producers * self.requests_per_producer
    }

    /// Requests the reaper leaves attached
    pub fn expected_kept(&self) -> usize {
        match self.keep_every {
            0 => 0,
            n => self.total_requests() / n,
        }
    }

    /// Reject settings that cannot finish
    pub fn validate(&self) -> Result<()> {
        if self.producers == 0 {
            bail!("at least one producer is required");
        }
        if self.walk_interval.is_zero() {
            bail!("walk_interval must be non-zero");
        }
        if let Some(limit) = self.registry.max_requests {
            if limit <= self.expected_kept() {
                bail!(
                    "max_requests={} leaves no room beside {} kept requests",
                    limit,
                    self.expected_kept()
                );
            }
        }
        Ok(())
    }

    /// Registry configuration for this run
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_requests: self.registry.max_requests,
            strict_detach: self.registry.strict_detach,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SoakConfig::default();
        assert_eq!(config.producers, 4);
        assert_eq!(config.requests_per_producer, 100);
        assert_eq!(config.expected_kept(), 40);
        assert!(config.validate().is_ok());
        assert_eq!(config.registry_config().max_requests, None);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  plctag:
    args:
      - --gateway=10.1.2.3:44818
      - --path=1,2
    config:
      services.plctag.producers: "8"
      services.plctag.keep_every: "0"
      services.plctag.walk_interval: "5ms"
      services.plctag.registry.max_requests: "64"
      services.plctag.registry.strict_detach: "true"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = SoakConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.gateway, "10.1.2.3:44818");
        assert_eq!(config.path.as_deref(), Some("1,2"));
        assert_eq!(config.producers, 8);
        assert_eq!(config.keep_every, 0);
        assert_eq!(config.walk_interval, Duration::from_millis(5));
        assert_eq!(config.registry.max_requests, Some(64));
        assert!(config.registry.strict_detach);
        assert_eq!(config.expected_kept(), 0);
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"services: [not, a, map").unwrap();

        let config = SoakConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.gateway, SoakConfig::default().gateway);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("PLCTAG_PRODUCERS", "2"),
            ("PLCTAG_MAX_REQUESTS", "32"),
            ("PLCTAG_STRICT_DETACH", "TRUE"),
            ("PLCTAG_REQUESTS_PER_PRODUCER", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = SoakConfig::default();
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.producers, 2);
        assert_eq!(config.requests_per_producer, 100);
        assert_eq!(config.registry.max_requests, Some(32));
        assert!(config.registry.strict_detach);
    }

    #[test]
    fn test_validate_rejects_pool_smaller_than_kept() {
        let mut config = SoakConfig::default();
        config.registry.max_requests = Some(config.expected_kept());
        assert!(config.validate().is_err());

        config.registry.max_requests = Some(config.expected_kept() + 1);
        assert!(config.validate().is_ok());
    }
}
