//! Configuration handling for the probe.
//!
//! Settings come from a YAML file, then `DEVLINK_*` environment variables,
//! then command-line flags, each layer overriding the previous one.

use anyhow::Result;
use devlink_idle::DEFAULT_KEEP_ALIVE;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Device connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Device address, `host:port`
    pub address: String,
    /// TLS version to dial with; plain TCP when unset
    pub tls_version: Option<String>,
    /// Per-call dial, write and read timeout
    pub timeout: Duration,
    /// Idle period after which the connection is closed
    pub keep_alive: Duration,
    /// Prompts that terminate a command's output
    pub prompts: Vec<String>,
    /// Optional interactive login
    pub login: Option<LoginConfig>,
}

/// Interactive login performed right after connecting
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoginConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_user_prompt")]
    pub user_prompt: String,
    #[serde(default = "default_password_prompt")]
    pub password_prompt: String,
}

fn default_user_prompt() -> String {
    "login: ".to_string()
}

fn default_password_prompt() -> String {
    "Password: ".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:23".to_string(),
            tls_version: None,
            timeout: Duration::from_secs(5),
            keep_alive: DEFAULT_KEEP_ALIVE,
            prompts: vec!["# ".to_string(), "> ".to_string(), "$ ".to_string()],
            login: None,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    device: Option<DeviceSection>,
}

#[derive(Debug, Deserialize)]
struct DeviceSection {
    address: Option<String>,
    tls_version: Option<String>,
    timeout: Option<String>,
    keep_alive: Option<String>,
    prompts: Option<Vec<String>>,
    login: Option<LoginConfig>,
}

impl DeviceConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path.as_ref()),
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Device configuration: address={}, tls={}, timeout={:?}, keep_alive={:?}",
            config.address,
            config.tls_version.as_deref().unwrap_or("off"),
            config.timeout,
            config.keep_alive
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        let Some(device) = root_config.device else {
            return Ok(());
        };

        if let Some(address) = device.address {
            self.address = address;
        }
        if let Some(version) = device.tls_version {
            self.tls_version = Some(version);
        }
        if let Some(timeout) = device.timeout {
            self.timeout = parse_duration("device.timeout", &timeout)?;
        }
        if let Some(keep_alive) = device.keep_alive {
            self.keep_alive = parse_duration("device.keep_alive", &keep_alive)?;
        }
        if let Some(prompts) = device.prompts {
            self.prompts = prompts;
        }
        if device.login.is_some() {
            self.login = device.login;
        }

        Ok(())
    }

    /// Apply `DEVLINK_*` overrides looked up through `var`
    fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = var("DEVLINK_ADDRESS") {
            info!("Address overridden by environment: {}", address);
            self.address = address;
        }

        if let Some(version) = var("DEVLINK_TLS_VERSION") {
            info!("TLS version overridden by environment: {}", version);
            self.tls_version = Some(version);
        }

        if let Some(timeout) = var("DEVLINK_TIMEOUT") {
            self.timeout = parse_duration("DEVLINK_TIMEOUT", &timeout)?;
            info!("Timeout overridden by environment: {:?}", self.timeout);
        }

        if let Some(keep_alive) = var("DEVLINK_KEEP_ALIVE") {
            self.keep_alive = parse_duration("DEVLINK_KEEP_ALIVE", &keep_alive)?;
            info!("Keep-alive overridden by environment: {:?}", self.keep_alive);
        }

        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| anyhow::anyhow!("invalid duration for {}: {:?}: {}", key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.address, "127.0.0.1:23");
        assert_eq!(config.tls_version, None);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert!(config.login.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
device:
  address: "10.0.0.5:992"
  tls_version: "1.2"
  timeout: "2s"
  keep_alive: "1m 30s"
  prompts: ["router# "]
  login:
    username: admin
    password: secret
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = DeviceConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.address, "10.0.0.5:992");
        assert_eq!(config.tls_version.as_deref(), Some("1.2"));
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.keep_alive, Duration::from_secs(90));
        assert_eq!(config.prompts, vec!["router# ".to_string()]);

        let login = config.login.unwrap();
        assert_eq!(login.username, "admin");
        assert_eq!(login.user_prompt, "login: ");
        assert_eq!(login.password_prompt, "Password: ");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = DeviceConfig::load_from_file("/nonexistent/devlink.yaml").unwrap();
        assert_eq!(config.timeout, DeviceConfig::default().timeout);
    }

    #[test]
    fn test_unparsable_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"device: [not, a, map").unwrap();

        let config = DeviceConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.prompts, DeviceConfig::default().prompts);
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"device:\n  keep_alive: \"soon\"\n")
            .unwrap();

        let err = DeviceConfig::load_from_file(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("device.keep_alive"));
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("DEVLINK_ADDRESS", "192.0.2.1:23"),
            ("DEVLINK_TLS_VERSION", "1.2"),
            ("DEVLINK_KEEP_ALIVE", "250ms"),
        ]
        .into_iter()
        .collect();

        let mut config = DeviceConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.address, "192.0.2.1:23");
        assert_eq!(config.tls_version.as_deref(), Some("1.2"));
        assert_eq!(config.keep_alive, Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_secs(5));
    }
}
