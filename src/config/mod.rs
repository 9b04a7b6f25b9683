/// Configuration management for relevo
use crate::core::{HaMode, HostAddress, Topology};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main relevo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Candidate hosts and HA mode
    pub topology: TopologyConfig,
    /// Failover tunables
    #[serde(default)]
    pub failover: FailoverOptions,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Topology configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// HA mode (master-only, replication, aurora)
    pub mode: HaMode,
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Candidate hosts, in probe order
    pub hosts: Vec<HostAddress>,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Failover tunables of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverOptions {
    /// Reconnect synchronously and replay the failed operation
    pub auto_reconnect: bool,
    /// Pause before retrying a single-host master-only topology, in seconds
    pub initial_timeout_sec: u64,
    /// Reconnection budget of the master-only policy
    pub max_reconnects: u32,
    /// Seconds on a fallback connection before retrying the primary
    pub seconds_before_retry_master: u64,
    /// Queries on a fallback connection before retrying the primary
    pub queries_before_retry_master: u32,
    /// Reconnection budget of the primary/replica policy
    pub retries_all_down: u32,
    /// Idle seconds before the ping loop checks the primary; 0 disables it
    pub valid_connection_timeout_sec: u64,
    /// Seconds a failed host stays blacklisted
    pub blacklist_timeout_sec: u64,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            initial_timeout_sec: 2,
            max_reconnects: 3,
            seconds_before_retry_master: 50,
            queries_before_retry_master: 30,
            retries_all_down: 120,
            valid_connection_timeout_sec: 120,
            blacklist_timeout_sec: 60,
        }
    }
}

impl FailoverOptions {
    /// Parse driver-style connection properties, starting from the defaults.
    ///
    /// Unknown keys are ignored.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Some(value) = properties.get("autoReconnect") {
            options.auto_reconnect = value.trim().eq_ignore_ascii_case("true");
        }
        parse_property(properties, "initialTimeout", &mut options.initial_timeout_sec)?;
        parse_property(properties, "maxReconnects", &mut options.max_reconnects)?;
        parse_property(
            properties,
            "queriesBeforeRetryMaster",
            &mut options.queries_before_retry_master,
        )?;
        parse_property(
            properties,
            "secondsBeforeRetryMaster",
            &mut options.seconds_before_retry_master,
        )?;
        parse_property(properties, "retriesAllDown", &mut options.retries_all_down)?;
        parse_property(
            properties,
            "validConnectionTimeout",
            &mut options.valid_connection_timeout_sec,
        )?;
        parse_property(
            properties,
            "loadBalanceBlacklistTimeout",
            &mut options.blacklist_timeout_sec,
        )?;

        Ok(options)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_timeout_sec)
    }

    pub fn blacklist_timeout(&self) -> Duration {
        Duration::from_secs(self.blacklist_timeout_sec)
    }

    /// Idle delay of the ping loop, `None` when disabled
    pub fn valid_connection_timeout(&self) -> Option<Duration> {
        match self.valid_connection_timeout_sec {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_reconnects == 0 {
            return Err(ConfigError::ValidationError(
                "max_reconnects must be greater than 0".to_string(),
            ));
        }

        if self.retries_all_down == 0 {
            return Err(ConfigError::ValidationError(
                "retries_all_down must be greater than 0".to_string(),
            ));
        }

        if self.blacklist_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "blacklist_timeout_sec must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_property<T: FromStr>(
    properties: &HashMap<String, String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = properties.get(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::ParseError(format!("Invalid value for {}: {}", key, value)))?;
    }
    Ok(())
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: TopologyConfig {
                mode: HaMode::Replication,
                connect_timeout_ms: default_connect_timeout_ms(),
                hosts: vec![
                    HostAddress::primary("127.0.0.1", 3306),
                    HostAddress::replica("127.0.0.1", 3307),
                ],
            },
            failover: FailoverOptions::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.hosts.is_empty() {
            return Err(ConfigError::ValidationError(
                "topology hosts cannot be empty".to_string(),
            ));
        }

        for host in &self.topology.hosts {
            if host.host.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "host name cannot be empty".to_string(),
                ));
            }
            if host.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid port for host {}",
                    host.host
                )));
            }
        }

        if self.topology.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.topology.mode == HaMode::Replication
            && !self.topology().hosts().iter().any(|h| h.may_be_primary())
        {
            return Err(ConfigError::ValidationError(
                "replication topology needs at least one host able to act as primary".to_string(),
            ));
        }

        self.failover.validate()?;

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Topology with roles normalized for the configured mode
    pub fn topology(&self) -> Topology {
        Topology::new(self.topology.mode, self.topology.hosts.clone())
    }

    pub fn failover_options(&self) -> FailoverOptions {
        self.failover.clone()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.topology.connect_timeout_ms)
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let topology = match mode {
            "master-only" => TopologyConfig {
                mode: HaMode::MasterOnly,
                connect_timeout_ms: default_connect_timeout_ms(),
                hosts: vec![
                    HostAddress::primary("10.0.1.10", 3306),
                    HostAddress::primary("10.0.1.11", 3306),
                    HostAddress::primary("10.0.1.12", 3306),
                ],
            },
            "replication" => TopologyConfig {
                mode: HaMode::Replication,
                connect_timeout_ms: default_connect_timeout_ms(),
                hosts: vec![
                    HostAddress::primary("10.0.1.20", 3306),
                    HostAddress::replica("10.0.1.21", 3306),
                    HostAddress::replica("10.0.1.22", 3306),
                ],
            },
            "aurora" => TopologyConfig {
                mode: HaMode::Aurora,
                connect_timeout_ms: default_connect_timeout_ms(),
                hosts: vec![
                    HostAddress::new("cluster-a.example.com", 3306, Default::default()),
                    HostAddress::new("cluster-b.example.com", 3306, Default::default()),
                ],
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'master-only', 'replication' or 'aurora'".to_string(),
                ))
            }
        };

        let config = Config {
            topology,
            ..Default::default()
        };
        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HostRole;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.failover_options(), FailoverOptions::default());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.failover.max_reconnects = 0;
        assert!(config.validate().is_err());
        config.failover.max_reconnects = 3;

        config.topology.hosts[1].port = 0;
        assert!(config.validate().is_err());
        config.topology.hosts[1].port = 3307;

        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
        config.logging.format = "json".to_string();
        assert!(config.validate().is_ok());

        config.topology.hosts.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replication_needs_primary_capable_host() {
        let mut config = Config::default();
        config.topology.hosts = vec![
            HostAddress::replica("10.0.0.1", 3306),
            HostAddress::replica("10.0.0.2", 3306),
        ];
        assert!(config.validate().is_err());

        config.topology.mode = HaMode::Aurora;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
        assert_eq!(parsed_config.topology.hosts, config.topology.hosts);
    }

    #[test]
    fn test_partial_failover_section_uses_defaults() {
        let content = r#"
            [topology]
            mode = "master-only"
            hosts = [{ host = "db1", port = 3306 }]

            [failover]
            auto_reconnect = true

            [logging]
            level = "debug"
            format = "text"
        "#;

        let config: Config = toml::from_str(content).unwrap();
        assert!(config.failover.auto_reconnect);
        assert_eq!(config.failover.retries_all_down, 120);
        assert_eq!(config.topology.connect_timeout_ms, 5000);
        assert_eq!(config.topology().hosts()[0].role, HostRole::Primary);
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());
    }

    #[test]
    fn test_example_configs() {
        for mode in ["master-only", "replication", "aurora"] {
            let temp_file = NamedTempFile::new().unwrap();
            Config::create_example_config(temp_file.path(), mode).unwrap();
            let loaded = Config::load_from_file(temp_file.path()).unwrap();
            assert_eq!(loaded.topology.mode.name(), mode);
        }

        let temp_file = NamedTempFile::new().unwrap();
        assert!(Config::create_example_config(temp_file.path(), "galera").is_err());
    }

    #[test]
    fn test_dev_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/dev.toml");
        let config = Config::load_from_file(path).unwrap();

        assert_eq!(config.topology.mode, HaMode::Replication);
        assert_eq!(config.topology.hosts.len(), 3);
        assert_eq!(config.topology().hosts()[1].role, HostRole::Replica);
        // Unlisted tunables keep their defaults
        assert_eq!(config.failover.max_reconnects, 3);
        assert_eq!(config.connect_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn test_failover_options_from_properties() {
        let properties: HashMap<String, String> = [
            ("autoReconnect", "true"),
            ("maxReconnects", "5"),
            ("queriesBeforeRetryMaster", "10"),
            ("secondsBeforeRetryMaster", "9999"),
            ("validConnectionTimeout", "0"),
            ("loadBalanceBlacklistTimeout", "30"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let options = FailoverOptions::from_properties(&properties).unwrap();
        assert!(options.auto_reconnect);
        assert_eq!(options.max_reconnects, 5);
        assert_eq!(options.queries_before_retry_master, 10);
        assert_eq!(options.seconds_before_retry_master, 9999);
        assert_eq!(options.valid_connection_timeout(), None);
        assert_eq!(options.blacklist_timeout(), Duration::from_secs(30));
        assert_eq!(options.retries_all_down, 120);
    }

    #[test]
    fn test_failover_options_reject_bad_numbers() {
        let mut properties = HashMap::new();
        properties.insert("retriesAllDown".to_string(), "many".to_string());

        let err = FailoverOptions::from_properties(&properties).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
