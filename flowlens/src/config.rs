//! Agent configuration.
//!
//! Loaded from YAML with per-field defaults; a missing file means "all
//! defaults". Command-line flags are applied on top by `main`.

use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use flowlens_common::{DEFAULT_ALLOW_LIST_ENTRIES, DEFAULT_FLOW_TABLE_ENTRIES};

use crate::{
    capture::{AttachOptions, MAX_TABLE_ENTRIES},
    discovery::IdSource,
    error::{Error, Result},
    estimator::EstimatorConfig,
    model::ServerDescriptor,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/flowlens/config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Interface whose ingress path is classified.
    pub interface: String,
    pub flow_table_capacity: u32,
    pub allow_list_capacity: u32,
    pub discovery_interval_secs: u64,
    pub metrics_interval_secs: u64,
    /// Activity window: a flow must have been seen this recently to count.
    pub player_activity_threshold_secs: u64,
    pub min_packets_threshold: u64,
    pub min_bytes_threshold: u64,
    /// REST listener.
    pub server_addr: SocketAddr,
    /// Shared secret for `Authorization: Bearer`.
    pub api_key: String,
    /// Prometheus scrape listener; disabled when unset.
    pub prometheus_addr: Option<SocketAddr>,
    /// Label filters a container must match to be a game server.
    pub docker_labels: BTreeMap<String, String>,
    /// `hostname`, `id`, `name`, `label:<key>` or `env:<key>`.
    pub server_id_source: String,
    /// Environment variable holding the game port, checked before published ports.
    pub port_env_var: Option<String>,
    /// Fixed server list; when non-empty Docker is not consulted.
    pub servers: Vec<ServerDescriptor>,
    /// Classifier object to load instead of the embedded one.
    pub program_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            flow_table_capacity: DEFAULT_FLOW_TABLE_ENTRIES,
            allow_list_capacity: DEFAULT_ALLOW_LIST_ENTRIES,
            discovery_interval_secs: 30,
            metrics_interval_secs: 30,
            player_activity_threshold_secs: 300,
            min_packets_threshold: 50,
            min_bytes_threshold: 1000,
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_key: String::new(),
            prometheus_addr: None,
            docker_labels: BTreeMap::new(),
            server_id_source: "hostname".to_string(),
            port_env_var: None,
            servers: Vec::new(),
            program_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reads `path`, falling back to defaults if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(Error::Config(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(yaml).map_err(|e| {
            let line = e.location().map(|l| l.line()).unwrap_or(0);
            Error::Config(format!("line {line}: {e}"))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(Error::Config("interface must not be empty".to_string()));
        }
        if self.discovery_interval_secs == 0 || self.metrics_interval_secs == 0 {
            return Err(Error::Config("intervals must be greater than zero".to_string()));
        }
        if self.player_activity_threshold_secs == 0 {
            return Err(Error::Config(
                "player_activity_threshold_secs must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("flow_table_capacity", self.flow_table_capacity),
            ("allow_list_capacity", self.allow_list_capacity),
        ] {
            if value == 0 || value > MAX_TABLE_ENTRIES {
                return Err(Error::Config(format!(
                    "{name} must be within 1..={MAX_TABLE_ENTRIES}, got {value}"
                )));
            }
        }
        if self.api_key.is_empty() {
            return Err(Error::Config(
                "api_key must be set to protect the REST API".to_string(),
            ));
        }
        IdSource::parse(&self.server_id_source)?;
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn estimator(&self) -> EstimatorConfig {
        EstimatorConfig {
            window: Duration::from_secs(self.player_activity_threshold_secs),
            min_packets: self.min_packets_threshold,
            min_bytes: self.min_bytes_threshold,
        }
    }

    pub fn attach_options(&self) -> AttachOptions {
        AttachOptions {
            iface: self.interface.clone(),
            program_path: self.program_path.clone(),
            flow_table_entries: self.flow_table_capacity,
            allow_list_entries: self.allow_list_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            api_key: "secret".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.flow_table_capacity, 100_000);
        assert_eq!(config.allow_list_capacity, 100_000);
        assert_eq!(config.discovery_interval(), Duration::from_secs(30));
        assert_eq!(config.metrics_interval(), Duration::from_secs(30));
        assert_eq!(config.estimator().window, Duration::from_secs(300));
        assert_eq!(config.estimator().min_packets, 50);
        assert_eq!(config.estimator().min_bytes, 1000);
        assert_eq!(config.server_addr.port(), 8080);
        assert!(config.prometheus_addr.is_none());
        assert_eq!(config.server_id_source, "hostname");
    }

    #[test]
    fn parse_partial_file_keeps_other_defaults() {
        let yaml = r#"
interface: ens5
api_key: hunter2
min_packets_threshold: 20
prometheus_addr: "127.0.0.1:9100"
docker_labels:
  game: "true"
servers:
  - server_id: lobby
    port: 7777
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.interface, "ens5");
        assert_eq!(config.min_packets_threshold, 20);
        assert_eq!(config.min_bytes_threshold, 1000);
        assert_eq!(config.prometheus_addr.unwrap().port(), 9100);
        assert_eq!(config.docker_labels.get("game").map(String::as_str), Some("true"));
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].port, 7777);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_error_reports_line() {
        let yaml = "interface: eth0\nmetrics_interval_secs: soon\n";
        let err = Config::parse(yaml).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("interfase: eth0\n").is_err());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::parse("\n").unwrap();
        assert_eq!(config.interface, "eth0");
    }

    #[test]
    fn missing_file_is_all_defaults() {
        let config = Config::load("/nonexistent/flowlens/config.yaml").unwrap();
        assert_eq!(config.metrics_interval_secs, 30);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(valid().validate().is_ok());

        assert!(Config::default().validate().is_err(), "empty api key");

        let mut config = valid();
        config.metrics_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.allow_list_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.flow_table_capacity = MAX_TABLE_ENTRIES + 1;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.server_id_source = "label:".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn attach_options_follow_config() {
        let mut config = valid();
        config.interface = "bond0".to_string();
        config.allow_list_capacity = 512;
        let opts = config.attach_options();
        assert_eq!(opts.iface, "bond0");
        assert_eq!(opts.allow_list_entries, 512);
        assert_eq!(opts.flow_table_entries, 100_000);
    }
}
