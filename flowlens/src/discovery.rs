//! Finds running game servers and the port each one serves players on.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    process::Output,
};

use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    model::ServerDescriptor,
};

/// Produces the complete current server list on every call.
pub trait Discovery: Send + Sync {
    fn discover(&self) -> impl Future<Output = Result<Vec<ServerDescriptor>>> + Send;
}

/// Which container attribute becomes the server id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdSource {
    Hostname,
    Id,
    Name,
    Label(String),
    Env(String),
}

impl IdSource {
    /// Unknown selectors fall back to the hostname.
    pub fn parse(raw: &str) -> Result<Self> {
        let source = match raw {
            "hostname" => IdSource::Hostname,
            "id" => IdSource::Id,
            "name" => IdSource::Name,
            _ => {
                if let Some(key) = raw.strip_prefix("label:") {
                    IdSource::Label(non_empty_key(raw, key)?)
                } else if let Some(key) = raw.strip_prefix("env:") {
                    IdSource::Env(non_empty_key(raw, key)?)
                } else {
                    warn!(server_id_source = raw, "unknown server id source, using hostname");
                    IdSource::Hostname
                }
            }
        };
        Ok(source)
    }
}

fn non_empty_key(raw: &str, key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(Error::Config(format!("server_id_source {raw:?} has an empty key")));
    }
    Ok(key.to_string())
}

/// The subset of `docker inspect` output we read.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: ContainerConfig,
    #[serde(default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    /// `"7777/udp" -> [{HostIp, HostPort}]`; unpublished ports map to null.
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_port: String,
}

impl InspectedContainer {
    fn env_var(&self, key: &str) -> Option<&str> {
        self.config.env.as_ref()?.iter().find_map(|entry| {
            entry
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    fn display_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    fn server_id(&self, source: &IdSource) -> String {
        let id = match source {
            IdSource::Hostname => None,
            IdSource::Id => Some(self.id.as_str()),
            IdSource::Name => Some(self.display_name()),
            IdSource::Label(key) => self
                .config
                .labels
                .as_ref()
                .and_then(|labels| labels.get(key))
                .map(String::as_str),
            IdSource::Env(key) => self.env_var(key),
        };
        id.unwrap_or(self.config.hostname.as_str()).to_string()
    }

    /// `port_env_var` first, then the first published host port.
    fn game_port(&self, port_env_var: Option<&str>) -> Option<u16> {
        if let Some(var) = port_env_var {
            if let Some(port) = self.env_var(var).and_then(parse_port) {
                return Some(port);
            }
        }

        self.network_settings
            .ports
            .as_ref()?
            .values()
            .flatten()
            .flatten()
            .find_map(|binding| parse_port(&binding.host_port))
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Discovers game servers through the `docker` CLI.
pub struct DockerDiscovery {
    binary: String,
    labels: BTreeMap<String, String>,
    id_source: IdSource,
    port_env_var: Option<String>,
}

impl DockerDiscovery {
    pub fn new(
        labels: BTreeMap<String, String>,
        id_source: IdSource,
        port_env_var: Option<String>,
    ) -> Self {
        Self {
            binary: "docker".to_string(),
            labels,
            id_source,
            port_env_var,
        }
    }

    fn ps_args(&self) -> Vec<String> {
        let mut args = vec![
            "ps".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            "status=running".to_string(),
        ];
        for (key, value) in &self.labels {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }
        args
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Discovery(format!("failed to run {}: {e}", self.binary)))
    }

    fn descriptors(&self, containers: Vec<InspectedContainer>) -> Vec<ServerDescriptor> {
        let now = Utc::now();
        containers
            .into_iter()
            .filter_map(|container| {
                let server_id = container.server_id(&self.id_source);
                if server_id.is_empty() {
                    debug!(container = %container.id, "skipping container without server id");
                    return None;
                }
                let Some(port) = container.game_port(self.port_env_var.as_deref()) else {
                    debug!(container = %container.id, server_id = %server_id, "skipping container without game port");
                    return None;
                };
                Some(ServerDescriptor {
                    server_id,
                    port: i64::from(port),
                    discovered_at: now,
                    container_name: Some(container.display_name().to_string()),
                    container_id: Some(container.id),
                })
            })
            .collect()
    }
}

impl Discovery for DockerDiscovery {
    async fn discover(&self) -> Result<Vec<ServerDescriptor>> {
        let ps = self.docker(&self.ps_args()).await?;
        if !ps.status.success() {
            return Err(Error::Discovery(format!(
                "docker ps failed: {}",
                String::from_utf8_lossy(&ps.stderr).trim()
            )));
        }
        let ids: Vec<String> = String::from_utf8_lossy(&ps.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect".to_string()];
        args.extend(ids);
        let inspect = self.docker(&args).await?;
        // A container that exits between `ps` and `inspect` makes the exit
        // status non-zero while the rest are still printed.
        let containers = parse_inspect(&inspect.stdout).map_err(|e| {
            Error::Discovery(format!(
                "docker inspect failed: {e}: {}",
                String::from_utf8_lossy(&inspect.stderr).trim()
            ))
        })?;
        if !inspect.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&inspect.stderr).trim(),
                "docker inspect reported errors, using partial result"
            );
        }

        Ok(self.descriptors(containers))
    }
}

fn parse_inspect(stdout: &[u8]) -> std::result::Result<Vec<InspectedContainer>, serde_json::Error> {
    serde_json::from_slice(stdout)
}

/// Serves the fixed `servers` list from the configuration.
pub struct StaticDiscovery {
    servers: Vec<ServerDescriptor>,
}

impl StaticDiscovery {
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self { servers }
    }
}

impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<ServerDescriptor>> {
        let now = Utc::now();
        Ok(self
            .servers
            .iter()
            .cloned()
            .map(|mut desc| {
                desc.discovered_at = now;
                desc
            })
            .collect())
    }
}

/// The discovery backend selected by configuration.
pub enum ServerSource {
    Docker(DockerDiscovery),
    Static(StaticDiscovery),
}

impl ServerSource {
    pub fn from_config(config: &Config) -> Result<Self> {
        if !config.servers.is_empty() {
            return Ok(ServerSource::Static(StaticDiscovery::new(
                config.servers.clone(),
            )));
        }
        Ok(ServerSource::Docker(DockerDiscovery::new(
            config.docker_labels.clone(),
            IdSource::parse(&config.server_id_source)?,
            config.port_env_var.clone(),
        )))
    }
}

impl Discovery for ServerSource {
    async fn discover(&self) -> Result<Vec<ServerDescriptor>> {
        match self {
            ServerSource::Docker(docker) => docker.discover().await,
            ServerSource::Static(fixed) => fixed.discover().await,
        }
    }
}
