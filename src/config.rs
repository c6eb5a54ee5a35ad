//! Configuration file handling.
//!
//! The server reads a single TOML file; durations are humantime strings
//! ("10s", "1m30s"). Every section beyond the HTTP transport has defaults
//! so a minimal file only names an address, a port and a database path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub transport: Transport,
    pub database: Database,
    #[serde(default)]
    pub supervisor: Supervisor,
    #[serde(default)]
    pub node: NodeDefaults,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Transport {
    pub http: Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Http {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Database {
    /// Location of the SQLite database file.
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default, with = "humantime_serde::option")]
    pub idle_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde::option")]
    pub connection_lifetime: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Supervisor {
    /// Tick period between probe cycles.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum in-flight probes per cycle.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Consecutive failures before a node is deactivated.
    #[serde(default = "default_max_failures")]
    pub max_failures: i64,

    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            concurrency: default_concurrency(),
            max_failures: default_max_failures(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDefaults {
    /// Time-to-live assigned to newly registered nodes.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Duration,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read the config file '{}'", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse the config file '{}'", path.display()))
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_concurrency() -> usize {
    4
}

fn default_max_failures() -> i64 {
    3
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}
