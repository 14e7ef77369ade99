use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::chunker::ShardKey;
use crate::error::ConfigError;

pub const DEFAULT_COORDINATOR_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_STORAGE_NODE_ADDRS: [&str; 4] = [
    "127.0.0.1:8001",
    "127.0.0.1:8002",
    "127.0.0.1:8003",
    "127.0.0.1:8004",
];

const GIG: u64 = 1024 * 1024 * 1024;

/// The ordered storage node endpoints. Shard `n` lives on the `n`th endpoint,
/// so the number of endpoints is the number of shards per file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    endpoints: Vec<String>,
}

impl Topology {
    pub fn new(endpoints: Vec<String>) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::EmptyTopology);
        }
        for endpoint in &endpoints {
            let valid = endpoint
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
            }
        }
        Ok(Self { endpoints })
    }

    pub fn shard_count(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.endpoints.len()).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn endpoint(&self, shard: ShardKey) -> Option<&str> {
        self.endpoints.get(shard.index()).map(String::as_str)
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_STORAGE_NODE_ADDRS.map(String::from).into(),
        }
    }
}

/// A comma separated list of `host:port` endpoints.
impl FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let endpoints = s
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(String::from)
            .collect();
        Self::new(endpoints)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Establishing an outbound connection.
    pub connect: Duration,
    /// One complete outbound exchange, request and reply.
    pub io: Duration,
    /// One complete inbound connection.
    pub connection: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            io: Duration::from_secs(60),
            connection: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest payload accepted in a single store request or fetch reply.
    pub max_payload: u64,
    /// Connections served at the same time, the rest wait in the backlog.
    pub max_connections: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload: GIG,
            max_connections: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen: String,
    pub topology: Topology,
    pub timeouts: Timeouts,
    pub limits: Limits,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_COORDINATOR_ADDR.into(),
            topology: Topology::default(),
            timeouts: Timeouts::default(),
            limits: Limits::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Disk(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageNodeConfig {
    pub listen: String,
    pub storage: StorageBackend,
    pub timeouts: Timeouts,
    pub limits: Limits,
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_STORAGE_NODE_ADDRS[0].into(),
            storage: StorageBackend::Disk(PathBuf::from("data")),
            timeouts: Timeouts::default(),
            limits: Limits {
                max_payload: u64::MAX,
                ..Limits::default()
            },
        }
    }
}
