/// Core model shared by the search engine and the failover policies
pub mod blacklist;

pub use blacklist::Blacklist;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Role a host declares (or is discovered) to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Primary,
    Replica,
    #[default]
    Unset,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Primary => write!(f, "primary"),
            HostRole::Replica => write!(f, "replica"),
            HostRole::Unset => write!(f, "unset"),
        }
    }
}

/// High-availability mode of a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaMode {
    /// Single writer; any host may take over the primary role
    MasterOnly,
    /// Read/write splitting with declared primary and replica hosts
    Replication,
    /// Read/write splitting with roles discovered live on each connection
    Aurora,
}

impl HaMode {
    /// Whether this mode keeps a separate replica connection
    pub fn has_replicas(&self) -> bool {
        !matches!(self, HaMode::MasterOnly)
    }

    /// Whether roles must be probed on the server instead of trusted from the topology
    pub fn discovers_roles(&self) -> bool {
        matches!(self, HaMode::Aurora)
    }

    pub fn name(&self) -> &'static str {
        match self {
            HaMode::MasterOnly => "master-only",
            HaMode::Replication => "replication",
            HaMode::Aurora => "aurora",
        }
    }
}

impl fmt::Display for HaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A candidate database host. Equality and hashing ignore the role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub role: HostRole,
}

impl HostAddress {
    pub fn new<S: Into<String>>(host: S, port: u16, role: HostRole) -> Self {
        Self {
            host: host.into(),
            port,
            role,
        }
    }

    pub fn primary<S: Into<String>>(host: S, port: u16) -> Self {
        Self::new(host, port, HostRole::Primary)
    }

    pub fn replica<S: Into<String>>(host: S, port: u16) -> Self {
        Self::new(host, port, HostRole::Replica)
    }

    /// Whether the declared role allows this host to act as primary
    pub fn may_be_primary(&self) -> bool {
        !matches!(self.role, HostRole::Replica)
    }

    /// Whether the declared role allows this host to act as replica
    pub fn may_be_replica(&self) -> bool {
        !matches!(self.role, HostRole::Primary)
    }
}

impl PartialEq for HostAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for HostAddress {}

impl Hash for HostAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered candidate hosts of one logical session
#[derive(Debug, Clone)]
pub struct Topology {
    mode: HaMode,
    hosts: Vec<HostAddress>,
}

impl Topology {
    /// Build a topology, normalizing declared roles for the mode.
    ///
    /// Aurora clears every role; the other modes treat an unset role as primary.
    pub fn new(mode: HaMode, hosts: Vec<HostAddress>) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|mut address| {
                address.role = match (mode, address.role) {
                    (HaMode::Aurora, _) => HostRole::Unset,
                    (_, HostRole::Unset) => HostRole::Primary,
                    (_, role) => role,
                };
                address
            })
            .collect();

        Self { mode, hosts }
    }

    pub fn mode(&self) -> HaMode {
        self.mode
    }

    pub fn hosts(&self) -> &[HostAddress] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Whether the topology points at one host only
    pub fn is_single_host(&self) -> bool {
        self.hosts.len() == 1
    }
}
