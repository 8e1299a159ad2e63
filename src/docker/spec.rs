//! Translation of a server's logical build into engine-level limits,
//! port bindings and the full creation descriptor. Nothing here talks
//! to the engine.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::models::BuildConfig;

/// Where a server's data directory is mounted inside its container.
pub const DATA_MOUNT_TARGET: &str = "/home/container";

pub const DNS_RESOLVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];

pub const ENV_MEMORY: &str = "SERVER_MEMORY";
pub const ENV_IP: &str = "SERVER_IP";
pub const ENV_PORT: &str = "SERVER_PORT";

const BYTES_PER_MB: i64 = 1_000_000;
const CPU_PERIOD: i64 = 100_000;

static PORT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,6}$").expect("port pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host ip/port published for one protocol. The container side uses the same port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortBinding {
    pub protocol: Protocol,
    pub host_ip: String,
    pub host_port: String,
}

impl PortBinding {
    /// Engine key for the container side of the binding, e.g. `25565/udp`.
    pub fn container_port(&self) -> String {
        format!("{}/{}", self.host_port, self.protocol)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkBindings {
    pub bindings: Vec<PortBinding>,
    pub exposed: BTreeSet<String>,
}

impl NetworkBindings {
    /// Tokens that are not 1-6 digit numbers are skipped, not rejected.
    pub fn from_ports(ports: &BTreeMap<String, Vec<String>>) -> Self {
        let mut network = NetworkBindings::default();

        for (host_ip, tokens) in ports {
            for token in tokens.iter().filter(|t| is_port_token(t)) {
                for protocol in Protocol::ALL {
                    let binding = PortBinding {
                        protocol,
                        host_ip: host_ip.clone(),
                        host_port: token.clone(),
                    };
                    network.exposed.insert(binding.container_port());
                    network.bindings.push(binding);
                }
            }
        }

        network
    }

    /// Bindings grouped by container port, the shape the engine expects.
    pub fn by_container_port(&self) -> BTreeMap<String, Vec<&PortBinding>> {
        let mut grouped: BTreeMap<String, Vec<&PortBinding>> = BTreeMap::new();
        for binding in &self.bindings {
            grouped
                .entry(binding.container_port())
                .or_default()
                .push(binding);
        }
        grouped
    }
}

pub fn is_port_token(token: &str) -> bool {
    PORT_TOKEN.is_match(token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpec {
    pub memory_bytes: i64,
    /// `-1` means unlimited swap.
    pub swap_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub io_weight: u16,
    pub oom_disabled: bool,
}

impl ResourceSpec {
    pub fn from_build(build: &BuildConfig) -> Self {
        let swap_bytes = if build.swap < 0 {
            -1
        } else if build.swap > 0 && build.memory > 0 {
            build.memory.saturating_add(build.swap).saturating_mul(BYTES_PER_MB)
        } else {
            0
        };

        let (cpu_quota, cpu_period) = if build.cpu > 0 {
            (build.cpu.saturating_mul(1000), CPU_PERIOD)
        } else {
            (-1, 0)
        };

        Self {
            memory_bytes: build.memory.saturating_mul(BYTES_PER_MB),
            swap_bytes,
            cpu_quota,
            cpu_period,
            io_weight: build.io,
            oom_disabled: build.oom_disabled.unwrap_or(false),
        }
    }
}

/// The configured environment with the derived server keys laid over it.
pub fn container_env(build: &BuildConfig) -> BTreeMap<String, String> {
    let mut env = build.env.clone();
    env.insert(ENV_MEMORY.to_string(), build.memory.to_string());
    env.insert(ENV_IP.to_string(), build.default.ip.clone());
    env.insert(ENV_PORT.to_string(), build.default.port.to_string());
    env
}

/// Everything needed to create a server container, independent of the engine API.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDescriptor {
    pub image: String,
    pub hostname: String,
    pub user: String,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    pub network: NetworkBindings,
    pub data_source: PathBuf,
    pub data_target: String,
    pub dns: Vec<String>,
}

impl ContainerDescriptor {
    pub fn new(
        hostname: impl Into<String>,
        build: &BuildConfig,
        network: NetworkBindings,
        data_path: &Path,
    ) -> Self {
        Self {
            image: build.image.clone(),
            hostname: hostname.into(),
            user: build.user.to_string(),
            env: container_env(build),
            resources: ResourceSpec::from_build(build),
            network,
            data_source: data_path.to_path_buf(),
            data_target: DATA_MOUNT_TARGET.to_string(),
            dns: DNS_RESOLVERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// `KEY=value` pairs in the form the engine takes them.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}
