use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Off,
    Starting,
    On,
    Stopping,
}

impl ServerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::On)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServerStatus::Off => "off",
            ServerStatus::Starting => "starting",
            ServerStatus::On => "on",
            ServerStatus::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// The ip/port pair a server advertises as its primary address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub ip: String,
    pub port: u16,
}

/// Logical build of a server's container. Sizes are in megabytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Host ip -> raw port tokens. Tokens are validated when the container is built.
    #[serde(default, deserialize_with = "deserialize_port_tokens")]
    pub ports: BTreeMap<String, Vec<String>>,
    pub default: Allocation,
    pub memory: i64,
    #[serde(default)]
    pub swap: i64,
    #[serde(default)]
    pub cpu: i64,
    #[serde(default = "default_io_weight")]
    pub io: u16,
    #[serde(default)]
    pub oom_disabled: Option<bool>,
    #[serde(default)]
    pub user: u32,
}

fn default_io_weight() -> u16 {
    500
}

// Ports show up as numbers or strings in hand-written files.
fn deserialize_port_tokens<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(i64),
        Text(String),
    }

    let raw = BTreeMap::<String, Vec<RawPort>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(ip, ports)| {
            let tokens = ports
                .into_iter()
                .map(|port| match port {
                    RawPort::Number(n) => n.to_string(),
                    RawPort::Text(s) => s,
                })
                .collect();
            (ip, tokens)
        })
        .collect())
}

/// What a controller needs from the server entity that owns it.
pub trait ServerHooks: Send + Sync {
    fn uuid(&self) -> Uuid;

    fn build(&self) -> BuildConfig;

    fn data_path(&self) -> PathBuf;

    /// Receives decoded console output, chunk by chunk.
    fn output(&self, chunk: &str);

    fn stream_closed(&self);

    fn status_changed(&self, status: ServerStatus);
}
