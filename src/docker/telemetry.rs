use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::client::{ContainerRuntime, OutputStream};

/// Fragments beyond this size are assumed to never complete.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default)]
    pub read: Option<String>,
    #[serde(default)]
    pub memory_stats: MemoryUsage,
    #[serde(default)]
    pub cpu_stats: CpuUsage,
    #[serde(default)]
    pub precpu_stats: CpuUsage,
    #[serde(default)]
    pub networks: Option<BTreeMap<String, NetworkUsage>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    #[serde(default)]
    pub usage: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub cpu_usage: CpuTotals,
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    #[serde(default)]
    pub online_cpus: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuTotals {
    #[serde(default)]
    pub total_usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkUsage {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

impl UsageSnapshot {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_stats.usage.unwrap_or(0)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_stats.limit.unwrap_or(0)
    }

    /// CPU usage since the previous sample, where 100.0 is one full core.
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(self.precpu_stats.cpu_usage.total_usage);
        let system_delta = self
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(self.precpu_stats.system_cpu_usage.unwrap_or(0));

        if cpu_delta == 0 || system_delta == 0 {
            return 0.0;
        }

        let cpus = self.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        (cpu_delta as f64 / system_delta as f64) * cpus * 100.0
    }

    /// Received and transmitted bytes summed over all interfaces.
    pub fn network_totals(&self) -> (u64, u64) {
        self.networks
            .iter()
            .flat_map(|networks| networks.values())
            .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
    }
}

/// Reassembles usage documents that the feed may split across chunks.
#[derive(Debug, Default)]
pub struct TelemetryDecoder {
    pending: Vec<u8>,
}

impl TelemetryDecoder {
    /// Feeds one chunk and returns the newest document it completed, if any.
    pub fn push(&mut self, chunk: &[u8]) -> Option<UsageSnapshot> {
        self.pending.extend_from_slice(chunk);

        let mut latest = None;
        let consumed = {
            let mut documents =
                serde_json::Deserializer::from_slice(&self.pending).into_iter::<UsageSnapshot>();
            loop {
                match documents.next() {
                    Some(Ok(snapshot)) => latest = Some(snapshot),
                    Some(Err(e)) if e.is_eof() => break documents.byte_offset(),
                    Some(Err(e)) => {
                        trace!("Dropping undecodable telemetry payload: {}", e);
                        break self.pending.len();
                    }
                    None => break self.pending.len(),
                }
            }
        };

        self.pending.drain(..consumed);
        if self.pending.len() > MAX_PENDING_BYTES {
            trace!("Discarding {} bytes of unterminated telemetry", self.pending.len());
            self.pending.clear();
        }

        latest
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Holds the latest usage sample for one container and the task feeding it.
pub struct TelemetryStream {
    snapshot: Arc<watch::Sender<Option<UsageSnapshot>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryStream {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            snapshot: Arc::new(tx),
            task: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Option<UsageSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<UsageSnapshot>> {
        self.snapshot.subscribe()
    }

    /// Opens the usage feed for `container_id`, replacing any feed already running.
    pub async fn start(&self, runtime: &dyn ContainerRuntime, container_id: &str) -> anyhow::Result<()> {
        let feed = runtime.stats(container_id).await?;
        let handle = tokio::spawn(Self::consume(
            feed,
            self.snapshot.clone(),
            container_id.to_string(),
        ));

        let previous = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        debug!("Telemetry started for container {}", container_id);
        Ok(())
    }

    async fn consume(
        mut feed: OutputStream,
        snapshot: Arc<watch::Sender<Option<UsageSnapshot>>>,
        container_id: String,
    ) {
        let mut decoder = TelemetryDecoder::default();

        while let Some(chunk) = feed.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Some(sample) = decoder.push(&bytes) {
                        snapshot.send_replace(Some(sample));
                    }
                }
                Err(e) => {
                    debug!("Telemetry feed for {} failed: {:#}", container_id, e);
                    break;
                }
            }
        }

        debug!("Telemetry feed for {} ended", container_id);
        snapshot.send_replace(None);
    }
}

impl Default for TelemetryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TelemetryStream {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
