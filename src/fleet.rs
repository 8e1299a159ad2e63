use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{DaemonConfig, ServerEntry};
use crate::docker::{ContainerController, ContainerRuntime, ControllerSettings, ImageStore};
use crate::models::{BuildConfig, ServerHooks, ServerStatus};

const CONSOLE_BACKLOG: usize = 256;

/// A configured server as seen by its controller. Console output is logged
/// and fanned out to any subscribers.
pub struct ServerRecord {
    entry: ServerEntry,
    data_path: PathBuf,
    console: broadcast::Sender<String>,
}

impl ServerRecord {
    pub fn new(entry: ServerEntry, data_path: PathBuf) -> Self {
        let (console, _) = broadcast::channel(CONSOLE_BACKLOG);
        Self {
            entry,
            data_path,
            console,
        }
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<String> {
        self.console.subscribe()
    }
}

impl ServerHooks for ServerRecord {
    fn uuid(&self) -> Uuid {
        self.entry.uuid
    }

    fn build(&self) -> BuildConfig {
        self.entry.build.clone()
    }

    fn data_path(&self) -> PathBuf {
        self.data_path.clone()
    }

    fn output(&self, chunk: &str) {
        debug!("[{}] {}", self.entry.uuid, chunk.trim_end());
        let _ = self.console.send(chunk.to_string());
    }

    fn stream_closed(&self) {
        info!("Console stream for server {} closed", self.entry.uuid);
    }

    fn status_changed(&self, status: ServerStatus) {
        debug!("Server {} is now {}", self.entry.uuid, status);
    }
}

/// Which servers to bring up, and whether their consoles are reattached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every configured server, with running consoles reattached.
    All,
    /// A single server for one command. Its console is left free.
    OneShot(Uuid),
}

impl Scope {
    fn includes(&self, uuid: Uuid) -> bool {
        match self {
            Scope::All => true,
            Scope::OneShot(only) => *only == uuid,
        }
    }
}

pub struct ManagedServer {
    pub record: Arc<ServerRecord>,
    pub controller: ContainerController,
}

/// Every configured server that reconciled successfully, keyed by uuid.
pub struct Fleet {
    servers: HashMap<Uuid, ManagedServer>,
}

impl Fleet {
    /// Builds controllers concurrently for the servers in `scope`.
    pub async fn connect<R>(config: &DaemonConfig, client: Arc<R>, scope: Scope) -> Self
    where
        R: ContainerRuntime + ImageStore + 'static,
    {
        let settings = ControllerSettings {
            autoupdate_images: config.docker.autoupdate_images,
            reattach_console: scope == Scope::All,
        };

        let pending = config
            .servers
            .iter()
            .filter(|entry| scope.includes(entry.uuid))
            .map(|entry| {
                let record = Arc::new(ServerRecord::new(
                    entry.clone(),
                    config.server_data_path(entry.uuid),
                ));
                let runtime: Arc<dyn ContainerRuntime> = client.clone();
                let images: Arc<dyn ImageStore> = client.clone();
                async move {
                    let controller = ContainerController::new(
                        runtime,
                        images,
                        record.clone(),
                        record.entry.container_id.clone(),
                        settings,
                    )
                    .await;
                    (record, controller)
                }
            });

        let mut servers = HashMap::new();
        for (record, controller) in join_all(pending).await {
            let uuid = record.uuid();
            match controller {
                Ok(controller) => {
                    info!(
                        "Server {} is {} (console {:?})",
                        uuid,
                        controller.status(),
                        controller.session_state()
                    );
                    servers.insert(uuid, ManagedServer { record, controller });
                }
                Err(e) => error!("Failed to reconcile server {}: {}", uuid, e),
            }
        }

        Self { servers }
    }

    pub fn get(&self, uuid: Uuid) -> Option<&ManagedServer> {
        self.servers.get(&uuid)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
