use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::client::{ContainerRuntime, ImageStore, StartOutcome};
use super::error::Result;
use super::rebuild::{RebuildPipeline, RebuildResult};
use super::session::{SessionManager, SessionState};
use super::status::StatusCell;
use super::telemetry::{TelemetryStream, UsageSnapshot};
use super::{ContainerHandle, HandleCell};
use crate::models::{ServerHooks, ServerStatus};

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub autoupdate_images: bool,
    /// Reattach the console of a running container while reconciling.
    /// One-shot commands turn this off so the session stays free.
    pub reattach_console: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            autoupdate_images: false,
            reattach_console: true,
        }
    }
}

/// Owns one server's container: its identity, status, console session and telemetry.
pub struct ContainerController {
    runtime: Arc<dyn ContainerRuntime>,
    images: Arc<dyn ImageStore>,
    server: Arc<dyn ServerHooks>,
    settings: ControllerSettings,
    handle: HandleCell,
    status: Arc<StatusCell>,
    telemetry: Arc<TelemetryStream>,
    sessions: SessionManager,
}

impl ContainerController {
    /// Binds to `container_id` and reconciles with whatever the engine reports.
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        images: Arc<dyn ImageStore>,
        server: Arc<dyn ServerHooks>,
        container_id: impl Into<String>,
        settings: ControllerSettings,
    ) -> Result<Self> {
        let status = Arc::new(StatusCell::new(ServerStatus::Off, server.clone()));
        let telemetry = Arc::new(TelemetryStream::new());
        let sessions = SessionManager::new(
            runtime.clone(),
            server.clone(),
            status.clone(),
            telemetry.clone(),
        );

        let controller = Self {
            runtime,
            images,
            server,
            settings,
            handle: HandleCell::new(ContainerHandle::new(container_id)),
            status,
            telemetry,
            sessions,
        };

        controller.reconcile().await?;
        Ok(controller)
    }

    /// Brings the status in line with the engine. A live container is
    /// assumed to be fully up, and its console is reattached unless the
    /// settings say otherwise.
    pub async fn reconcile(&self) -> Result<()> {
        let container_id = self.container_id();
        let state = self.runtime.inspect(&container_id).await?;

        if !state.running {
            debug!(
                "Container {} for server {} is not running ({})",
                container_id,
                self.server.uuid(),
                state.status.as_deref().unwrap_or("unknown")
            );
            return Ok(());
        }

        self.status.transition(ServerStatus::On);
        if !self.settings.reattach_console || self.sessions.is_attached() {
            return Ok(());
        }

        info!("Reattaching to running container {} for server {}", container_id, self.server.uuid());
        self.sessions.attach(&container_id).await
    }

    pub fn container_id(&self) -> String {
        self.handle.current().id().to_string()
    }

    pub fn status(&self) -> ServerStatus {
        self.status.get()
    }

    pub fn session_state(&self) -> SessionState {
        self.sessions.state()
    }

    pub fn usage(&self) -> Option<UsageSnapshot> {
        self.telemetry.snapshot()
    }

    pub fn subscribe_usage(&self) -> watch::Receiver<Option<UsageSnapshot>> {
        self.telemetry.subscribe()
    }

    pub async fn attach(&self) -> Result<()> {
        self.sessions.attach(&self.container_id()).await
    }

    pub async fn exec(&self, command: Vec<String>) -> Result<()> {
        self.sessions.exec(&self.container_id(), command).await
    }

    pub async fn write(&self, data: &str) -> Result<()> {
        self.sessions.write(data).await
    }

    pub async fn stats(&self) -> Result<()> {
        self.sessions.stats(&self.container_id()).await
    }

    pub async fn start(&self) -> Result<()> {
        match self.runtime.start(&self.container_id()).await? {
            StartOutcome::Started => self.status.transition(ServerStatus::Starting),
            StartOutcome::AlreadyRunning => self.status.transition(ServerStatus::On),
        }
        Ok(())
    }

    /// Marks the server STOPPING before asking the engine, since the console
    /// closing on exit moves it to OFF before the stop call returns.
    pub async fn stop(&self) -> Result<()> {
        let previous = self.status.get();
        self.status.transition(ServerStatus::Stopping);

        if let Err(e) = self.runtime.stop(&self.container_id()).await {
            self.status.transition(previous);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn kill(&self) -> Result<()> {
        self.runtime.kill(&self.container_id()).await?;
        self.status.transition(ServerStatus::Off);
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.runtime.pause(&self.container_id()).await?;
        Ok(())
    }

    pub async fn unpause(&self) -> Result<()> {
        self.runtime.unpause(&self.container_id()).await?;
        Ok(())
    }

    /// Replaces the container with one built from the server's current build.
    /// On success the new container is current even if the old one could not be removed.
    pub async fn rebuild(&self) -> Result<RebuildResult> {
        RebuildPipeline::new(
            self.runtime.as_ref(),
            self.images.as_ref(),
            self.settings.autoupdate_images,
        )
        .run(&self.handle, self.server.as_ref())
        .await
    }
}
