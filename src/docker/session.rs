use anyhow::Context;
use futures::StreamExt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{ContainerRuntime, InputSink, OutputStream};
use super::error::{ContainerError, Result};
use super::status::StatusCell;
use super::telemetry::TelemetryStream;
use crate::models::{ServerHooks, ServerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Attaching = 1,
    Attached = 2,
    Exec = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Attaching,
            2 => SessionState::Attached,
            3 => SessionState::Exec,
            _ => SessionState::Idle,
        }
    }
}

#[derive(Debug)]
struct SessionSlot(AtomicU8);

impl SessionSlot {
    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn claim(&self, to: SessionState) -> bool {
        self.0
            .compare_exchange(
                SessionState::Idle as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Returns the slot to idle when dropped, unless disarmed.
struct SessionGuard {
    slot: Arc<SessionSlot>,
    on_release: Option<Arc<dyn ServerHooks>>,
    armed: bool,
}

impl SessionGuard {
    fn claim(
        slot: &Arc<SessionSlot>,
        to: SessionState,
        on_release: Option<Arc<dyn ServerHooks>>,
    ) -> Result<Self> {
        if !slot.claim(to) {
            return Err(ContainerError::SessionBusy);
        }
        Ok(Self {
            slot: slot.clone(),
            on_release,
            armed: true,
        })
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.slot.set(SessionState::Idle);
        if let Some(server) = &self.on_release {
            server.stream_closed();
        }
    }
}

/// Decodes output to text without splitting a multi-byte character across chunks.
#[derive(Debug, Default)]
pub(crate) struct Utf8Chunker {
    carry: Vec<u8>,
}

impl Utf8Chunker {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);

        match std::str::from_utf8(&self.carry) {
            Ok(text) => {
                let text = text.to_string();
                self.carry.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.carry[..valid]).into_owned();
                self.carry.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.carry).into_owned();
                self.carry.clear();
                text
            }
        }
    }
}

async fn forward_output(mut output: OutputStream, server: &dyn ServerHooks) {
    let mut chunker = Utf8Chunker::default();

    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(bytes) => {
                let text = chunker.decode(&bytes);
                if !text.is_empty() {
                    server.output(&text);
                }
            }
            Err(e) => {
                warn!("Console stream for server {} failed: {:#}", server.uuid(), e);
                break;
            }
        }
    }
}

/// Owns the single interactive channel to a server's container.
pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    server: Arc<dyn ServerHooks>,
    status: Arc<StatusCell>,
    telemetry: Arc<TelemetryStream>,
    slot: Arc<SessionSlot>,
    input: Arc<Mutex<Option<InputSink>>>,
    forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        server: Arc<dyn ServerHooks>,
        status: Arc<StatusCell>,
        telemetry: Arc<TelemetryStream>,
    ) -> Self {
        Self {
            runtime,
            server,
            status,
            telemetry,
            slot: Arc::new(SessionSlot(AtomicU8::new(SessionState::Idle as u8))),
            input: Arc::new(Mutex::new(None)),
            forwarder: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.slot.get()
    }

    pub fn is_attached(&self) -> bool {
        self.state() == SessionState::Attached
    }

    /// Opens the console and starts forwarding its output. Telemetry is
    /// (re)started once the console is open.
    pub async fn attach(&self, container_id: &str) -> Result<()> {
        let guard = SessionGuard::claim(&self.slot, SessionState::Attaching, None)?;

        let streams = self.runtime.attach(container_id).await?;
        *self.input.lock().await = Some(streams.input);
        self.slot.set(SessionState::Attached);
        guard.disarm();

        info!("Attached to container {} for server {}", container_id, self.server.uuid());

        let server = self.server.clone();
        let status = self.status.clone();
        let slot = self.slot.clone();
        let input = self.input.clone();
        let output = streams.output;
        let container = container_id.to_string();
        let forwarder = tokio::spawn(async move {
            forward_output(output, server.as_ref()).await;

            input.lock().await.take();
            slot.set(SessionState::Idle);
            debug!("Console stream for container {} closed", container);
            status.transition(ServerStatus::Off);
            server.stream_closed();
        });
        *self
            .forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(forwarder);

        self.stats(container_id).await
    }

    /// Runs a one-shot command and forwards its output until it exits.
    /// The server is told the stream closed exactly once, however this ends.
    pub async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<()> {
        let _guard = SessionGuard::claim(
            &self.slot,
            SessionState::Exec,
            Some(self.server.clone()),
        )?;

        debug!("Executing {:?} in container {}", command, container_id);
        let output = self.runtime.exec(container_id, command).await?;
        forward_output(output, self.server.as_ref()).await;
        Ok(())
    }

    /// Sends one line to the attached console.
    pub async fn write(&self, data: &str) -> Result<()> {
        if !self.is_attached() {
            return Err(ContainerError::NoActiveStream);
        }

        let mut input = self.input.lock().await;
        let sink = input.as_mut().ok_or(ContainerError::NoActiveStream)?;

        let mut line = String::with_capacity(data.len() + 1);
        line.push_str(data);
        line.push('\n');

        sink.write_all(line.as_bytes())
            .await
            .context("Failed to write to container console")?;
        sink.flush()
            .await
            .context("Failed to flush container console")?;
        Ok(())
    }

    pub async fn stats(&self, container_id: &str) -> Result<()> {
        self.telemetry
            .start(self.runtime.as_ref(), container_id)
            .await?;
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Ok(mut forwarder) = self.forwarder.lock() {
            if let Some(task) = forwarder.take() {
                task.abort();
            }
        }
    }
}
