//! In-memory runtime and server doubles for controller tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use uuid::Uuid;

use super::client::{
    ConsoleStreams, ContainerRuntime, ContainerState, ImageStore, OutputStream, StartOutcome,
};
use super::spec::ContainerDescriptor;
use crate::models::{Allocation, BuildConfig, ServerHooks, ServerStatus};

/// Polls `check` until it holds, failing the test after a second.
pub async fn eventually(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct RecordingSink(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for RecordingSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

type Feed = mpsc::UnboundedSender<Result<Vec<u8>>>;

#[derive(Default)]
struct MockState {
    running: bool,
    already_started: bool,
    fail_inspect: bool,
    fail_start: bool,
    fail_stop: bool,
    close_console_on_stop: bool,
    fail_attach: bool,
    fail_exec: bool,
    fail_stats: bool,
    fail_create: bool,
    fail_remove: bool,
    hold_exec: bool,
    image_present: bool,
    fail_image_exists: bool,
    fail_pull: bool,
    next_id: usize,
    calls: Vec<String>,
    attach_calls: usize,
    created: Vec<ContainerDescriptor>,
    removed: Vec<String>,
    pulled: Vec<String>,
    exec_output: Vec<Vec<u8>>,
    exec_commands: Vec<Vec<String>>,
    console: Option<Feed>,
    exec_feed: Option<Feed>,
    stats: Option<Feed>,
    written: Arc<Mutex<Vec<u8>>>,
}

pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                image_present: true,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_running(&self, running: bool) {
        self.state().running = running;
    }

    pub fn set_already_started(&self, value: bool) {
        self.state().already_started = value;
    }

    pub fn fail_inspect(&self, value: bool) {
        self.state().fail_inspect = value;
    }

    pub fn fail_start(&self, value: bool) {
        self.state().fail_start = value;
    }

    pub fn fail_stop(&self, value: bool) {
        self.state().fail_stop = value;
    }

    /// Ends the console feed from inside `stop`, the way an exiting container does.
    pub fn close_console_on_stop(&self, value: bool) {
        self.state().close_console_on_stop = value;
    }

    pub fn fail_attach(&self, value: bool) {
        self.state().fail_attach = value;
    }

    pub fn fail_exec(&self, value: bool) {
        self.state().fail_exec = value;
    }

    pub fn fail_stats(&self, value: bool) {
        self.state().fail_stats = value;
    }

    pub fn fail_create(&self, value: bool) {
        self.state().fail_create = value;
    }

    pub fn fail_remove(&self, value: bool) {
        self.state().fail_remove = value;
    }

    pub fn hold_exec(&self, value: bool) {
        self.state().hold_exec = value;
    }

    pub fn set_image_present(&self, value: bool) {
        self.state().image_present = value;
    }

    pub fn fail_image_exists(&self, value: bool) {
        self.state().fail_image_exists = value;
    }

    pub fn fail_pull(&self, value: bool) {
        self.state().fail_pull = value;
    }

    pub fn set_exec_output(&self, chunks: Vec<Vec<u8>>) {
        self.state().exec_output = chunks;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn attach_calls(&self) -> usize {
        self.state().attach_calls
    }

    pub fn created(&self) -> Vec<ContainerDescriptor> {
        self.state().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state().pulled.clone()
    }

    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.state().exec_commands.clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.state().written.lock().unwrap().clone()
    }

    pub fn push_console(&self, bytes: &[u8]) {
        if let Some(feed) = &self.state().console {
            let _ = feed.unbounded_send(Ok(bytes.to_vec()));
        }
    }

    pub fn close_console(&self) {
        self.state().console.take();
    }

    /// True while something is still reading the console feed.
    pub fn console_open(&self) -> bool {
        self.state()
            .console
            .as_ref()
            .map_or(false, |feed| !feed.is_closed())
    }

    pub fn close_exec(&self) {
        self.state().exec_feed.take();
    }

    pub fn push_stats(&self, bytes: &[u8]) {
        if let Some(feed) = &self.state().stats {
            let _ = feed.unbounded_send(Ok(bytes.to_vec()));
        }
    }

    pub fn close_stats(&self) {
        self.state().stats.take();
    }

    fn record(&self, call: impl Into<String>) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.calls.push(call.into());
        state
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, descriptor: &ContainerDescriptor) -> Result<String> {
        let mut state = self.record("create");
        if state.fail_create {
            bail!("no such image: {}", descriptor.image);
        }
        state.next_id += 1;
        state.created.push(descriptor.clone());
        Ok(format!("container-{}", state.next_id))
    }

    async fn start(&self, id: &str) -> Result<StartOutcome> {
        let mut state = self.record(format!("start {}", id));
        if state.fail_start {
            bail!("cannot start container {}", id);
        }
        if state.already_started {
            return Ok(StartOutcome::AlreadyRunning);
        }
        state.running = true;
        Ok(StartOutcome::Started)
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let mut state = self.record(format!("stop {}", id));
        if state.fail_stop {
            bail!("cannot stop container {}", id);
        }
        if state.close_console_on_stop {
            state.console.take();
        }
        state.running = false;
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.record(format!("kill {}", id)).running = false;
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.record(format!("pause {}", id));
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.record(format!("unpause {}", id));
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let state = self.record(format!("inspect {}", id));
        if state.fail_inspect {
            bail!("no such container: {}", id);
        }
        Ok(ContainerState {
            running: state.running,
            status: Some((if state.running { "running" } else { "exited" }).to_string()),
        })
    }

    async fn attach(&self, id: &str) -> Result<ConsoleStreams> {
        let mut state = self.record(format!("attach {}", id));
        state.attach_calls += 1;
        if state.fail_attach {
            bail!("cannot attach to {}", id);
        }
        let (tx, rx) = mpsc::unbounded();
        state.console = Some(tx);
        Ok(ConsoleStreams {
            output: rx.boxed(),
            input: Box::pin(RecordingSink(state.written.clone())),
        })
    }

    async fn exec(&self, id: &str, command: Vec<String>) -> Result<OutputStream> {
        let mut state = self.record(format!("exec {}", id));
        if state.fail_exec {
            bail!("cannot exec in {}", id);
        }
        state.exec_commands.push(command);

        let (tx, rx) = mpsc::unbounded();
        for chunk in state.exec_output.drain(..) {
            let _ = tx.unbounded_send(Ok(chunk));
        }
        if state.hold_exec {
            state.exec_feed = Some(tx);
        }
        Ok(rx.boxed())
    }

    async fn stats(&self, id: &str) -> Result<OutputStream> {
        let mut state = self.record(format!("stats {}", id));
        if state.fail_stats {
            bail!("cannot read stats for {}", id);
        }
        let (tx, rx) = mpsc::unbounded();
        state.stats = Some(tx);
        Ok(rx.boxed())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.record(format!("remove {}", id));
        if state.fail_remove {
            bail!("removal of container {} is already in progress", id);
        }
        state.removed.push(id.to_string());
        Ok(())
    }
}

#[async_trait]
impl ImageStore for MockRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let state = self.record(format!("image_exists {}", image));
        if state.fail_image_exists {
            bail!("cannot inspect image {}", image);
        }
        Ok(state.image_present)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.record(format!("pull {}", image));
        if state.fail_pull {
            bail!("pull access denied for {}", image);
        }
        state.pulled.push(image.to_string());
        state.image_present = true;
        Ok(())
    }
}

#[derive(Default)]
struct Recorded {
    output: String,
    closed: usize,
    statuses: Vec<ServerStatus>,
}

pub struct RecordingServer {
    uuid: Uuid,
    build: Mutex<BuildConfig>,
    recorded: Mutex<Recorded>,
}

impl RecordingServer {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            build: Mutex::new(test_build()),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn set_build(&self, build: BuildConfig) {
        *self.build.lock().unwrap() = build;
    }

    pub fn output(&self) -> String {
        self.recorded.lock().unwrap().output.clone()
    }

    pub fn closed_count(&self) -> usize {
        self.recorded.lock().unwrap().closed
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.recorded.lock().unwrap().statuses.clone()
    }
}

impl ServerHooks for RecordingServer {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn build(&self) -> BuildConfig {
        self.build.lock().unwrap().clone()
    }

    fn data_path(&self) -> PathBuf {
        PathBuf::from("/srv/wharf/servers").join(self.uuid.to_string())
    }

    fn output(&self, chunk: &str) {
        self.recorded.lock().unwrap().output.push_str(chunk);
    }

    fn stream_closed(&self) {
        self.recorded.lock().unwrap().closed += 1;
    }

    fn status_changed(&self, status: ServerStatus) {
        self.recorded.lock().unwrap().statuses.push(status);
    }
}

pub fn test_build() -> BuildConfig {
    let mut build = BuildConfig {
        image: "ghcr.io/example/minecraft:java17".to_string(),
        env: Default::default(),
        ports: Default::default(),
        default: Allocation {
            ip: "10.0.0.5".to_string(),
            port: 25565,
        },
        memory: 1024,
        swap: 0,
        cpu: 100,
        io: 500,
        oom_disabled: None,
        user: 988,
    };
    build
        .ports
        .insert("10.0.0.5".to_string(), vec!["25565".to_string(), "bad".to_string()]);
    build
}
