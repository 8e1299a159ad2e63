use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding as DockerPortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use super::spec::ContainerDescriptor;
use crate::config::DockerSettings;

/// Raw bytes as they arrive from the engine.
pub type OutputStream = BoxStream<'static, Result<Vec<u8>>>;

pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Both halves of an attached console.
pub struct ConsoleStreams {
    pub output: OutputStream,
    pub input: InputSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// True for anything the engine does not report as stopped, paused and restarting included.
    pub running: bool,
    pub status: Option<String>,
}

/// The container operations a controller drives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, descriptor: &ContainerDescriptor) -> Result<String>;

    async fn start(&self, id: &str) -> Result<StartOutcome>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn kill(&self, id: &str) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn unpause(&self, id: &str) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerState>;

    async fn attach(&self, id: &str) -> Result<ConsoleStreams>;

    /// Runs `command` with a pseudo-terminal and returns its output.
    async fn exec(&self, id: &str, command: Vec<String>) -> Result<OutputStream>;

    /// Continuous usage feed, one JSON document per sample.
    async fn stats(&self, id: &str) -> Result<OutputStream>;

    async fn remove(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;
}

pub struct DockerClient {
    docker: Docker,
    stop_timeout: i64,
}

impl DockerClient {
    pub async fn new(settings: &DockerSettings) -> Result<Self> {
        let docker = Docker::connect_with_socket(&settings.socket, 120, API_DEFAULT_VERSION)
            .with_context(|| format!("Failed to open Docker socket {}", settings.socket))?;

        let version = docker
            .version()
            .await
            .context("Failed to connect to Docker daemon")?;

        info!(
            "Connected to Docker daemon version: {}",
            version.version.unwrap_or_default()
        );

        Ok(Self {
            docker,
            stop_timeout: settings.stop_timeout,
        })
    }
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Adds `:latest` when the reference carries neither tag nor digest.
fn qualified_image(image: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    if name.contains(':') || name.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

fn container_config(descriptor: &ContainerDescriptor) -> Config<String> {
    let exposed_ports = descriptor
        .network
        .exposed
        .iter()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();

    let port_bindings = descriptor
        .network
        .by_container_port()
        .into_iter()
        .map(|(port, bindings)| {
            let hosts: Vec<DockerPortBinding> = bindings
                .into_iter()
                .map(|b| DockerPortBinding {
                    host_ip: Some(b.host_ip.clone()),
                    host_port: Some(b.host_port.clone()),
                })
                .collect();
            (port, Some(hosts))
        })
        .collect();

    let resources = &descriptor.resources;
    let host_config = HostConfig {
        memory: Some(resources.memory_bytes),
        memory_swap: Some(resources.swap_bytes),
        cpu_quota: Some(resources.cpu_quota),
        cpu_period: Some(resources.cpu_period),
        blkio_weight: Some(resources.io_weight),
        oom_kill_disable: Some(resources.oom_disabled),
        port_bindings: Some(port_bindings),
        dns: Some(descriptor.dns.clone()),
        mounts: Some(vec![Mount {
            target: Some(descriptor.data_target.clone()),
            source: Some(descriptor.data_source.to_string_lossy().into_owned()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Config {
        image: Some(descriptor.image.clone()),
        hostname: Some(descriptor.hostname.clone()),
        user: Some(descriptor.user.clone()),
        env: Some(descriptor.env_pairs()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        tty: Some(true),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn create(&self, descriptor: &ContainerDescriptor) -> Result<String> {
        let response = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                container_config(descriptor),
            )
            .await
            .context("Failed to create container")?;

        for warning in &response.warnings {
            debug!("Create warning for {}: {}", response.id, warning);
        }

        info!("Created container {} from {}", response.id, descriptor.image);
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<StartOutcome> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!("Started container: {}", id);
                Ok(StartOutcome::Started)
            }
            Err(e) if status_code(&e) == Some(304) => {
                debug!("Container {} was already started", id);
                Ok(StartOutcome::AlreadyRunning)
            }
            Err(e) => Err(e).context("Failed to start container"),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout,
        };

        self.docker
            .stop_container(id, Some(options))
            .await
            .context("Failed to stop container")?;

        info!("Stopped container: {}", id);
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .context("Failed to kill container")?;

        info!("Killed container: {}", id);
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.docker
            .pause_container(id)
            .await
            .context("Failed to pause container")
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.docker
            .unpause_container(id)
            .await
            .context("Failed to unpause container")
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;

        let state = info.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            status: state.status.map(|s| s.to_string()),
        })
    }

    async fn attach(&self, id: &str) -> Result<ConsoleStreams> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };

        let attached = self
            .docker
            .attach_container(id, Some(options))
            .await
            .context("Failed to attach to container")?;

        let output = attached
            .output
            .map(|chunk| {
                chunk
                    .map(|msg| msg.into_bytes().to_vec())
                    .context("Error reading container output")
            })
            .boxed();

        Ok(ConsoleStreams {
            output,
            input: attached.input,
        })
    }

    async fn exec(&self, id: &str, command: Vec<String>) -> Result<OutputStream> {
        let exec_config = CreateExecOptions {
            cmd: Some(command),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .context("Failed to create exec")?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?;

        match started {
            StartExecResults::Attached { output, .. } => Ok(output
                .map(|chunk| {
                    chunk
                        .map(|msg| msg.into_bytes().to_vec())
                        .context("Error reading exec output")
                })
                .boxed()),
            StartExecResults::Detached => Ok(futures::stream::empty().boxed()),
        }
    }

    async fn stats(&self, id: &str) -> Result<OutputStream> {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };

        let feed = self
            .docker
            .stats(id, Some(options))
            .map(|sample| {
                let stats = sample.context("Error reading container stats")?;
                serde_json::to_vec(&stats).context("Failed to encode container stats")
            })
            .boxed();

        Ok(feed)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .context("Failed to remove container")?;

        info!("Removed container: {}", id);
        Ok(())
    }
}

#[async_trait]
impl ImageStore for DockerClient {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(&qualified_image(image)).await {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(e).context("Failed to inspect image"),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let reference = qualified_image(image);
        info!("Pulling Docker image: {}", reference);

        let options = CreateImageOptions {
            from_image: reference.as_str(),
            ..Default::default()
        };

        let mut progress = self.docker.create_image(Some(options), None, None);

        while let Some(update) = progress.next().await {
            let update = update.with_context(|| format!("Failed to pull image {}", reference))?;
            if let Some(message) = update.error {
                bail!("Engine rejected pull of {}: {}", reference, message);
            }
            if let Some(status) = update.status {
                debug!("Pull {}: {}", reference, status);
            }
        }

        info!("Pulled image {}", reference);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::spec::NetworkBindings;
    use crate::models::{Allocation, BuildConfig};
    use std::collections::BTreeMap;
    use std::path::Path;

    #[test]
    fn image_references_get_a_tag() {
        assert_eq!(qualified_image("alpine"), "alpine:latest");
        assert_eq!(qualified_image("ghcr.io/org/java:17"), "ghcr.io/org/java:17");
        assert_eq!(
            qualified_image("registry:5000/org/java"),
            "registry:5000/org/java:latest"
        );
        assert_eq!(qualified_image("alpine@sha256:abcd"), "alpine@sha256:abcd");
    }

    #[test]
    fn engine_config_carries_descriptor() {
        let mut ports = BTreeMap::new();
        ports.insert("0.0.0.0".to_string(), vec!["25565".to_string()]);
        let build = BuildConfig {
            image: "ghcr.io/org/java:17".to_string(),
            env: BTreeMap::new(),
            ports: ports.clone(),
            default: Allocation {
                ip: "0.0.0.0".to_string(),
                port: 25565,
            },
            memory: 1024,
            swap: -1,
            cpu: 100,
            io: 500,
            oom_disabled: Some(true),
            user: 988,
        };
        let descriptor = ContainerDescriptor::new(
            "abc",
            &build,
            NetworkBindings::from_ports(&ports),
            Path::new("/srv/abc"),
        );

        let config = container_config(&descriptor);
        let host = config.host_config.unwrap();

        assert_eq!(host.memory, Some(1_024_000_000));
        assert_eq!(host.memory_swap, Some(-1));
        assert_eq!(host.cpu_quota, Some(100_000));
        assert_eq!(host.oom_kill_disable, Some(true));
        assert_eq!(config.user.as_deref(), Some("988"));

        let bindings = host.port_bindings.unwrap();
        assert_eq!(bindings.len(), 2);
        let tcp = bindings["25565/tcp"].as_ref().unwrap();
        assert_eq!(tcp[0].host_ip.as_deref(), Some("0.0.0.0"));
        assert_eq!(tcp[0].host_port.as_deref(), Some("25565"));
        assert_eq!(config.exposed_ports.unwrap().len(), 2);
    }
}
