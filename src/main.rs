mod config;
mod docker;
mod fleet;
mod models;
mod shared;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use config::DaemonConfig;
use docker::{DockerClient, UsageSnapshot};
use fleet::{Fleet, ManagedServer, Scope};

#[derive(Parser)]
#[command(name = "wharf")]
#[command(about = "Wharf - container lifecycle manager for game servers", long_about = None)]
struct Cli {
    /// Path to the daemon configuration file
    #[arg(short, long, env = "WHARF_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every configured server and follow their consoles (default command)
    Daemon {
        /// Forward stdin lines to this server's console
        #[arg(long, value_name = "UUID")]
        console: Option<Uuid>,
    },

    /// Send a power action to one server
    Power {
        server: Uuid,

        #[arg(value_enum)]
        action: PowerAction,
    },

    /// Recreate a server's container from its current build
    Rebuild { server: Uuid },

    /// Run a one-shot command inside a server's container and print its output
    Exec {
        server: Uuid,

        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Print one resource usage sample for a running server
    Usage {
        server: Uuid,

        /// Seconds to wait for a sample
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PowerAction {
    Start,
    Stop,
    Kill,
    Pause,
    Unpause,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = DaemonConfig::load(&cli.config)?;

    let _logging = shared::logging::init_logging(&config.log_dir, "wharf")?;

    let client = Arc::new(DockerClient::new(&config.docker).await?);

    match cli.command.unwrap_or(Commands::Daemon { console: None }) {
        Commands::Daemon { console } => run_daemon(&config, client, console).await,
        Commands::Power { server, action } => {
            let fleet = Fleet::connect(&config, client, Scope::OneShot(server)).await;
            let managed = lookup(&config, &fleet, server)?;
            let controller = &managed.controller;

            match action {
                PowerAction::Start => controller.start().await?,
                PowerAction::Stop => controller.stop().await?,
                PowerAction::Kill => controller.kill().await?,
                PowerAction::Pause => controller.pause().await?,
                PowerAction::Unpause => controller.unpause().await?,
            }

            println!("{} {}", server, controller.status());
            Ok(())
        }
        Commands::Rebuild { server } => {
            let fleet = Fleet::connect(&config, client, Scope::OneShot(server)).await;
            let managed = lookup(&config, &fleet, server)?;

            let result = managed.controller.rebuild().await?;
            if let Some(e) = &result.removal_error {
                warn!("Rebuild of {} left the previous container behind: {:#}", server, e);
            }

            let note = if result.is_clean() { "" } else { " (previous container kept)" };
            println!("{} {} {}{}", server, result.container_id, result.image, note);
            Ok(())
        }
        Commands::Exec { server, command } => {
            let fleet = Fleet::connect(&config, client, Scope::OneShot(server)).await;
            let managed = lookup(&config, &fleet, server)?;

            let mut output = managed.record.subscribe_console();
            managed.controller.exec(command).await?;

            loop {
                match output.try_recv() {
                    Ok(chunk) => print!("{}", chunk),
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        warn!("Exec output skipped {} chunks", skipped);
                    }
                    Err(_) => break,
                }
            }
            Ok(())
        }
        Commands::Usage { server, timeout } => {
            let fleet = Fleet::connect(&config, client, Scope::OneShot(server)).await;
            let managed = lookup(&config, &fleet, server)?;

            if !managed.controller.status().is_running() {
                warn!("Server {} is not running, its usage will read as zero", server);
            }

            let mut usage = managed.controller.subscribe_usage();
            if managed.controller.usage().is_none() {
                managed.controller.stats().await?;
            }

            let sample = tokio::time::timeout(
                Duration::from_secs(timeout),
                usage.wait_for(|sample| sample.is_some()),
            )
            .await
            .context("Timed out waiting for a usage sample")?
            .context("Usage feed closed")?
            .clone();

            if let Some(sample) = &sample {
                info!("{}", summarize(sample));
            }
            println!("{}", serde_json::to_string_pretty(&sample)?);
            Ok(())
        }
    }
}

fn lookup<'a>(config: &DaemonConfig, fleet: &'a Fleet, server: Uuid) -> Result<&'a ManagedServer> {
    if config.server(server).is_none() {
        anyhow::bail!("Server {} is not configured", server);
    }
    fleet
        .get(server)
        .ok_or_else(|| anyhow::anyhow!("Server {} failed to reconcile", server))
}

fn summarize(sample: &UsageSnapshot) -> String {
    let (rx, tx) = sample.network_totals();
    format!(
        "memory {}/{} bytes, cpu {:.2}%, network rx {} tx {}",
        sample.memory_bytes(),
        sample.memory_limit_bytes(),
        sample.cpu_percent(),
        rx,
        tx
    )
}

async fn run_daemon(config: &DaemonConfig, client: Arc<DockerClient>, console: Option<Uuid>) -> Result<()> {
    info!("Starting wharf with {} configured servers", config.servers.len());

    let fleet = Fleet::connect(config, client, Scope::All).await;
    info!("{} servers under management", fleet.len());

    if let Some(uuid) = console {
        let managed = lookup(config, &fleet, uuid)?;
        let mut output = managed.record.subscribe_console();
        tokio::spawn(async move {
            loop {
                match output.recv().await {
                    Ok(chunk) => print!("{}", chunk),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Console output skipped {} chunks", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Err(e) = managed.controller.write(&line).await {
                            error!("Failed to send command to {}: {}", uuid, e);
                        }
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down wharf...");
    Ok(())
}
