use std::{collections::BTreeSet, path::PathBuf, process::exit, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    signal::{self, unix::SignalKind},
    sync::watch,
    task::JoinHandle,
    time,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod agent;
mod api;
mod capture;
mod config;
mod discovery;
mod error;
mod estimator;
mod model;
mod publisher;
mod registry;

use agent::{Agent, Schedule};
use capture::{FlowCapture, KernelFlowCapture};
use config::{Config, DEFAULT_CONFIG_PATH};
use discovery::ServerSource;
use estimator::FlowEstimator;
use model::{FlowKey, FlowRecord};
use publisher::StatsPublisher;

#[derive(Parser)]
#[command(name = "flowlens")]
#[command(about = "Game-server player estimator backed by a tc flow classifier", long_about = None)]
struct Cli {
    /// YAML configuration file; missing means all defaults
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override the configured interface
    #[arg(long, global = true, value_name = "IFACE")]
    interface: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: discovery, estimation and the HTTP surfaces (default)
    Run,
    /// Attach, count the given ports for a while and print the flow table
    Dump(DumpCommand),
}

#[derive(Args)]
struct DumpCommand {
    /// Destination ports to allow-list, comma separated
    #[arg(long, value_delimiter = ',', required = true,
          value_parser = clap::value_parser!(u16).range(1..))]
    ports: Vec<u16>,
    /// Seconds to count before reading the table
    #[arg(long, default_value_t = 5)]
    settle_secs: u64,
    /// Print JSON instead of one line per flow
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("flowlens error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(iface) = cli.interface {
        config.interface = iface;
    }
    init_tracing(&config.log_level);

    match cli.command {
        Some(Commands::Dump(cmd)) => dump_flows(&config, cmd).await,
        Some(Commands::Run) | None => run_agent(config).await,
    }
}

fn init_tracing(level: &str) {
    let directive = level_directive(level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("flowlens={}", directive.unwrap_or("info")).into()),
        )
        .init();
    if directive.is_none() {
        warn!(log_level = level, "unknown log level, using info");
    }
}

/// Maps a configured `log_level` onto a filter directive.
fn level_directive(level: &str) -> Option<&'static str> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

async fn run_agent(config: Config) -> Result<()> {
    config.validate().context("refusing to start")?;

    let source = ServerSource::from_config(&config)?;
    let publisher = Arc::new(StatsPublisher::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind before attaching so a taken port fails without touching tc.
    let mut listeners: Vec<JoinHandle<std::io::Result<()>>> = Vec::new();
    let api_listener = TcpListener::bind(config.server_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", config.server_addr))?;
    let scrape_listener = match config.prometheus_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind metrics listener on {addr}"))?,
        ),
        None => None,
    };

    let capture = KernelFlowCapture::attach(&config.attach_options())
        .context("failed to attach flow monitor")?;
    info!(
        iface = capture.interface(),
        allow_list_capacity = capture.capacity(),
        "flow monitor attached"
    );

    listeners.push(tokio::spawn(api::serve(
        api_listener,
        api::router(Arc::clone(&publisher), &config.api_key),
        shutdown_rx.clone(),
    )));
    if let Some(listener) = scrape_listener {
        listeners.push(tokio::spawn(api::serve(
            listener,
            api::prometheus_router(Arc::clone(&publisher)),
            shutdown_rx.clone(),
        )));
    }

    let agent = Agent::new(
        capture,
        source,
        FlowEstimator::new(config.estimator()),
        Arc::clone(&publisher),
    );
    let schedule = Schedule {
        discovery: config.discovery_interval(),
        metrics: config.metrics_interval(),
    };

    let signals = async {
        let result = wait_for_signal().await;
        info!("received shutdown signal, draining...");
        let _ = shutdown_tx.send(true);
        result
    };
    let ((), signal_result) = tokio::join!(agent.run(schedule, shutdown_rx), signals);

    agent.detach().await;
    for handle in listeners {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "http listener failed"),
            Err(err) => error!(error = %err, "http listener panicked"),
        }
    }

    signal_result
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = signal::unix::signal(SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = signal::ctrl_c() => result.context("failed to wait for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[derive(Serialize)]
struct DumpEntry {
    #[serde(flatten)]
    flow: FlowKey,
    #[serde(flatten)]
    record: FlowRecord,
}

async fn dump_flows(config: &Config, cmd: DumpCommand) -> Result<()> {
    let mut capture = KernelFlowCapture::attach(&config.attach_options())
        .context("failed to attach flow monitor")?;

    let desired: BTreeSet<u16> = cmd.ports.into_iter().collect();
    capture
        .sync_monitored_ports(&desired)
        .context("failed to allow-list ports")?;
    info!(
        iface = capture.interface(),
        ports = ?desired,
        settle_secs = cmd.settle_secs,
        "counting flows"
    );
    time::sleep(Duration::from_secs(cmd.settle_secs)).await;

    let flows = capture.harvest().context("failed to read flow table");
    capture.detach();

    let mut entries: Vec<DumpEntry> = flows?
        .into_iter()
        .map(|(flow, record)| DumpEntry { flow, record })
        .collect();
    entries.sort_by_key(|e| (e.flow.dst_port, e.flow.source, e.flow.protocol));

    if cmd.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("failed to encode flows")?
        );
    } else {
        for entry in &entries {
            println!("{} - {}", entry.flow, entry.record);
        }
    }
    Ok(())
}
