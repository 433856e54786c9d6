//! SAS Discovery Simulator
//!
//! Runs the discovery engine against a topology described in YAML, using the
//! recording collaborators and the simulated expander fabric, and prints the
//! resulting domain as JSON.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      sas-discovery simulate                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Topology   │───▶│ HostAdapter  │───▶│   Report     │       │
//! │  │    (YAML)    │    │  + fabric    │    │   (JSON)     │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sas_discovery::adapters::{
    parse_address, CompositeEventSink, InMemoryEventSink, LoggingEventSink, RecordingDriver,
    SimulatedFabric, Step, Topology,
};
use sas_discovery::discovery::PortSnapshot;
use sas_discovery::domain::ports::PortId;
use sas_discovery::{Collaborators, HostAdapter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SAS domain discovery engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover a simulated topology and print the resulting domain
    Simulate {
        /// Topology file (YAML)
        #[arg(long, env = "SAS_TOPOLOGY")]
        topology: PathBuf,

        /// Also print metrics in the Prometheus text format
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    host: String,
    ports: Vec<PortSnapshot>,
    topology_events: usize,
    registered: usize,
    devices_live: i64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match args.command {
        Command::Simulate { topology, metrics } => simulate(topology, metrics).await,
    }
}

async fn simulate(path: PathBuf, print_metrics: bool) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading topology {}", path.display()))?;
    let topology = Topology::from_yaml(&text).context("parsing topology")?;

    info!("Starting SAS discovery simulation");
    info!("  Host: {}", topology.host);
    info!("  Ports: {}", topology.ports.len());
    info!("  Script steps: {}", topology.script.len());

    let driver = Arc::new(RecordingDriver::new());
    let fabric = Arc::new(topology.build_fabric()?);
    let journal = Arc::new(InMemoryEventSink::new());
    let events = CompositeEventSink::new()
        .with_sink(Arc::new(LoggingEventSink::new()))
        .with_sink(journal.clone());

    let host = HostAdapter::new(
        topology.host.clone(),
        topology.config.clone(),
        Collaborators {
            driver: driver.clone(),
            reporting: driver.clone(),
            sata: driver.clone(),
            expander: fabric.clone(),
            events: Arc::new(events),
        },
    )?;

    for port in topology.build_ports()? {
        host.add_port(port);
    }

    let script = if topology.script.is_empty() {
        topology
            .ports
            .iter()
            .filter(|p| p.attached.is_some())
            .map(|p| Step::Discover { port: p.id })
            .collect()
    } else {
        topology.script.clone()
    };

    for step in script {
        run_step(&host, &fabric, step).await?;
        host.flush().await;
    }

    let report = SimulationReport {
        host: host.name().to_string(),
        ports: host.topology(),
        topology_events: journal.len(),
        registered: driver.registered_count(),
        devices_live: host.metrics().devices_live(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if print_metrics {
        print!("{}", host.metrics().gather_text()?);
    }

    host.shutdown().await;
    Ok(())
}

async fn run_step(host: &Arc<HostAdapter>, fabric: &SimulatedFabric, step: Step) -> anyhow::Result<()> {
    info!(?step, "step");
    match step {
        Step::Discover { port } => {
            host.queue_discovery(PortId(port))?;
        }
        Step::Revalidate { port } => {
            host.queue_revalidation(PortId(port))?;
        }
        Step::Suspend { port } => {
            host.queue_suspend(PortId(port))?;
        }
        Step::Resume { port } => {
            host.queue_resume(PortId(port))?;
        }
        Step::LinkDown { port } => {
            host.unregister_domain_devices(PortId(port), true).await?;
        }
        Step::Attach { expander, phy, device } => {
            let expander = parse_address(&expander)?;
            fabric.attach(expander, phy, device.attached_device(phy)?)?;
            fabric.load(&device)?;
        }
        Step::Detach { expander, phy } => {
            fabric.detach(parse_address(&expander)?, phy);
        }
        Step::BeginAtaRecovery => host.begin_ata_recovery(),
        Step::FinishAtaRecovery => {
            host.finish_ata_recovery()?;
        }
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so the JSON report on stdout stays parseable.
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
