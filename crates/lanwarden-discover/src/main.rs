//! CLI entry point for the lanwarden-discover network scanner.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use lanwarden_core::types::range_key;
use lanwarden_core::{NetworkRange, ScanStatus};
use lanwarden_store::{GraphClient, MemoryStore, ResultSink};

use lanwarden_discover::classifier::DeviceClassifier;
use lanwarden_discover::config::{load_discover_config, load_graph_config, StoreBackend};
use lanwarden_discover::coordinator::{RangeLocks, ScanCoordinator, ScanEngine};
use lanwarden_discover::host_probe::select_host_probe;
use lanwarden_discover::neighbor::SystemNeighborTable;
use lanwarden_discover::port_probe::TcpPortScanner;
use lanwarden_discover::scheduler::ScanScheduler;

#[derive(Parser)]
#[command(name = "lanwarden-discover")]
#[command(about = "Network discovery and security scanner")]
struct Cli {
    /// Target to scan (CIDR notation, e.g., 192.168.2.0/24).
    #[arg(short, long)]
    target: Option<String>,

    /// Run a single one-shot scan and exit.
    #[arg(long)]
    once: bool,

    /// Run as daemon with scheduled scans.
    #[arg(long)]
    daemon: bool,

    /// Result store: memory, neo4j (otherwise read from config).
    #[arg(long)]
    store: Option<String>,

    /// Config file prefix (default: lanwarden).
    #[arg(short, long, default_value = "lanwarden")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let mut discover_config = load_discover_config(&cli.config)?;
    if let Some(raw) = cli.store.as_deref() {
        discover_config.store = parse_store(raw)?;
    }
    discover_config.validate()?;

    let sink: Arc<dyn ResultSink> = match discover_config.store {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory result store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Neo4j => {
            let graph_config = load_graph_config(&cli.config);
            Arc::new(GraphClient::connect(&graph_config).await?)
        }
    };

    let neighbors = Arc::new(SystemNeighborTable);
    let engine = ScanEngine {
        host_probe: select_host_probe(discover_config.liveness_ports.clone(), neighbors.clone()),
        port_probe: Arc::new(TcpPortScanner::new().with_banners(discover_config.grab_banners)),
        neighbors,
        classifier: DeviceClassifier::from_config(&discover_config.extra_oui)?,
        sink: sink.clone(),
    };
    let coordinator = ScanCoordinator::new(discover_config.clone(), engine, RangeLocks::new())?;
    spawn_event_logger(&coordinator);

    if cli.once {
        let target = cli
            .target
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--target is required in --once mode"))?;
        let handle = coordinator.start_scan(&NetworkRange::configured(target))?;
        let id = handle.id;

        let wait = handle.wait();
        tokio::pin!(wait);
        let run = tokio::select! {
            run = &mut wait => run,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(scan_id = %id, "Interrupted, cancelling scan");
                coordinator.cancel_scan(id)?;
                wait.await
            }
        };

        if run.status != ScanStatus::Completed {
            anyhow::bail!(
                "Scan {} ended {}: {}",
                run.id,
                run.status.as_str(),
                run.failure_reason.as_deref().unwrap_or("no reason recorded")
            );
        }

        let devices = sink.get_devices(&run.range).await?;
        let findings = sink.get_latest_findings(&run.range).await?;
        let report = serde_json::json!({
            "scan": run,
            "devices": devices,
            "findings": findings,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if cli.daemon {
        let extra = match cli.target.as_deref() {
            Some(target) => {
                let key = range_key(target)?;
                Some((NetworkRange::configured(target), discover_config.interval_for(&key)))
            }
            None => None,
        };

        let scheduler = Arc::new(ScanScheduler::new(discover_config, coordinator));
        if let Some((range, every)) = extra {
            scheduler.schedule(range, every)?;
        }

        let signal = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                signal.shutdown();
            }
        });

        scheduler.run().await?;
    } else {
        anyhow::bail!("Specify --once (one-shot scan) or --daemon (scheduled scanning)");
    }

    Ok(())
}

/// Log every lifecycle event as a JSON document.
fn spawn_event_logger(coordinator: &ScanCoordinator) {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        tracing::info!(scan_id = %event.scan_id(), event = %json, "Scan event")
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize scan event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn parse_store(s: &str) -> anyhow::Result<StoreBackend> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(StoreBackend::Memory),
        "neo4j" => Ok(StoreBackend::Neo4j),
        _ => anyhow::bail!("Invalid store: {s}. Choose: memory, neo4j"),
    }
}
