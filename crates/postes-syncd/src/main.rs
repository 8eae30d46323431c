mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use postes_core::config::State;
use postes_core::sync::{PassOutcome, SyncError};
use postes_core::{
    ApiClient, ConnectivityEvent, ConnectivityMonitor, LocalDb, ReachabilityProbe, RecordStore, SessionManager,
    SyncOrchestrator, SyncTrigger,
};

use crate::config::load_daemon_config;

#[derive(Parser)]
#[command(name = "postes-syncd", about = "Background sync daemon for postes")]
struct Args {
    /// Path to the configuration file (defaults to ~/.config/postes/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

/// Run one pass in the background. Overlapping triggers are dropped by the
/// orchestrator itself.
fn spawn_pass(sync: &Arc<SyncOrchestrator>, trigger: SyncTrigger) {
    let sync = sync.clone();
    tokio::spawn(async move {
        match sync.run_pass(trigger).await {
            Ok(PassOutcome::Completed(report)) if report.attempted > 0 => {
                info!(
                    ?trigger,
                    delivered = report.delivered.len(),
                    remaining = report.transient.len() + report.rejected.len(),
                    "pass completed"
                );
            }
            Ok(_) => {}
            Err(SyncError::Unauthorized { reason, .. }) => {
                warn!(?trigger, %reason, "pass stopped; run 'postes login' to resume syncing");
            }
            Err(e) => error!(?trigger, error = %e, "pass failed"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let (config, config_path) = load_daemon_config(args.config.as_deref())?;
    info!(config = %config_path.display(), server = %config.api.base_url, "postes-syncd starting");

    let db_path = config.database_path()?;
    let store = Arc::new(LocalDb::open(&db_path)?);
    store
        .initialize()
        .await
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;

    let api = Arc::new(ApiClient::new(&config.api)?);
    let session = Arc::new(SessionManager::load(api.clone(), State::default_path()?)?);
    if !session.is_logged_in().await {
        warn!("no session stored; records will stay queued until 'postes login'");
    }

    let probe = ReachabilityProbe::new(
        api.base_url(),
        Duration::from_secs(config.connectivity.probe_timeout_secs.max(1)),
        Duration::from_secs(config.connectivity.probe_interval_secs.max(1)),
    )?;
    let monitor = Arc::new(ConnectivityMonitor::new(probe.check().await));
    let mut events = monitor.subscribe();
    let probe_task = probe.spawn(monitor.clone());

    let sync = Arc::new(SyncOrchestrator::new(
        store,
        api,
        session,
        monitor.clone(),
        config.sync.clone(),
    ));

    if config.sync.sync_on_start {
        spawn_pass(&sync, SyncTrigger::AppStart);
    }

    let mut periodic = tokio::time::interval(config.sync.interval());
    periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; app start already covered it.
    periodic.tick().await;

    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(ConnectivityEvent::Regained) => spawn_pass(&sync, SyncTrigger::ConnectivityRegained),
                    Some(ConnectivityEvent::Lost) => info!("offline, queued records wait for the connection"),
                    None => {
                        warn!("connectivity monitor closed");
                        break;
                    }
                }
            }

            _ = periodic.tick() => {
                spawn_pass(&sync, SyncTrigger::Periodic);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, stopping postes-syncd");
                break;
            }
        }
    }

    probe_task.abort();
    Ok(())
}
