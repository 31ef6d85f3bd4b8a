use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info};

use haunts_core::sync::{Connectivity, PassOutcome, SyncEngine};

/// How often the daemon probes the remote's health endpoint.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) async fn cmd_sync(engine: &SyncEngine, json: bool) -> Result<()> {
    let outcome = engine.run_pass().await?;

    match outcome {
        PassOutcome::Completed(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!(
                "Pushed {} record(s): {} created, {} updated",
                report.pushed(),
                report.created,
                report.updated
            );
            if report.deferred > 0 {
                println!("  {} waiting for a parent to sync first", report.deferred);
            }
            if report.still_dirty > 0 {
                println!("  {} changed during the push and will go again", report.still_dirty);
            }
            for failure in &report.failures {
                eprintln!("  failed: {failure}");
            }
        }
        PassOutcome::Skipped(reason) => {
            if json {
                println!("{}", serde_json::json!({ "skipped": reason }));
            } else {
                eprintln!("Sync skipped: {reason}");
            }
        }
        PassOutcome::AlreadyRunning => {
            if json {
                println!("{}", serde_json::json!({ "skipped": "already_running" }));
            } else {
                eprintln!("A sync pass is already running");
            }
        }
    }
    Ok(())
}

/// Publish connectivity changes until `shutdown` flips.
pub(crate) async fn monitor_connectivity(
    connectivity: Arc<dyn Connectivity>,
    online: watch::Sender<bool>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now_online = connectivity.is_online().await;
                online.send_if_modified(|current| {
                    if *current == now_online {
                        return false;
                    }
                    debug!(online = now_online, "connectivity changed");
                    *current = now_online;
                    true
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Run the sync loop in the foreground until Ctrl-C.
pub(crate) async fn cmd_daemon(
    engine: Arc<SyncEngine>,
    connectivity: Arc<dyn Connectivity>,
    probe_every: Duration,
) -> Result<()> {
    let (online_tx, online_rx) = watch::channel(connectivity.is_online().await);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = tokio::spawn(monitor_connectivity(
        connectivity,
        online_tx,
        probe_every,
        shutdown_rx.clone(),
    ));
    let runner = tokio::spawn(engine.run(online_rx, shutdown_rx));

    eprintln!("Syncing in the background. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    // Receivers may already be gone.
    let _ = shutdown_tx.send(true);
    monitor.await.context("Connectivity monitor panicked")?;
    runner.await.context("Sync loop panicked")?;
    eprintln!("Stopped.");
    Ok(())
}
