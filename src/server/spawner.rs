// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks.

use super::context::ServerContext;
use crate::core::registry::HEARTBEAT_INTERVAL;
use crate::core::sequencer::{Killer, run_event_loop};
use anyhow::{Result, anyhow};
use std::time::Duration;
use tracing::{info, warn};

/// Spawns the killer, the io-failure event loop, the minute statistics
/// roll-up, the script frame timer and the registry notifier.
pub fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let kill_rx = ctx
        .kill_rx
        .take()
        .ok_or_else(|| anyhow!("kill queue receiver already taken"))?;
    let event_rx = ctx
        .event_rx
        .take()
        .ok_or_else(|| anyhow!("event receiver already taken"))?;

    let killer = Killer::new(ctx.sequencer.clone(), kill_rx);
    let shutdown_rx_killer = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        killer.run(shutdown_rx_killer).await;
    });

    let sequencer = ctx.sequencer.clone();
    let shutdown_rx_events = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        run_event_loop(sequencer, event_rx, shutdown_rx_events).await;
    });

    let sequencer = ctx.sequencer.clone();
    let mut shutdown_rx_stats = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = interval.tick() => sequencer.update_minute_stats(),
                _ = shutdown_rx_stats.recv() => break,
            }
        }
    });

    if let Some(script) = ctx.sequencer.script_host() {
        let mut shutdown_rx_script = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => script.frame_step(1.0),
                    _ = shutdown_rx_script.recv() => break,
                }
            }
        });
    }

    if let Some(registry) = ctx.registry.clone() {
        let sequencer = ctx.sequencer.clone();
        let mut shutdown_rx_notify = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let payload = sequencer.heartbeat_snapshot(&registry.challenge());
                        if let Err(e) = registry.advertise(&payload).await {
                            warn!("registry heartbeat failed: {e}");
                        }
                    }
                    _ = shutdown_rx_notify.recv() => break,
                }
            }
        });
    }

    info!("all background tasks have been spawned");
    Ok(())
}
