//! `dropmark run`: watch the drop directory until interrupted.

use std::sync::Arc;

use owo_colors::OwoColorize;
use tracing::{error, info, warn};

use super::{DirOverrides, build_engine, load_config, open_ledger, wait_for_termination};
use crate::error::{DropmarkError, Result};
use crate::frontend::DropWatcher;
use crate::hooks::{HookContext, HookEvent};
use crate::instance::InstanceGuard;
use crate::paths;
use crate::shutdown::{ShutdownTrigger, shutdown_channel};

#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub dirs: DirOverrides,
}

pub async fn cmd_run(options: RunOptions) -> Result<()> {
    let config = load_config(&options.dirs)?;
    if !config.drop_dir.is_dir() {
        return Err(DropmarkError::DropDirMissing(config.drop_dir.clone()));
    }
    crate::fs::ensure_dir(&config.output_dir)?;

    let guard = Arc::new(
        InstanceGuard::acquire(
            &paths::instance_path(),
            config.engine.heartbeat_grace(),
            config.engine.shutdown_grace(),
        )
        .await?,
    );
    let owner = guard.owner();
    info!(pid = owner.pid, instance_id = %owner.instance_id, "instance record claimed");

    let ledger = open_ledger(&config)?;
    let (trigger, signal) = shutdown_channel();
    let engine = build_engine(&config, ledger, owner, signal.clone())?;

    let report = engine.recover()?;
    if !report.completed.is_empty() || !report.reclaimable.is_empty() {
        info!(
            completed = report.completed.len(),
            reclaimable = report.reclaimable.len(),
            "startup recovery finished"
        );
    }

    let heartbeat = spawn_instance_heartbeat(
        Arc::clone(&guard),
        config.engine.heartbeat_interval(),
        trigger.clone(),
    );

    let watcher = DropWatcher::start(
        &config.drop_dir,
        config.recursive,
        config.engine.rescan_interval(),
    )?;
    engine
        .hooks()
        .run(
            HookEvent::WatcherStarted,
            HookContext::new().with_source(&config.drop_dir),
        )
        .await;
    eprintln!(
        "{} {} -> {} (Ctrl-C to stop)",
        "Watching".green().bold(),
        config.drop_dir.display(),
        config.output_dir.display()
    );

    let watching = watcher.run(&engine, signal);
    tokio::pin!(watching);
    let watch_result = tokio::select! {
        result = &mut watching => result,
        _ = wait_for_termination() => {
            info!("interrupt received, shutting down");
            trigger.trigger();
            watching.await
        }
    };
    trigger.trigger();
    if let Err(e) = &watch_result {
        error!("watcher stopped: {}", e);
    }

    let shutdown = engine.shutdown().await;
    info!(
        finished = shutdown.finished,
        abandoned = shutdown.abandoned.len(),
        "engine stopped"
    );

    heartbeat.abort();
    let _ = heartbeat.await;
    match Arc::into_inner(guard) {
        Some(guard) => guard.release()?,
        None => warn!("instance record still referenced at exit, leaving it to expire"),
    }

    watch_result
}

/// Renew the instance record until aborted. Losing the record to another
/// instance stops this one.
fn spawn_instance_heartbeat(
    guard: Arc<InstanceGuard>,
    interval: std::time::Duration,
    trigger: ShutdownTrigger,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let guard = Arc::clone(&guard);
            match tokio::task::spawn_blocking(move || guard.heartbeat()).await {
                Ok(Ok(())) => {}
                Ok(Err(e @ DropmarkError::InstanceConflict { .. })) => {
                    warn!("{}; stopping", e);
                    trigger.trigger();
                    return;
                }
                Ok(Err(e)) => warn!("instance heartbeat failed: {}", e),
                Err(e) => warn!("instance heartbeat task failed: {}", e),
            }
        }
    })
}
