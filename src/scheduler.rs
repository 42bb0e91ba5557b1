//! Fixed-cadence triggers for each pipeline family plus the heartbeat.
//!
//! Each family gets its own loop: wait for the initial delay, then tick at
//! the configured interval. Missed ticks are skipped rather than bunched
//! up, and a tick that lands while the family is still running is dropped.
//! Cancelling the token ends every loop; a run already in flight finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScheduleConfig;
use crate::coordinator::RunCoordinator;
use crate::error::SyncError;
use crate::models::PipelineFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub initial_delay: Duration,
    pub period: Duration,
}

/// Cadence per family and for the heartbeat, from config.
pub fn cadences(config: &ScheduleConfig) -> (Vec<(PipelineFamily, Cadence)>, Cadence) {
    let secs = Duration::from_secs;
    let families = vec![
        (
            PipelineFamily::Backup,
            Cadence {
                initial_delay: secs(config.backup_initial_delay_secs),
                period: secs(config.backup_interval_secs),
            },
        ),
        (
            PipelineFamily::Library,
            Cadence {
                initial_delay: secs(config.library_initial_delay_secs),
                period: secs(config.library_interval_secs),
            },
        ),
        (
            PipelineFamily::Media,
            Cadence {
                initial_delay: secs(config.media_initial_delay_secs),
                period: secs(config.media_interval_secs),
            },
        ),
    ];
    let heartbeat = Cadence {
        initial_delay: Duration::ZERO,
        period: secs(config.heartbeat_interval_secs),
    };
    (families, heartbeat)
}

/// Spawn one loop per family plus the heartbeat loop.
pub fn spawn(
    coordinator: Arc<RunCoordinator>,
    families: Vec<(PipelineFamily, Cadence)>,
    heartbeat: Cadence,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles: Vec<JoinHandle<()>> = families
        .into_iter()
        .map(|(family, cadence)| {
            tokio::spawn(family_loop(
                coordinator.clone(),
                family,
                cadence,
                cancel.clone(),
            ))
        })
        .collect();
    handles.push(tokio::spawn(heartbeat_loop(coordinator, heartbeat, cancel)));
    handles
}

fn ticker(cadence: Cadence) -> Interval {
    // interval_at panics on a zero period.
    let period = if cadence.period.is_zero() {
        Duration::from_secs(1)
    } else {
        cadence.period
    };
    let mut ticker = interval_at(Instant::now() + cadence.initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn family_loop(
    coordinator: Arc<RunCoordinator>,
    family: PipelineFamily,
    cadence: Cadence,
    cancel: CancellationToken,
) {
    info!(
        family = %family,
        delay_secs = cadence.initial_delay.as_secs(),
        every_secs = cadence.period.as_secs(),
        "scheduled"
    );
    let mut ticker = ticker(cadence);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(family = %family, "schedule stopped");
                break;
            }
            _ = ticker.tick() => {
                match coordinator.run_once(family).await {
                    Ok(_) => {}
                    Err(SyncError::RunInProgress(_)) => {
                        info!(family = %family, "previous run still active, tick dropped");
                    }
                    Err(e) => warn!(family = %family, error = %e, "scheduled run failed"),
                }
            }
        }
    }
}

async fn heartbeat_loop(coordinator: Arc<RunCoordinator>, cadence: Cadence, cancel: CancellationToken) {
    let mut ticker = ticker(cadence);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => coordinator.heartbeat().await,
        }
    }
}
