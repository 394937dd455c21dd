//! The deadline sweeper.
//!
//! One supervisor timer for the whole process, not a task per transfer:
//! each tick scans the non-terminal transfers and fails the overdue ones
//! with reason `Expired`.

use crate::engine::TransferEngine;
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) async fn run_sweeper(engine: Arc<TransferEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(engine.deadline_tick());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of `interval` fires immediately; skip it so a transfer
    // created moments ago is not swept before its send task runs.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                engine.expire_overdue().await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(target: "engine", event = "sweeper_stopped");
}
