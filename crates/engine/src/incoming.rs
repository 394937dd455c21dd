//! Worker pool draining the registry's incoming-envelope channel.
//!
//! Transports publish `IncomingEnvelope` values into one shared channel; a
//! small pool of workers consumes it and drives the engine. Stopping is by
//! the engine's shutdown signal or by the channel closing.

use crate::engine::TransferEngine;
use firma_transport::IncomingEnvelope;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub(crate) fn spawn_workers(
    engine: &Arc<TransferEngine>,
    incoming_rx: mpsc::Receiver<IncomingEnvelope>,
    count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let incoming_rx = Arc::new(tokio::sync::Mutex::new(incoming_rx));
    (0..count.max(1))
        .map(|worker| {
            let engine = Arc::clone(engine);
            let incoming_rx = Arc::clone(&incoming_rx);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                        envelope = async { incoming_rx.lock().await.recv().await } => {
                            match envelope {
                                None => break,
                                Some(envelope) => envelope,
                            }
                        }
                    };
                    let transfer_id = envelope.transfer_id.clone();
                    if let Err(e) = engine.handle_incoming(envelope).await {
                        tracing::warn!(
                            target: "engine",
                            event = "incoming_rejected",
                            worker,
                            transfer_id = %transfer_id,
                            error = %e
                        );
                    }
                }
                tracing::debug!(target: "engine", event = "worker_stopped", worker);
            })
        })
        .collect()
}
