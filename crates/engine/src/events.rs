//! The subscription bus.
//!
//! Observers subscribe to one transfer or to the global firehose. Delivery
//! is best-effort over a bounded broadcast buffer: a subscriber that falls
//! behind sees a `Lag` marker with the number of dropped events and never
//! blocks the producer. Nothing is persisted; reconnecting clients refetch
//! state.

use firma_telemetry::unix_millis;
use firma_types::TransferStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default per-subscriber buffer.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventKind {
    Created,
    Status { status: TransferStatus },
    Delivered { recipient_id: String },
    Signed { document_id: String, signed_by: String },
    Completed,
    Failed { reason: String },
    TransportError { transport: String, code: String, message: String },
}

impl EventKind {
    /// The wire name observers filter on.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "transfer:created",
            Self::Status { .. } => "transfer:status",
            Self::Delivered { .. } => "transfer:delivered",
            Self::Signed { .. } => "transfer:signed",
            Self::Completed => "transfer:completed",
            Self::Failed { .. } => "transfer:failed",
            Self::TransportError { .. } => "transport:error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Empty for process-level events (`transport:error` without a
    /// transfer).
    pub transfer_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Unix milliseconds at publish time.
    pub at: i64,
}

/// What a subscriber pulls: an event, or a marker that `0..n` events were
/// dropped while it lagged.
#[derive(Debug, Clone, PartialEq)]
pub enum BusItem {
    Event(TransferEvent),
    Lag(u64),
}

#[derive(Clone)]
pub struct SubscriptionBus {
    tx: broadcast::Sender<TransferEvent>,
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SubscriptionBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes to every live subscriber. Lossy: nobody listening is fine,
    /// slow listeners drop their oldest events.
    pub fn publish(&self, transfer_id: &str, kind: EventKind) {
        let event = TransferEvent {
            transfer_id: transfer_id.to_string(),
            kind,
            at: unix_millis(),
        };
        tracing::debug!(
            target: "bus",
            event = event.kind.name(),
            transfer_id = %event.transfer_id
        );
        let _ = self.tx.send(event);
    }

    /// The global firehose.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter: None,
        }
    }

    /// Events for one transfer only. Lag markers are delivered regardless of
    /// the filter: dropped events might have matched.
    pub fn subscribe_transfer(&self, transfer_id: &str) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter: Some(transfer_id.to_string()),
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<TransferEvent>,
    filter: Option<String>,
}

impl Subscription {
    /// The next item, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(filter) = &self.filter {
                        if &event.transfer_id != filter {
                            continue;
                        }
                    }
                    return Some(BusItem::Event(event));
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    return Some(BusItem::Lag(dropped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
