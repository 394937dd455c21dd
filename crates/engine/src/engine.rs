//! The engine proper: facade operations and the per-transfer send loop.

use crate::anchor::{AnchorKind, HashAnchor};
use crate::events::{EventKind, SubscriptionBus, Subscription};
use crate::{deadline, incoming};
use firma_crypto::{generate_transfer_code, hash_bytes};
use firma_store::sql::SignOutcome;
use firma_store::{NewDocument, NewRecipient, NewTransferRequest, StoreCoordinator};
use firma_transport::{
    IncomingEnvelope, OutgoingDocument, OutgoingRecipient, OutgoingTransfer, RecipientResult,
    RegistryEvent, TransportDescriptor, TransportRegistry,
};
use firma_types::{
    BlobSlot, EngineConfig, EngineError, Recipient, RecipientStatus, SenderInfo, Transfer,
    TransferBundle, TransferDirection, TransferMetadata, TransferStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Retry gaps for retryable send failures on resume-capable transports:
/// the initial attempt plus one retry per entry, so a recipient is tried at
/// most five times over 1s + 2s + 4s + 8s of backoff.
const SEND_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

/// Digits in the pickup code stamped on outgoing transfers.
const TRANSFER_CODE_DIGITS: usize = 6;

/// One document of a new outgoing transfer.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub id: Option<String>,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// One recipient of a new outgoing transfer.
#[derive(Debug, Clone)]
pub struct RecipientInput {
    pub identifier: String,
    pub transport: String,
    pub preferences: Option<serde_json::Value>,
}

/// Facade request creating an outgoing transfer.
#[derive(Debug, Clone)]
pub struct CreateTransfer {
    pub transfer_id: Option<String>,
    pub documents: Vec<DocumentInput>,
    pub recipients: Vec<RecipientInput>,
    pub metadata: TransferMetadata,
    pub transport_config: Option<serde_json::Value>,
}

/// One signature in a `submit_signatures` call.
#[derive(Debug, Clone)]
pub struct SignatureInput {
    pub document_id: String,
    pub signed_by: String,
    /// The signed rendition of the document.
    pub signed_bytes: Vec<u8>,
}

pub struct TransferEngine {
    coordinator: Arc<StoreCoordinator>,
    registry: Arc<TransportRegistry>,
    bus: SubscriptionBus,
    anchor: Arc<dyn HashAnchor>,
    config: EngineConfig,
    /// This node's identity, stamped as the sender of outgoing frames.
    local_sender: SenderInfo,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TransferEngine {
    pub fn new(
        coordinator: Arc<StoreCoordinator>,
        registry: Arc<TransportRegistry>,
        bus: SubscriptionBus,
        anchor: Arc<dyn HashAnchor>,
        config: EngineConfig,
        local_sender: SenderInfo,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            coordinator,
            registry,
            bus,
            anchor,
            config,
            local_sender,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Spawns the background machinery: the incoming worker pool, the
    /// deadline sweeper, and the registry-event pump.
    pub fn start(
        self: &Arc<Self>,
        incoming_rx: mpsc::Receiver<IncomingEnvelope>,
        mut registry_events: mpsc::Receiver<RegistryEvent>,
    ) {
        let mut tasks = self.tasks.lock();

        tasks.extend(incoming::spawn_workers(
            self,
            incoming_rx,
            self.config.receive_workers,
            self.shutdown_tx.subscribe(),
        ));

        tasks.push(tokio::spawn(deadline::run_sweeper(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        )));

        let bus = self.bus.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    event = registry_events.recv() => match event {
                        None => break,
                        Some(RegistryEvent::TransportError { transport, code, message }) => {
                            bus.publish("", EventKind::TransportError { transport, code, message });
                        }
                        Some(RegistryEvent::ShutdownTimeout { transport }) => {
                            bus.publish("", EventKind::TransportError {
                                transport,
                                code: "OperationFailed".into(),
                                message: "did not quiesce within the graceful window".into(),
                            });
                        }
                    },
                }
            }
        }));
    }

    /// Stops background tasks. In-flight sends observe the signal between
    /// attempts.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send(true).ok();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            task.await.ok();
        }
    }

    pub fn subscribe(&self, transfer_id: Option<&str>) -> Subscription {
        match transfer_id {
            Some(id) => self.bus.subscribe_transfer(id),
            None => self.bus.subscribe_all(),
        }
    }

    pub async fn get_transfer(&self, transfer_id: &str) -> Result<TransferBundle, EngineError> {
        Ok(self.coordinator.get_transfer(transfer_id).await?)
    }

    pub async fn list_transfers(
        &self,
        direction: Option<TransferDirection>,
        status: Option<TransferStatus>,
        limit: u32,
    ) -> Result<Vec<Transfer>, EngineError> {
        Ok(self
            .coordinator
            .list_transfers(direction, status, limit)
            .await?)
    }

    pub async fn get_document_bytes(
        &self,
        transfer_id: &str,
        document_id: &str,
        slot: BlobSlot,
        verify: bool,
    ) -> Result<Vec<u8>, EngineError> {
        Ok(self
            .coordinator
            .document_bytes(transfer_id, document_id, slot, verify)
            .await?)
    }

    pub async fn get_transports(&self) -> Vec<TransportDescriptor> {
        self.registry.descriptors().await
    }

    /// Creates an outgoing transfer and kicks off its send in the
    /// background. Returns once the transfer is durable in `pending`.
    pub async fn create_outgoing_transfer(
        self: &Arc<Self>,
        mut input: CreateTransfer,
    ) -> Result<TransferBundle, EngineError> {
        if input.metadata.transfer_code.is_none() {
            input.metadata.transfer_code = Some(generate_transfer_code(TRANSFER_CODE_DIGITS)?);
        }
        let transport_name = input
            .recipients
            .first()
            .map(|r| r.transport.clone())
            .unwrap_or_default();
        let request = NewTransferRequest {
            transfer_id: input.transfer_id.unwrap_or_default(),
            transport_name,
            transport_config: input.transport_config,
            metadata: input.metadata,
            sender: None,
            documents: input
                .documents
                .into_iter()
                .map(|d| NewDocument {
                    id: d.id.unwrap_or_default(),
                    file_name: d.file_name,
                    bytes: d.bytes,
                })
                .collect(),
            recipients: input
                .recipients
                .into_iter()
                .map(|r| NewRecipient {
                    id: String::new(),
                    identifier: r.identifier,
                    transport: r.transport,
                    preferences: r.preferences,
                })
                .collect(),
        };

        let bundle = self.coordinator.create_outgoing_transfer(request).await?;
        self.bus.publish(&bundle.transfer.id, EventKind::Created);
        self.spawn_send(bundle.transfer.id.clone());
        Ok(bundle)
    }

    pub(crate) fn spawn_send(self: &Arc<Self>, transfer_id: String) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.run_send(&transfer_id).await {
                tracing::warn!(
                    target: "engine",
                    event = "send_task_failed",
                    transfer_id = %transfer_id,
                    error = %e
                );
            }
        });
        self.tasks.lock().push(handle);
    }

    fn announce_status(&self, transfer_id: &str, status: TransferStatus) {
        self.bus
            .publish(transfer_id, EventKind::Status { status });
    }

    /// Drives one outgoing transfer from `pending` to its post-send state.
    async fn run_send(&self, transfer_id: &str) -> Result<(), EngineError> {
        let transfer = match self
            .coordinator
            .update_status(transfer_id, TransferStatus::Sending)
            .await
        {
            Ok(t) => t,
            // Cancelled (or otherwise already moved on) before the send
            // task got scheduled.
            Err(e) => {
                tracing::debug!(target: "engine", event = "send_skipped", transfer_id, error = %e);
                return Ok(());
            }
        };
        self.announce_status(transfer_id, TransferStatus::Sending);

        let bundle = self.coordinator.get_transfer(transfer_id).await?;
        let mut documents = Vec::with_capacity(bundle.documents.len());
        for document in &bundle.documents {
            let bytes = self
                .coordinator
                .document_bytes(transfer_id, &document.id, BlobSlot::Original, false)
                .await?;
            documents.push(OutgoingDocument {
                id: document.id.clone(),
                file_name: document.file_name.clone(),
                mime_type: guess_mime(&document.file_name),
                bytes,
                hash: document.content_hash.clone(),
            });
        }

        let mut final_results: HashMap<String, RecipientResult> = HashMap::new();
        let mut wave: Vec<Recipient> = bundle.recipients.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outgoing = OutgoingTransfer {
                transfer_id: transfer_id.to_string(),
                documents: documents.clone(),
                recipients: wave
                    .iter()
                    .map(|r| OutgoingRecipient {
                        id: r.id.clone(),
                        identifier: r.identifier.clone(),
                        transport: r.transport.clone(),
                        preferences: r.preferences.clone(),
                    })
                    .collect(),
                sender: self.sender_stamp(),
                options: return_options(&transfer.metadata),
            };
            let result = self.registry.route(outgoing).await;

            let mut retry_wave = Vec::new();
            for (recipient, outcome) in wave.drain(..).zip(result.recipient_results) {
                let resumable = self
                    .registry
                    .capabilities_of(&recipient.transport)
                    .map(|c| c.supports_resume)
                    .unwrap_or(false);
                let retry = !outcome.success
                    && outcome.retryable
                    && resumable
                    && attempt <= SEND_BACKOFF.len();
                final_results.insert(recipient.id.clone(), outcome);
                if retry {
                    retry_wave.push(recipient);
                }
            }

            if retry_wave.is_empty() {
                break;
            }

            // Between attempts is where cancellation lands: remaining
            // recipients finish as `Cancelled`, not `Failed`.
            let current = self.coordinator.get_transfer(transfer_id).await?;
            if current.transfer.status == TransferStatus::Cancelled || *self.shutdown_tx.borrow() {
                for recipient in retry_wave {
                    if let Some(result) = final_results.get_mut(&recipient.id) {
                        result.error = Some("Cancelled".into());
                        result.detail = Some("send cancelled between attempts".into());
                    }
                }
                return Ok(());
            }

            // `retry_wave` is only non-empty when `attempt <= SEND_BACKOFF.len()`.
            let backoff = SEND_BACKOFF[attempt - 1];
            tracing::info!(
                target: "engine",
                event = "send_retry",
                transfer_id,
                attempt,
                recipients = retry_wave.len(),
                backoff_secs = backoff.as_secs()
            );
            tokio::time::sleep(backoff).await;
            wave = retry_wave;
        }

        let succeeded: Vec<String> = bundle
            .recipients
            .iter()
            .filter(|r| {
                final_results
                    .get(&r.id)
                    .map(|result| result.success)
                    .unwrap_or(false)
            })
            .map(|r| r.id.clone())
            .collect();

        if succeeded.is_empty() {
            let reason = bundle
                .recipients
                .first()
                .and_then(|r| final_results.get(&r.id))
                .and_then(|result| result.error.clone())
                .unwrap_or_else(|| "OperationFailed".into());
            if self
                .coordinator
                .update_status(transfer_id, TransferStatus::Failed)
                .await
                .is_ok()
            {
                self.bus
                    .publish(transfer_id, EventKind::Failed { reason });
            }
            return Ok(());
        }

        self.coordinator
            .update_status(transfer_id, TransferStatus::Sent)
            .await?;
        self.announce_status(transfer_id, TransferStatus::Sent);

        // A transport ack means the recipient's node holds the transfer:
        // the recipient is notified and the transfer delivered.
        let moves: Vec<(String, RecipientStatus)> = succeeded
            .iter()
            .map(|id| (id.clone(), RecipientStatus::Notified))
            .collect();
        self.coordinator
            .update_status_with_recipients(transfer_id, Some(TransferStatus::Delivered), moves)
            .await?;
        self.announce_status(transfer_id, TransferStatus::Delivered);
        for recipient_id in succeeded {
            self.bus
                .publish(transfer_id, EventKind::Delivered { recipient_id });
        }
        Ok(())
    }

    /// Submits signatures for documents of a transfer. The first signer
    /// wins; the loser gets `AlreadySigned`. Signing the document of an
    /// incoming transfer creates the return transfer in the same
    /// transaction and starts sending it.
    pub async fn submit_signatures(
        self: &Arc<Self>,
        transfer_id: &str,
        signatures: Vec<SignatureInput>,
    ) -> Result<TransferBundle, EngineError> {
        let bundle = self.coordinator.get_transfer(transfer_id).await?;
        if bundle.transfer.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: bundle.transfer.status,
                to: TransferStatus::Signing,
            });
        }
        if bundle
            .transfer
            .status
            .can_transition_to(TransferStatus::Signing)
        {
            // A concurrent signer may have moved the transfer already; the
            // per-document guard below is the one that decides winners.
            match self
                .coordinator
                .update_status(transfer_id, TransferStatus::Signing)
                .await
            {
                Ok(_) => self.announce_status(transfer_id, TransferStatus::Signing),
                Err(firma_types::StoreError::InvalidRecord(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        for signature in signatures {
            let signed_hash = hash_bytes(&signature.signed_bytes);
            let return_request = match (&bundle.transfer.direction, &bundle.transfer.sender) {
                (TransferDirection::Incoming, Some(sender)) => Some(build_return_request(
                    &bundle,
                    &signature,
                    sender,
                )),
                _ => None,
            };

            let result = self
                .coordinator
                .sign_document(
                    transfer_id,
                    &signature.document_id,
                    &signature.signed_by,
                    signature.signed_bytes.clone(),
                    return_request,
                )
                .await?;

            match result.outcome {
                SignOutcome::AlreadySigned(existing) => {
                    return Err(EngineError::AlreadySigned {
                        document_id: signature.document_id,
                        signed_by: existing.signed_by.unwrap_or_default(),
                    });
                }
                SignOutcome::Signed(document) => {
                    self.bus.publish(
                        transfer_id,
                        EventKind::Signed {
                            document_id: document.id.clone(),
                            signed_by: signature.signed_by.clone(),
                        },
                    );
                    if let Ok(Some(tx_id)) = self
                        .anchor
                        .anchor(transfer_id, &signed_hash, AnchorKind::Signed)
                        .await
                    {
                        self.coordinator
                            .record_anchor(transfer_id, &document.id, BlobSlot::Signed, &tx_id)
                            .await
                            .ok();
                    }
                }
            }

            // An outgoing transfer tracks signing progress on its
            // recipient rows.
            let moves: Vec<(String, RecipientStatus)> = bundle
                .recipients
                .iter()
                .filter(|r| r.identifier == signature.signed_by)
                .map(|r| (r.id.clone(), RecipientStatus::Signed))
                .collect();
            if !moves.is_empty() {
                self.coordinator
                    .update_status_with_recipients(transfer_id, None, moves)
                    .await?;
            }

            if let Some(return_bundle) = result.return_transfer {
                self.bus
                    .publish(&return_bundle.transfer.id, EventKind::Created);
                self.spawn_send(return_bundle.transfer.id.clone());
            }
        }

        self.finish_completion(transfer_id).await
    }

    /// Re-evaluates the completion rule and advances the transfer when it
    /// is met.
    pub(crate) async fn finish_completion(
        &self,
        transfer_id: &str,
    ) -> Result<TransferBundle, EngineError> {
        let bundle = self.coordinator.get_transfer(transfer_id).await?;
        if let Some(next) = evaluate_completion(&bundle) {
            if bundle.transfer.status != next && bundle.transfer.status.can_transition_to(next) {
                match self.coordinator.update_status(transfer_id, next).await {
                    Ok(_) => {
                        self.announce_status(transfer_id, next);
                        if next == TransferStatus::Completed {
                            self.bus.publish(transfer_id, EventKind::Completed);
                        }
                    }
                    // Lost a completion race; the committed state stands.
                    Err(firma_types::StoreError::InvalidRecord(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(self.coordinator.get_transfer(transfer_id).await?)
    }

    /// Folds a delivery receipt into the recipient row and the transfer.
    pub async fn mark_delivered(
        &self,
        transfer_id: &str,
        recipient_id: &str,
    ) -> Result<TransferBundle, EngineError> {
        let bundle = self.coordinator.get_transfer(transfer_id).await?;
        let next = bundle
            .transfer
            .status
            .can_transition_to(TransferStatus::Delivered)
            .then_some(TransferStatus::Delivered);
        let updated = self
            .coordinator
            .update_status_with_recipients(
                transfer_id,
                next,
                vec![(recipient_id.to_string(), RecipientStatus::Notified)],
            )
            .await?;
        if next.is_some() {
            self.announce_status(transfer_id, TransferStatus::Delivered);
        }
        self.bus.publish(
            transfer_id,
            EventKind::Delivered {
                recipient_id: recipient_id.to_string(),
            },
        );
        Ok(updated)
    }

    /// Folds a view receipt into the recipient row and the transfer.
    pub async fn mark_viewed(
        &self,
        transfer_id: &str,
        recipient_id: &str,
    ) -> Result<TransferBundle, EngineError> {
        let bundle = self.coordinator.get_transfer(transfer_id).await?;
        let next = bundle
            .transfer
            .status
            .can_transition_to(TransferStatus::Opened)
            .then_some(TransferStatus::Opened);
        let updated = self
            .coordinator
            .update_status_with_recipients(
                transfer_id,
                next,
                vec![(recipient_id.to_string(), RecipientStatus::Viewed)],
            )
            .await?;
        if next.is_some() {
            self.announce_status(transfer_id, TransferStatus::Opened);
        }
        Ok(updated)
    }

    /// Cancels a transfer still in `pending` or `sending`. Terminal
    /// transfers are a no-op; anything else is an invalid transition.
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<Transfer, EngineError> {
        let bundle = self.coordinator.get_transfer(transfer_id).await?;
        if bundle.transfer.status.is_terminal() {
            return Ok(bundle.transfer);
        }
        if !bundle
            .transfer
            .status
            .can_transition_to(TransferStatus::Cancelled)
        {
            return Err(EngineError::InvalidTransition {
                from: bundle.transfer.status,
                to: TransferStatus::Cancelled,
            });
        }
        let transfer = self
            .coordinator
            .update_status(transfer_id, TransferStatus::Cancelled)
            .await?;
        self.announce_status(transfer_id, TransferStatus::Cancelled);
        Ok(transfer)
    }

    /// Fails every non-terminal transfer whose deadline has passed. Driven
    /// by the single sweeper tick.
    pub(crate) async fn expire_overdue(&self) {
        let now = firma_telemetry::unix_millis();
        let transfers = match self.coordinator.active_transfers().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(target: "engine", event = "sweep_failed", error = %e);
                return;
            }
        };
        for transfer in transfers {
            let Some(deadline) = transfer.metadata.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            // The state machine guard makes this exactly-once: a transfer
            // that already went terminal refuses the update and publishes
            // nothing.
            match self
                .coordinator
                .update_status(&transfer.id, TransferStatus::Failed)
                .await
            {
                Ok(_) => {
                    tracing::info!(target: "engine", event = "expired", transfer_id = %transfer.id);
                    self.bus.publish(
                        &transfer.id,
                        EventKind::Failed {
                            reason: "Expired".into(),
                        },
                    );
                }
                Err(e) => {
                    tracing::debug!(target: "engine", event = "expire_skipped", transfer_id = %transfer.id, error = %e);
                }
            }
        }
    }

    pub(crate) fn deadline_tick(&self) -> Duration {
        Duration::from_secs(self.config.deadline_tick_secs)
    }

    pub(crate) fn coordinator(&self) -> &StoreCoordinator {
        &self.coordinator
    }

    fn sender_stamp(&self) -> SenderInfo {
        SenderInfo {
            timestamp: firma_telemetry::unix_millis(),
            ..self.local_sender.clone()
        }
    }

    /// Ingests one envelope from a transport: persist, announce, and fold
    /// return legs into their original transfer.
    pub(crate) async fn handle_incoming(
        self: &Arc<Self>,
        envelope: IncomingEnvelope,
    ) -> Result<(), EngineError> {
        let is_return = envelope
            .options
            .as_ref()
            .and_then(|o| o.get("returnTransport"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let original_id = envelope
            .options
            .as_ref()
            .and_then(|o| o.get("originalTransferId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let request = NewTransferRequest {
            transfer_id: envelope.transfer_id.clone(),
            transport_name: envelope.transport.clone(),
            transport_config: None,
            metadata: TransferMetadata {
                return_transport: is_return,
                original_transfer_id: original_id.clone(),
                ..TransferMetadata::default()
            },
            sender: Some(envelope.sender.clone()),
            documents: envelope
                .documents
                .iter()
                .map(|d| NewDocument {
                    id: d.id.clone(),
                    file_name: d.file_name.clone(),
                    bytes: d.bytes.clone(),
                })
                .collect(),
            recipients: Vec::new(),
        };

        let bundle = self.coordinator.ingest_incoming_transfer(request).await?;
        tracing::info!(
            target: "engine",
            event = "incoming_ingested",
            transfer_id = %bundle.transfer.id,
            from = %envelope.sender.sender_id,
            return_leg = is_return
        );
        self.bus.publish(&bundle.transfer.id, EventKind::Created);

        if is_return {
            if let Some(original_id) = original_id {
                self.fold_return_leg(&original_id, &envelope).await?;
            }
        }
        Ok(())
    }

    /// A return leg carries the signed rendition back to the originator:
    /// the original outgoing transfer's documents go `signed`, the matching
    /// recipient climbs to `signed`, and the completion rule is re-checked.
    async fn fold_return_leg(
        &self,
        original_id: &str,
        envelope: &IncomingEnvelope,
    ) -> Result<(), EngineError> {
        let original = match self.coordinator.get_transfer(original_id).await {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!(
                    target: "engine",
                    event = "return_leg_orphan",
                    original_id,
                    error = %e
                );
                return Ok(());
            }
        };
        if original.transfer.direction != TransferDirection::Outgoing {
            return Ok(());
        }

        for incoming_doc in &envelope.documents {
            let target = original
                .documents
                .iter()
                .find(|d| d.id == incoming_doc.id)
                .or_else(|| {
                    original
                        .documents
                        .iter()
                        .find(|d| d.file_name == incoming_doc.file_name)
                });
            let Some(target) = target else {
                continue;
            };
            let result = self
                .coordinator
                .sign_document(
                    original_id,
                    &target.id,
                    &envelope.sender.sender_id,
                    incoming_doc.bytes.clone(),
                    None,
                )
                .await?;
            if let SignOutcome::Signed(document) = result.outcome {
                self.bus.publish(
                    original_id,
                    EventKind::Signed {
                        document_id: document.id,
                        signed_by: envelope.sender.sender_id.clone(),
                    },
                );
                if let Ok(Some(tx_id)) = self
                    .anchor
                    .anchor(original_id, &incoming_doc.hash, AnchorKind::Signed)
                    .await
                {
                    self.coordinator
                        .record_anchor(original_id, &target.id, BlobSlot::Signed, &tx_id)
                        .await
                        .ok();
                }
            }
        }

        let moves: Vec<(String, RecipientStatus)> = original
            .recipients
            .iter()
            .filter(|r| r.identifier == envelope.sender.sender_id)
            .map(|r| (r.id.clone(), RecipientStatus::Signed))
            .collect();
        if !moves.is_empty() {
            self.coordinator
                .update_status_with_recipients(original_id, None, moves)
                .await?;
        }

        self.finish_completion(original_id).await?;
        Ok(())
    }
}

/// Builds the return transfer created in the same transaction that marks
/// an inbound document signed.
fn build_return_request(
    bundle: &TransferBundle,
    signature: &SignatureInput,
    sender: &SenderInfo,
) -> NewTransferRequest {
    let file_name = bundle
        .documents
        .iter()
        .find(|d| d.id == signature.document_id)
        .map(|d| d.file_name.clone())
        .unwrap_or_else(|| format!("{}.signed", signature.document_id));
    NewTransferRequest {
        transfer_id: String::new(),
        transport_name: sender.transport.clone(),
        transport_config: None,
        metadata: TransferMetadata {
            return_transport: true,
            original_transfer_id: Some(bundle.transfer.id.clone()),
            ..TransferMetadata::default()
        },
        sender: None,
        // A fresh row id: the signed rendition is its own document. The
        // originator matches it back to the original by file name.
        documents: vec![NewDocument {
            id: String::new(),
            file_name,
            bytes: signature.signed_bytes.clone(),
        }],
        recipients: vec![NewRecipient {
            id: String::new(),
            identifier: sender.sender_id.clone(),
            transport: sender.transport.clone(),
            preferences: None,
        }],
    }
}

/// The completion rule: `require_all_signatures` demands everyone,
/// `false` lowers the bar to anyone, `required_signature_count` overrides
/// both. Outgoing transfers count signed recipients, incoming transfers
/// signed documents.
fn evaluate_completion(bundle: &TransferBundle) -> Option<TransferStatus> {
    let (signed, total) = match bundle.transfer.direction {
        TransferDirection::Outgoing => (
            bundle
                .recipients
                .iter()
                .filter(|r| r.status == RecipientStatus::Signed)
                .count(),
            bundle.recipients.len(),
        ),
        TransferDirection::Incoming => (
            bundle
                .documents
                .iter()
                .filter(|d| d.status == firma_types::DocumentStatus::Signed)
                .count(),
            bundle.documents.len(),
        ),
    };
    if total == 0 || signed == 0 {
        return None;
    }
    let required = match bundle.transfer.metadata.required_signature_count {
        Some(count) => (count as usize).min(total),
        None if bundle.transfer.metadata.require_all_signatures => total,
        None => 1,
    };
    if signed >= required {
        Some(TransferStatus::Completed)
    } else {
        Some(TransferStatus::PartiallySigned)
    }
}

/// The options object the return leg is recognized by on the remote side.
fn return_options(metadata: &TransferMetadata) -> Option<serde_json::Value> {
    if !metadata.return_transport {
        return None;
    }
    Some(serde_json::json!({
        "returnTransport": true,
        "originalTransferId": metadata.original_transfer_id,
    }))
}

fn guess_mime(file_name: &str) -> String {
    let extension = file_name.rsplit('.').next().unwrap_or_default();
    match extension.to_ascii_lowercase().as_str() {
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests;
