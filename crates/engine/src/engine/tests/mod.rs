use super::*;
use crate::anchor::NoopAnchor;
use crate::events::BusItem;
use async_trait::async_trait;
use firma_store::{BlobStore, Database};
use firma_transport::{
    Capabilities, IncomingDocument, RegistryEvent, Transport, TransportStatus, TransferResult,
};
use firma_types::{DocumentStatus, TransportError, VerificationStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// An in-process transport that immediately "delivers" every send back into
/// the local incoming channel, standing in for the remote node. Ids get a
/// `recv-` prefix (a real remote has its own store, the loopback shares
/// ours) and return-leg references are mapped back.
struct LoopbackTransport {
    deliver: bool,
    /// Identifiers that fail with `TransportUnavailable`.
    unreachable: Vec<String>,
    sink: Mutex<Option<tokio::sync::mpsc::Sender<IncomingEnvelope>>>,
    initialized: AtomicBool,
}

impl LoopbackTransport {
    fn new(deliver: bool, unreachable: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            deliver,
            unreachable: unreachable.iter().map(|s| s.to_string()).collect(),
            sink: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    fn mirror_options(options: &Option<serde_json::Value>) -> Option<serde_json::Value> {
        let options = options.as_ref()?;
        let original = options.get("originalTransferId")?.as_str()?;
        // The loopback prefixed the incoming copy; the return reference
        // must point at the true original on this node.
        Some(serde_json::json!({
            "returnTransport": options.get("returnTransport").cloned().unwrap_or_default(),
            "originalTransferId": original.strip_prefix("recv-").unwrap_or(original),
        }))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn version(&self) -> &'static str {
        "0.0-test"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_file_size: 1024 * 1024,
            supports_batch: true,
            supports_encryption: false,
            supports_notifications: true,
            supports_resume: false,
            required_config: Vec::new(),
        }
    }

    fn validate_config(&self, _raw: &serde_json::Value) -> bool {
        true
    }

    async fn initialize(&self, _config: &serde_json::Value) -> Result<(), TransportError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> TransportStatus {
        TransportStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            receiving: self.sink.lock().is_some(),
            active_transfers: 0,
            last_error: None,
        }
    }

    async fn send(&self, transfer: OutgoingTransfer) -> Result<TransferResult, TransportError> {
        let mut results = Vec::new();
        for recipient in &transfer.recipients {
            if self.unreachable.contains(&recipient.identifier) {
                results.push(RecipientResult::failed(
                    recipient,
                    &TransportError::Unavailable(recipient.identifier.clone()),
                ));
                continue;
            }
            if self.deliver {
                let sink = self.sink.lock().clone();
                if let Some(sink) = sink {
                    let envelope = IncomingEnvelope {
                        transport: "loop".into(),
                        transfer_id: format!("recv-{}", transfer.transfer_id),
                        documents: transfer
                            .documents
                            .iter()
                            .map(|d| IncomingDocument {
                                id: format!("recv-{}", d.id),
                                file_name: d.file_name.clone(),
                                mime_type: d.mime_type.clone(),
                                size: d.bytes.len() as u64,
                                bytes: d.bytes.clone(),
                                hash: d.hash.clone(),
                                metadata: None,
                            })
                            .collect(),
                        sender: transfer.sender.clone(),
                        options: Self::mirror_options(&transfer.options),
                    };
                    sink.send(envelope).await.ok();
                }
            }
            results.push(RecipientResult::ok(recipient));
        }
        Ok(TransferResult::from_results(transfer.transfer_id, results))
    }

    async fn start_receiving(
        &self,
        sink: tokio::sync::mpsc::Sender<IncomingEnvelope>,
    ) -> Result<(), TransportError> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn stop_receiving(&self) -> Result<(), TransportError> {
        *self.sink.lock() = None;
        Ok(())
    }
}

/// A resume-capable transport whose first `fail_first` sends time out.
/// Exercises the engine's bounded retry schedule.
struct FlakyTransport {
    fail_first: u32,
    attempts: std::sync::atomic::AtomicU32,
    initialized: AtomicBool,
}

impl FlakyTransport {
    fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            attempts: std::sync::atomic::AtomicU32::new(0),
            initialized: AtomicBool::new(false),
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn version(&self) -> &'static str {
        "0.0-test"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_file_size: 1024 * 1024,
            supports_batch: true,
            supports_encryption: false,
            supports_notifications: false,
            supports_resume: true,
            required_config: Vec::new(),
        }
    }

    fn validate_config(&self, _raw: &serde_json::Value) -> bool {
        true
    }

    async fn initialize(&self, _config: &serde_json::Value) -> Result<(), TransportError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> TransportStatus {
        TransportStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            receiving: false,
            active_transfers: 0,
            last_error: None,
        }
    }

    async fn send(&self, transfer: OutgoingTransfer) -> Result<TransferResult, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let results = transfer
            .recipients
            .iter()
            .map(|r| {
                if attempt <= self.fail_first {
                    RecipientResult::failed(r, &TransportError::SendTimeout)
                } else {
                    RecipientResult::ok(r)
                }
            })
            .collect();
        Ok(TransferResult::from_results(transfer.transfer_id, results))
    }

    async fn start_receiving(
        &self,
        _sink: tokio::sync::mpsc::Sender<IncomingEnvelope>,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stop_receiving(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct Fixture {
    engine: Arc<TransferEngine>,
    _dir: TempDir,
}

async fn fixture(transport: Arc<dyn Transport>, tick_secs: u64) -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let blobs = Arc::new(BlobStore::open(dir.path(), 16 * 1024 * 1024, None).unwrap());
    let coordinator = Arc::new(StoreCoordinator::new(db, blobs));

    let (incoming_tx, incoming_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel::<RegistryEvent>(64);
    let registry = Arc::new(TransportRegistry::new(incoming_tx, events_tx));
    let transport_name = transport.name().to_string();
    registry.register(transport);
    let mut configs = std::collections::BTreeMap::new();
    configs.insert(transport_name, serde_json::json!({}));
    registry.initialize_all(&configs).await.unwrap();

    let local_sender = SenderInfo {
        sender_id: "node-self".into(),
        name: "This Node".into(),
        email: None,
        public_key: None,
        transport: "loop".into(),
        timestamp: 0,
        verification: VerificationStatus::Verified,
    };
    let config = EngineConfig {
        deadline_tick_secs: tick_secs,
        receive_workers: 2,
        send_deadline_secs: 5,
    };
    let engine = TransferEngine::new(
        coordinator,
        registry,
        SubscriptionBus::new(256),
        Arc::new(NoopAnchor),
        config,
        local_sender,
    );
    engine.start(incoming_rx, events_rx);
    Fixture { engine, _dir: dir }
}

fn create_input(id: &str, recipients: Vec<RecipientInput>) -> CreateTransfer {
    CreateTransfer {
        transfer_id: Some(id.into()),
        documents: vec![DocumentInput {
            id: None,
            file_name: "contract.pdf".into(),
            bytes: b"hello world".to_vec(),
        }],
        recipients,
        metadata: TransferMetadata::default(),
        transport_config: None,
    }
}

fn self_recipient() -> RecipientInput {
    RecipientInput {
        identifier: "node-self".into(),
        transport: "loop".into(),
        preferences: None,
    }
}

/// Polls until the transfer reaches `status` or the timeout passes.
async fn wait_for_status(engine: &Arc<TransferEngine>, id: &str, status: TransferStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(bundle) = engine.get_transfer(id).await {
            if bundle.transfer.status == status {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("transfer {id} never reached {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_transfer(engine: &Arc<TransferEngine>, id: &str) -> TransferBundle {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(bundle) = engine.get_transfer(id).await {
            return bundle;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("transfer {id} never appeared");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_happy_path_send_sign_return_complete() {
    let fx = fixture(LoopbackTransport::new(true, &[]), 3600).await;
    let engine = &fx.engine;
    let mut subscription = engine.subscribe(Some("t1"));

    let bundle = engine
        .create_outgoing_transfer(create_input("t1", vec![self_recipient()]))
        .await
        .unwrap();
    assert_eq!(bundle.transfer.status, TransferStatus::Pending);
    // The pickup code supplement: six digits, assigned at creation.
    let code = bundle.transfer.metadata.transfer_code.clone().unwrap();
    assert_eq!(code.len(), 6);
    assert!(code.bytes().all(|b| b.is_ascii_digit()));

    wait_for_status(engine, "t1", TransferStatus::Delivered).await;

    // The loopback "remote" ingested its copy.
    let incoming = wait_for_transfer(engine, "recv-t1").await;
    assert_eq!(incoming.transfer.direction, TransferDirection::Incoming);
    assert_eq!(incoming.transfer.status, TransferStatus::Delivered);
    assert_eq!(
        incoming.transfer.sender.as_ref().unwrap().sender_id,
        "node-self"
    );

    // Sign the inbound copy; the return leg flows back and completes t1.
    let signed = engine
        .submit_signatures(
            "recv-t1",
            vec![SignatureInput {
                document_id: incoming.documents[0].id.clone(),
                signed_by: "local-user".into(),
                signed_bytes: b"signed rendition".to_vec(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(signed.transfer.status, TransferStatus::Completed);
    assert_eq!(signed.documents[0].status, DocumentStatus::Signed);

    wait_for_status(engine, "t1", TransferStatus::Completed).await;
    let done = engine.get_transfer("t1").await.unwrap();
    assert_eq!(done.documents[0].status, DocumentStatus::Signed);
    assert_eq!(done.recipients[0].status, RecipientStatus::Signed);

    // The signed artifact is in t1's signed slot.
    let signed_bytes = engine
        .get_document_bytes("t1", &done.documents[0].id, BlobSlot::Signed, true)
        .await
        .unwrap();
    assert_eq!(signed_bytes, b"signed rendition");

    // A return transfer exists: outgoing, flagged, addressed to the
    // original sender.
    let outgoing = engine
        .list_transfers(Some(TransferDirection::Outgoing), None, 50)
        .await
        .unwrap();
    let return_transfer = outgoing
        .iter()
        .find(|t| t.metadata.return_transport)
        .expect("return transfer missing");
    assert_eq!(
        return_transfer.metadata.original_transfer_id.as_deref(),
        Some("recv-t1")
    );
    let return_bundle = engine.get_transfer(&return_transfer.id).await.unwrap();
    assert_eq!(return_bundle.recipients[0].identifier, "node-self");

    // The status sequence seen on the bus is the committed order.
    let mut statuses = vec![];
    while let Ok(Some(item)) =
        tokio::time::timeout(Duration::from_millis(200), subscription.recv()).await
    {
        if let BusItem::Event(event) = item {
            match event.kind {
                EventKind::Status { status } => statuses.push(status),
                _ => {}
            }
        }
    }
    let positions: Vec<usize> = [
        TransferStatus::Sending,
        TransferStatus::Sent,
        TransferStatus::Delivered,
        TransferStatus::Completed,
    ]
    .iter()
    .map(|want| {
        statuses
            .iter()
            .position(|s| s == want)
            .unwrap_or_else(|| panic!("{want:?} missing from {statuses:?}"))
    })
    .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{statuses:?}");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_delivery_isolates_failed_recipient() {
    let fx = fixture(LoopbackTransport::new(true, &["peer-down"]), 3600).await;
    let engine = &fx.engine;

    engine
        .create_outgoing_transfer(create_input(
            "t-partial",
            vec![
                self_recipient(),
                RecipientInput {
                    identifier: "peer-down".into(),
                    transport: "loop".into(),
                    preferences: None,
                },
            ],
        ))
        .await
        .unwrap();

    // Any success keeps the transfer off `failed`.
    wait_for_status(engine, "t-partial", TransferStatus::Delivered).await;
    let bundle = engine.get_transfer("t-partial").await.unwrap();
    let by_identifier = |id: &str| {
        bundle
            .recipients
            .iter()
            .find(|r| r.identifier == id)
            .unwrap()
            .clone()
    };
    assert_eq!(by_identifier("node-self").status, RecipientStatus::Notified);
    assert_eq!(by_identifier("peer-down").status, RecipientStatus::Pending);

    // One of two signatures with require-all: partially signed, not done.
    let incoming = wait_for_transfer(engine, "recv-t-partial").await;
    engine
        .submit_signatures(
            "recv-t-partial",
            vec![SignatureInput {
                document_id: incoming.documents[0].id.clone(),
                signed_by: "local-user".into(),
                signed_bytes: b"signed".to_vec(),
            }],
        )
        .await
        .unwrap();
    wait_for_status(engine, "t-partial", TransferStatus::PartiallySigned).await;

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_recipients_failing_fails_the_transfer() {
    let fx = fixture(LoopbackTransport::new(false, &["peer-a", "peer-b"]), 3600).await;
    let engine = &fx.engine;
    let mut subscription = engine.subscribe(Some("t-dead"));

    engine
        .create_outgoing_transfer(create_input(
            "t-dead",
            vec![
                RecipientInput {
                    identifier: "peer-a".into(),
                    transport: "loop".into(),
                    preferences: None,
                },
                RecipientInput {
                    identifier: "peer-b".into(),
                    transport: "loop".into(),
                    preferences: None,
                },
            ],
        ))
        .await
        .unwrap();

    wait_for_status(engine, "t-dead", TransferStatus::Failed).await;

    let mut saw_failed = false;
    while let Ok(Some(item)) =
        tokio::time::timeout(Duration::from_millis(200), subscription.recv()).await
    {
        if let BusItem::Event(event) = item {
            if let EventKind::Failed { reason } = event.kind {
                assert_eq!(reason, "TransportUnavailable");
                saw_failed = true;
            }
        }
    }
    assert!(saw_failed);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retryable_failures_are_retried_until_success() {
    let flaky = FlakyTransport::new(2);
    let fx = fixture(flaky.clone(), 3600).await;
    let engine = &fx.engine;

    let mut input = create_input("t-flaky", vec![]);
    input.recipients = vec![RecipientInput {
        identifier: "peer-xyz".into(),
        transport: "flaky".into(),
        preferences: None,
    }];
    engine.create_outgoing_transfer(input).await.unwrap();

    // Two timeouts, 1s + 2s of backoff, then the third attempt lands.
    wait_for_status(engine, "t-flaky", TransferStatus::Delivered).await;
    assert_eq!(flaky.attempts(), 3);

    let bundle = engine.get_transfer("t-flaky").await.unwrap();
    assert_eq!(bundle.recipients[0].status, RecipientStatus::Notified);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_budget_is_bounded() {
    // Never recovers: the engine must stop after the initial send plus the
    // four backed-off retries and fail the transfer.
    let flaky = FlakyTransport::new(u32::MAX);
    let fx = fixture(flaky.clone(), 3600).await;
    let engine = &fx.engine;

    let mut input = create_input("t-hopeless", vec![]);
    input.recipients = vec![RecipientInput {
        identifier: "peer-xyz".into(),
        transport: "flaky".into(),
        preferences: None,
    }];
    engine.create_outgoing_transfer(input).await.unwrap();

    // The full schedule sleeps 1s + 2s + 4s + 8s between attempts.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let current = engine.get_transfer("t-hopeless").await.unwrap();
        if current.transfer.status == TransferStatus::Failed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transfer stuck in {:?} after {} attempts",
            current.transfer.status,
            flaky.attempts()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(flaky.attempts(), 5);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_signatures_one_winner() {
    let fx = fixture(LoopbackTransport::new(true, &[]), 3600).await;
    let engine = &fx.engine;

    engine
        .create_outgoing_transfer(create_input("t-race", vec![self_recipient()]))
        .await
        .unwrap();
    let incoming = wait_for_transfer(engine, "recv-t-race").await;
    let document_id = incoming.documents[0].id.clone();

    let submit = |signer: &str| {
        let engine = Arc::clone(engine);
        let document_id = document_id.clone();
        let signer = signer.to_string();
        tokio::spawn(async move {
            engine
                .submit_signatures(
                    "recv-t-race",
                    vec![SignatureInput {
                        document_id,
                        signed_by: signer.clone(),
                        signed_bytes: format!("signed by {signer}").into_bytes(),
                    }],
                )
                .await
        })
    };
    let (first, second) = tokio::join!(submit("alice"), submit("bob"));
    let outcomes = [first.unwrap(), second.unwrap()];

    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 1, "exactly one signer must win");
    let loser = outcomes.iter().find(|o| o.is_err()).unwrap();
    let Err(EngineError::AlreadySigned { signed_by, .. }) = loser else {
        panic!("loser must fail with AlreadySigned, got {loser:?}");
    };

    // The stored signer is the winner the loser was told about.
    let bundle = engine.get_transfer("recv-t-race").await.unwrap();
    assert_eq!(bundle.documents[0].signed_by.as_deref(), Some(signed_by.as_str()));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_expiry_fails_once() {
    let fx = fixture(LoopbackTransport::new(false, &[]), 1).await;
    let engine = &fx.engine;
    let mut subscription = engine.subscribe(Some("t-late"));

    let mut input = create_input("t-late", vec![self_recipient()]);
    input.metadata.deadline = Some(firma_telemetry::unix_millis() + 1500);
    engine.create_outgoing_transfer(input).await.unwrap();

    wait_for_status(engine, "t-late", TransferStatus::Failed).await;

    // Exactly one terminal event, reason Expired, across several further
    // sweeper ticks.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let mut failed_events = 0;
    while let Ok(Some(item)) =
        tokio::time::timeout(Duration::from_millis(200), subscription.recv()).await
    {
        if let BusItem::Event(event) = item {
            if let EventKind::Failed { reason } = event.kind {
                assert_eq!(reason, "Expired");
                failed_events += 1;
            }
        }
    }
    assert_eq!(failed_events, 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_rules() {
    let fx = fixture(LoopbackTransport::new(false, &[]), 3600).await;
    let engine = &fx.engine;

    // A transfer parked in `pending` (created behind the engine's back, so
    // no send task races the cancel).
    let bundle = engine
        .coordinator()
        .create_outgoing_transfer(firma_store::NewTransferRequest {
            transfer_id: "t-cancel".into(),
            transport_name: "loop".into(),
            transport_config: None,
            metadata: TransferMetadata::default(),
            sender: None,
            documents: vec![firma_store::NewDocument {
                id: String::new(),
                file_name: "contract.pdf".into(),
                bytes: b"x".to_vec(),
            }],
            recipients: vec![firma_store::NewRecipient {
                id: String::new(),
                identifier: "node-self".into(),
                transport: "loop".into(),
                preferences: None,
            }],
        })
        .await
        .unwrap();

    let cancelled = engine.cancel_transfer(&bundle.transfer.id).await.unwrap();
    assert_eq!(cancelled.status, TransferStatus::Cancelled);

    // Cancelling a terminal transfer is a no-op, not an error.
    let again = engine.cancel_transfer(&bundle.transfer.id).await.unwrap();
    assert_eq!(again.status, TransferStatus::Cancelled);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_send_window_is_invalid() {
    let fx = fixture(LoopbackTransport::new(true, &[]), 3600).await;
    let engine = &fx.engine;

    engine
        .create_outgoing_transfer(create_input("t-sent", vec![self_recipient()]))
        .await
        .unwrap();
    wait_for_status(engine, "t-sent", TransferStatus::Delivered).await;

    let err = engine.cancel_transfer("t-sent").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_transports_reports_loopback() {
    let fx = fixture(LoopbackTransport::new(false, &[]), 3600).await;
    let descriptors = fx.engine.get_transports().await;
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].name, "loop");
    assert!(descriptors[0].status.initialized);

    fx.engine.shutdown().await;
}
