use super::*;
use firma_crypto::hash_bytes;
use firma_transport::OutgoingDocument;
use firma_types::{SenderInfo, VerificationStatus};
use tempfile::TempDir;

/// Finds a free adjacent port pair for the dual TCP/WebSocket listeners.
fn free_port_pair() -> u16 {
    loop {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        if port >= u16::MAX - 1 {
            continue;
        }
        if let Ok(second) = std::net::TcpListener::bind(("127.0.0.1", port + 1)) {
            drop(second);
            drop(probe);
            return port;
        }
    }
}

fn p2p_config(port: u16) -> serde_json::Value {
    serde_json::json!({
        "port": port,
        "auto_dial": false,
        "bootstrap": [],
        "connection_timeout_secs": 5,
        "send_deadline_secs": 10,
    })
}

fn sender() -> SenderInfo {
    SenderInfo {
        sender_id: "node-a".into(),
        name: "Node A".into(),
        email: None,
        public_key: None,
        transport: TRANSPORT_NAME.into(),
        timestamp: 1_700_000_000_000,
        verification: VerificationStatus::Unverified,
    }
}

fn outgoing_to(identifier: String, bytes: &[u8], hash: String) -> OutgoingTransfer {
    OutgoingTransfer {
        transfer_id: "t-loopback".into(),
        documents: vec![OutgoingDocument {
            id: "d1".into(),
            file_name: "contract.pdf".into(),
            mime_type: "application/pdf".into(),
            bytes: bytes.to_vec(),
            hash,
        }],
        recipients: vec![OutgoingRecipient {
            id: "r1".into(),
            identifier,
            transport: TRANSPORT_NAME.into(),
            preferences: None,
        }],
        sender: sender(),
        options: None,
    }
}

async fn started_node(dir: &TempDir, port: u16) -> Arc<P2pTransport> {
    let transport = P2pTransport::new(dir.path(), Arc::new(PeerDirectory::default()));
    transport.initialize(&p2p_config(port)).await.unwrap();
    transport
}

#[test]
fn test_resolve_identifier_variants() {
    let peer = libp2p::identity::Keypair::generate_ed25519()
        .public()
        .to_peer_id();

    let (resolved, addr) = resolve_identifier(&peer.to_string()).unwrap();
    assert_eq!(resolved, peer);
    assert!(addr.is_none());

    let (resolved, addr) =
        resolve_identifier(&format!("/ip4/127.0.0.1/tcp/9090/p2p/{peer}")).unwrap();
    assert_eq!(resolved, peer);
    assert_eq!(addr.unwrap().to_string(), "/ip4/127.0.0.1/tcp/9090");

    assert!(resolve_identifier("peer-xyz").is_err());
    assert!(resolve_identifier("/ip4/127.0.0.1/tcp/9090").is_err());
}

#[tokio::test]
async fn test_send_before_initialize_is_transport_fatal() {
    let dir = TempDir::new().unwrap();
    let transport = P2pTransport::new(dir.path(), Arc::new(PeerDirectory::default()));
    let err = transport
        .send(outgoing_to("any".into(), b"x", hash_bytes(b"x")))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotInitialized(_)));
}

#[tokio::test]
async fn test_oversize_document_fails_every_recipient_pre_wire() {
    let dir = TempDir::new().unwrap();
    let transport = P2pTransport::with_max_file_size(dir.path(), 16);
    let port = free_port_pair();
    transport.initialize(&p2p_config(port)).await.unwrap();

    let payload = vec![0u8; 17];
    let result = transport
        .send(outgoing_to(
            // A dead address: if the cap check ever ran after dialing, this
            // send would time out instead of failing fast.
            format!(
                "/ip4/127.0.0.1/tcp/1/p2p/{}",
                libp2p::identity::Keypair::generate_ed25519()
                    .public()
                    .to_peer_id()
            ),
            &payload,
            hash_bytes(&payload),
        ))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(
        result.recipient_results[0].error.as_deref(),
        Some("FileTooLarge")
    );
    transport.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_delivery_and_ack() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let port_a = free_port_pair();
    let port_b = free_port_pair();

    let node_a = started_node(&dir_a, port_a).await;
    let node_b = started_node(&dir_b, port_b).await;
    let peer_b = node_b.local_peer_id().await.unwrap();

    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(4);
    node_b.start_receiving(sink_tx).await.unwrap();

    // Give the listeners a moment to bind.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let payload = b"hello world";
    let result = node_a
        .send(outgoing_to(
            format!("/ip4/127.0.0.1/tcp/{port_b}/p2p/{peer_b}"),
            payload,
            hash_bytes(payload),
        ))
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert!(result.recipient_results[0].success);

    let envelope = tokio::time::timeout(std::time::Duration::from_secs(10), sink_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.transfer_id, "t-loopback");
    assert_eq!(envelope.transport, "p2p");
    assert_eq!(envelope.documents[0].bytes, payload);
    assert_eq!(envelope.sender.sender_id, "node-a");

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hash_mismatch_is_nacked_not_ingested() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let port_a = free_port_pair();
    let port_b = free_port_pair();

    let node_a = started_node(&dir_a, port_a).await;
    let node_b = started_node(&dir_b, port_b).await;
    let peer_b = node_b.local_peer_id().await.unwrap();

    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(4);
    node_b.start_receiving(sink_tx).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    // Declared hash disagrees with the bytes on the wire.
    let result = node_a
        .send(outgoing_to(
            format!("/ip4/127.0.0.1/tcp/{port_b}/p2p/{peer_b}"),
            b"actual bytes",
            hash_bytes(b"declared other bytes"),
        ))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(
        result.recipient_results[0].error.as_deref(),
        Some("HashMismatch")
    );
    // Nothing reached the receiving side.
    assert!(sink_rx.try_recv().is_err());

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_peer_fails_that_recipient_only() {
    let dir_a = TempDir::new().unwrap();
    let port_a = free_port_pair();
    let node_a = started_node(&dir_a, port_a).await;

    let ghost = libp2p::identity::Keypair::generate_ed25519()
        .public()
        .to_peer_id();
    let result = node_a
        .send(outgoing_to(
            format!("/ip4/127.0.0.1/tcp/1/p2p/{ghost}"),
            b"payload",
            hash_bytes(b"payload"),
        ))
        .await
        .unwrap();

    assert!(!result.success);
    let error = result.recipient_results[0].error.as_deref().unwrap();
    assert!(
        error == "OperationFailed" || error == "SendTimeout",
        "unexpected error kind: {error}"
    );

    node_a.shutdown().await.unwrap();
}
