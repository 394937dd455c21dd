use super::*;
use tempfile::TempDir;

fn coordinator(dir: &TempDir) -> StoreCoordinator {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let blobs = Arc::new(BlobStore::open(dir.path(), 1024 * 1024, None).unwrap());
    StoreCoordinator::new(db, blobs)
}

fn request_with(documents: Vec<NewDocument>, recipients: Vec<NewRecipient>) -> NewTransferRequest {
    NewTransferRequest {
        transfer_id: String::new(),
        transport_name: "p2p".into(),
        transport_config: None,
        metadata: TransferMetadata::default(),
        sender: None,
        documents,
        recipients,
    }
}

fn doc(file_name: &str, bytes: &[u8]) -> NewDocument {
    NewDocument {
        id: String::new(),
        file_name: file_name.into(),
        bytes: bytes.to_vec(),
    }
}

fn recipient(identifier: &str) -> NewRecipient {
    NewRecipient {
        id: String::new(),
        identifier: identifier.into(),
        transport: "p2p".into(),
        preferences: None,
    }
}

#[tokio::test]
async fn test_create_outgoing_commits_rows_and_blobs_together() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let bundle = store
        .create_outgoing_transfer(request_with(
            vec![doc("contract.pdf", b"hello world")],
            vec![recipient("peer-xyz")],
        ))
        .await
        .unwrap();

    assert_eq!(bundle.transfer.status, TransferStatus::Pending);
    assert_eq!(bundle.documents.len(), 1);
    assert_eq!(
        bundle.documents[0].content_hash,
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
    assert_eq!(bundle.documents[0].size, 11);

    let bytes = store
        .document_bytes(
            &bundle.transfer.id,
            &bundle.documents[0].id,
            BlobSlot::Original,
            true,
        )
        .await
        .unwrap();
    assert_eq!(bytes, b"hello world");

    // The reloaded bundle matches what the create returned.
    let loaded = store.get_transfer(&bundle.transfer.id).await.unwrap();
    assert_eq!(loaded.documents, bundle.documents);
    assert_eq!(loaded.recipients.len(), 1);
}

#[tokio::test]
async fn test_create_without_recipients_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let err = store
        .create_outgoing_transfer(request_with(vec![doc("a.pdf", b"x")], vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRecord(_)));
}

#[tokio::test]
async fn test_failed_create_leaves_no_rows_or_blobs() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    // The second document's file name collides with the first, so its blob
    // save fails; everything must roll back.
    let err = store
        .create_outgoing_transfer(request_with(
            vec![doc("same.pdf", b"one"), doc("same.pdf", b"two")],
            vec![recipient("peer-xyz")],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)), "{err:?}");

    assert!(store
        .list_transfers(None, None, 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.usage().await.unwrap().file_count, 0);
}

#[tokio::test]
async fn test_traversal_in_transfer_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let mut request = request_with(vec![doc("a.pdf", b"x")], vec![recipient("peer-xyz")]);
    request.transfer_id = "../escape".into();
    let err = store.create_outgoing_transfer(request).await.unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_traversal_in_file_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let err = store
        .create_outgoing_transfer(request_with(
            vec![doc("../escape.pdf", b"x")],
            vec![recipient("peer-xyz")],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied(_)));
    assert!(store
        .list_transfers(None, None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_verified_read_detects_corruption() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let bundle = store
        .create_outgoing_transfer(request_with(
            vec![doc("contract.pdf", b"original bytes")],
            vec![recipient("peer-xyz")],
        ))
        .await
        .unwrap();

    // Corrupt the blob behind the coordinator's back.
    let blob_file = dir
        .path()
        .join("transfers/outgoing")
        .join(&bundle.transfer.id)
        .join("original/contract.pdf");
    std::fs::write(&blob_file, b"tampered").unwrap();

    let err = store
        .document_bytes(
            &bundle.transfer.id,
            &bundle.documents[0].id,
            BlobSlot::Original,
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::HashMismatch { .. }));

    // Unverified reads pass the bytes through.
    let bytes = store
        .document_bytes(
            &bundle.transfer.id,
            &bundle.documents[0].id,
            BlobSlot::Original,
            false,
        )
        .await
        .unwrap();
    assert_eq!(bytes, b"tampered");
}

#[tokio::test]
async fn test_sign_document_creates_return_transfer_atomically() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let sender = SenderInfo {
        sender_id: "peer-orig".into(),
        name: "Origin".into(),
        email: None,
        public_key: None,
        transport: "p2p".into(),
        timestamp: 1_700_000_000_000,
        verification: firma_types::VerificationStatus::Verified,
    };
    let mut inbound = request_with(vec![doc("contract.pdf", b"inbound")], vec![]);
    inbound.sender = Some(sender);
    let inbound = store.ingest_incoming_transfer(inbound).await.unwrap();
    assert_eq!(inbound.transfer.status, TransferStatus::Delivered);

    let mut return_metadata = TransferMetadata {
        return_transport: true,
        original_transfer_id: Some(inbound.transfer.id.clone()),
        ..TransferMetadata::default()
    };
    return_metadata.message = Some("signed copy".into());
    let return_request = NewTransferRequest {
        transfer_id: String::new(),
        transport_name: "p2p".into(),
        transport_config: None,
        metadata: return_metadata,
        sender: None,
        documents: vec![doc("contract.pdf", b"signed bytes")],
        recipients: vec![recipient("peer-orig")],
    };

    let result = store
        .sign_document(
            &inbound.transfer.id,
            &inbound.documents[0].id,
            "local-signer",
            b"signed bytes".to_vec(),
            Some(return_request),
        )
        .await
        .unwrap();

    let SignOutcome::Signed(signed) = result.outcome else {
        panic!("expected the signer to win");
    };
    assert_eq!(signed.signed_by.as_deref(), Some("local-signer"));

    let return_bundle = result.return_transfer.unwrap();
    assert!(return_bundle.transfer.metadata.return_transport);
    assert_eq!(
        return_bundle.transfer.metadata.original_transfer_id.as_deref(),
        Some(inbound.transfer.id.as_str())
    );
    assert_eq!(return_bundle.recipients[0].identifier, "peer-orig");

    // The signed artifact is readable from the signed slot.
    let signed_bytes = store
        .document_bytes(
            &inbound.transfer.id,
            &inbound.documents[0].id,
            BlobSlot::Signed,
            true,
        )
        .await
        .unwrap();
    assert_eq!(signed_bytes, b"signed bytes");
}

#[tokio::test]
async fn test_second_signer_loses_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let mut inbound = request_with(vec![doc("contract.pdf", b"inbound")], vec![]);
    inbound.sender = None;
    let inbound = store.ingest_incoming_transfer(inbound).await.unwrap();

    let first = store
        .sign_document(
            &inbound.transfer.id,
            &inbound.documents[0].id,
            "alice",
            b"alice signed".to_vec(),
            None,
        )
        .await
        .unwrap();
    assert!(matches!(first.outcome, SignOutcome::Signed(_)));

    let second = store
        .sign_document(
            &inbound.transfer.id,
            &inbound.documents[0].id,
            "bob",
            b"bob signed".to_vec(),
            None,
        )
        .await
        .unwrap();
    let SignOutcome::AlreadySigned(existing) = second.outcome else {
        panic!("expected the second signer to lose");
    };
    assert_eq!(existing.signed_by.as_deref(), Some("alice"));
    assert!(second.return_transfer.is_none());

    // The stored artifact is still the winner's.
    let bytes = store
        .document_bytes(
            &inbound.transfer.id,
            &inbound.documents[0].id,
            BlobSlot::Signed,
            false,
        )
        .await
        .unwrap();
    assert_eq!(bytes, b"alice signed");
}

#[tokio::test]
async fn test_delete_transfer_purges_rows_and_blob_tree() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let bundle = store
        .create_outgoing_transfer(request_with(
            vec![doc("a.pdf", b"aa"), doc("b.pdf", b"bb")],
            vec![recipient("peer-xyz")],
        ))
        .await
        .unwrap();

    store.delete_transfer(&bundle.transfer.id).await.unwrap();

    assert!(matches!(
        store.get_transfer(&bundle.transfer.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert_eq!(store.usage().await.unwrap().file_count, 0);
    assert!(matches!(
        store.delete_transfer(&bundle.transfer.id).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_status_and_recipient_update_in_one_commit() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    let bundle = store
        .create_outgoing_transfer(request_with(
            vec![doc("a.pdf", b"x")],
            vec![recipient("peer-xyz")],
        ))
        .await
        .unwrap();

    store
        .update_status(&bundle.transfer.id, TransferStatus::Sending)
        .await
        .unwrap();
    store
        .update_status(&bundle.transfer.id, TransferStatus::Sent)
        .await
        .unwrap();

    let updated = store
        .update_status_with_recipients(
            &bundle.transfer.id,
            Some(TransferStatus::Delivered),
            vec![(bundle.recipients[0].id.clone(), RecipientStatus::Notified)],
        )
        .await
        .unwrap();
    assert_eq!(updated.transfer.status, TransferStatus::Delivered);
    assert_eq!(updated.recipients[0].status, RecipientStatus::Notified);
    assert!(updated.recipients[0].notified_at.is_some());
}

#[tokio::test]
async fn test_clean_temp_only_touches_staging() {
    let dir = TempDir::new().unwrap();
    let store = coordinator(&dir);
    store.blob_store().save("temp/stage1/upload.bin", b"junk").unwrap();
    let bundle = store
        .create_outgoing_transfer(request_with(
            vec![doc("keep.pdf", b"keep")],
            vec![recipient("peer-xyz")],
        ))
        .await
        .unwrap();

    store.clean_temp().await.unwrap();

    assert!(!store.blob_store().exists("temp/stage1/upload.bin").unwrap());
    let bytes = store
        .document_bytes(
            &bundle.transfer.id,
            &bundle.documents[0].id,
            BlobSlot::Original,
            true,
        )
        .await
        .unwrap();
    assert_eq!(bytes, b"keep");
}
