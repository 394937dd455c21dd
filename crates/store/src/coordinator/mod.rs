//! The durable-store coordinator.
//!
//! The single writer owning the consistency boundary between relational
//! records and blobs. One blob save and its relational insert commit
//! together; a failure after the row insert rolls the row back and deletes
//! any partially-written blob. Writes are serialized per transfer by a keyed
//! async mutex; reads are unbounded. Database and filesystem work runs on
//! the blocking pool, never on the async reactor.

use crate::blob::{BlobStore, BlobUsage};
use crate::keyed_lock::KeyedLocks;
use crate::sql::{self, Database, SignOutcome};
use firma_crypto::{document_id, hash_bytes};
use firma_telemetry::unix_millis;
use firma_types::{
    BlobSlot, Document, DocumentStatus, Recipient, RecipientStatus, SenderInfo, StoreError,
    Transfer, TransferBundle, TransferDirection, TransferMetadata, TransferStatus,
};
use std::sync::Arc;

/// A document to persist as part of a new transfer.
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Caller-assigned id; generated when empty.
    pub id: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// A recipient of a new outgoing transfer.
#[derive(Debug, Clone)]
pub struct NewRecipient {
    /// Caller-assigned id; generated when empty.
    pub id: String,
    pub identifier: String,
    pub transport: String,
    pub preferences: Option<serde_json::Value>,
}

/// Everything needed to create a transfer in one commit.
#[derive(Debug, Clone)]
pub struct NewTransferRequest {
    /// Caller-assigned id; generated when empty.
    pub transfer_id: String,
    pub transport_name: String,
    pub transport_config: Option<serde_json::Value>,
    pub metadata: TransferMetadata,
    pub sender: Option<SenderInfo>,
    pub documents: Vec<NewDocument>,
    pub recipients: Vec<NewRecipient>,
}

/// Outcome of a signature submission routed through [`StoreCoordinator::sign_document`].
#[derive(Debug)]
pub struct SignResult {
    pub outcome: SignOutcome,
    /// The return transfer created in the same transaction, when requested
    /// and when this signer won.
    pub return_transfer: Option<TransferBundle>,
}

pub struct StoreCoordinator {
    db: Arc<Database>,
    blobs: Arc<BlobStore>,
    locks: KeyedLocks,
}

/// Canonical blob path for a document slot.
fn blob_path(
    direction: TransferDirection,
    transfer_id: &str,
    slot: BlobSlot,
    file_name: &str,
) -> String {
    format!(
        "transfers/{}/{}/{}/{}",
        direction.as_str(),
        transfer_id,
        slot.as_str(),
        file_name
    )
}

/// File names land on the filesystem; separators and dot-segments are
/// rejected outright rather than normalized.
fn validate_file_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.len() > 255
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.bytes().any(|b| b.is_ascii_control());
    if bad {
        return Err(StoreError::PermissionDenied(format!(
            "unacceptable file name: {name:?}"
        )));
    }
    Ok(())
}

impl StoreCoordinator {
    pub fn new(db: Arc<Database>, blobs: Arc<BlobStore>) -> Self {
        Self {
            db,
            blobs,
            locks: KeyedLocks::new(),
        }
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &BlobStore) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        let blobs = self.blobs.clone();
        tokio::task::spawn_blocking(move || f(&db, &blobs))
            .await
            .map_err(|e| StoreError::Backend(format!("storage task join: {e}")))?
    }

    /// Creates an outgoing transfer with its documents and recipients in one
    /// commit. Fails whole when any part fails; no orphan rows or blobs
    /// remain.
    pub async fn create_outgoing_transfer(
        &self,
        mut request: NewTransferRequest,
    ) -> Result<TransferBundle, StoreError> {
        if request.recipients.is_empty() {
            return Err(StoreError::InvalidRecord(
                "an outgoing transfer needs at least one recipient".into(),
            ));
        }
        if request.transfer_id.is_empty() {
            request.transfer_id = firma_types::new_id();
        }
        let key = request.transfer_id.clone();
        let _guard = self.locks.acquire(&key).await;
        self.run_blocking(move |db, blobs| {
            create_transfer_blocking(
                db,
                blobs,
                request,
                TransferDirection::Outgoing,
                TransferStatus::Pending,
            )
        })
        .await
    }

    /// Persists a transfer received from a remote peer. The transfer starts
    /// in `delivered`: it has already reached this node.
    pub async fn ingest_incoming_transfer(
        &self,
        mut request: NewTransferRequest,
    ) -> Result<TransferBundle, StoreError> {
        if request.documents.is_empty() {
            return Err(StoreError::InvalidRecord(
                "an incoming transfer needs at least one document".into(),
            ));
        }
        if request.transfer_id.is_empty() {
            request.transfer_id = firma_types::new_id();
        }
        let key = request.transfer_id.clone();
        let _guard = self.locks.acquire(&key).await;
        self.run_blocking(move |db, blobs| {
            create_transfer_blocking(
                db,
                blobs,
                request,
                TransferDirection::Incoming,
                TransferStatus::Delivered,
            )
        })
        .await
    }

    pub async fn get_transfer(&self, id: &str) -> Result<TransferBundle, StoreError> {
        let id = id.to_string();
        self.run_blocking(move |db, _| {
            db.with_conn(|conn| {
                let transfer = sql::get_transfer(conn, &id)?
                    .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))?;
                let documents = sql::documents_by_transfer(conn, &id)?;
                let recipients = sql::recipients_by_transfer(conn, &id)?;
                Ok(TransferBundle {
                    transfer,
                    documents,
                    recipients,
                })
            })
        })
        .await
    }

    pub async fn list_transfers(
        &self,
        direction: Option<TransferDirection>,
        status: Option<TransferStatus>,
        limit: u32,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.run_blocking(move |db, _| {
            db.with_conn(|conn| sql::list_transfers(conn, direction, status, limit))
        })
        .await
    }

    /// Non-terminal transfers, for the deadline sweeper.
    pub async fn active_transfers(&self) -> Result<Vec<Transfer>, StoreError> {
        self.run_blocking(|db, _| db.with_conn(sql::find_active_transfers))
            .await
    }

    /// Moves a transfer to `next` in its own transaction, bumping
    /// `updated_at`. The state machine is enforced at the row.
    pub async fn update_status(
        &self,
        transfer_id: &str,
        next: TransferStatus,
    ) -> Result<Transfer, StoreError> {
        let id = transfer_id.to_string();
        let _guard = self.locks.acquire(&id).await;
        self.run_blocking(move |db, _| {
            db.with_transaction(|txn| sql::update_transfer_status(txn, &id, next))
        })
        .await
    }

    /// One transaction covering a status change and any recipient-ladder
    /// progress that caused it.
    pub async fn update_status_with_recipients(
        &self,
        transfer_id: &str,
        next: Option<TransferStatus>,
        recipient_moves: Vec<(String, RecipientStatus)>,
    ) -> Result<TransferBundle, StoreError> {
        let id = transfer_id.to_string();
        let _guard = self.locks.acquire(&id).await;
        self.run_blocking(move |db, _| {
            db.with_transaction(|txn| {
                for (recipient_id, status) in &recipient_moves {
                    sql::advance_recipient(txn, recipient_id, *status)?;
                }
                if let Some(next) = next {
                    sql::update_transfer_status(txn, &id, next)?;
                }
                let transfer = sql::get_transfer(txn, &id)?
                    .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))?;
                let documents = sql::documents_by_transfer(txn, &id)?;
                let recipients = sql::recipients_by_transfer(txn, &id)?;
                Ok(TransferBundle {
                    transfer,
                    documents,
                    recipients,
                })
            })
        })
        .await
    }

    /// Rewrites transfer metadata (assigning a transfer code, recording a
    /// deadline) in its own transaction.
    pub async fn update_metadata(
        &self,
        transfer_id: &str,
        metadata: TransferMetadata,
    ) -> Result<Transfer, StoreError> {
        let id = transfer_id.to_string();
        let _guard = self.locks.acquire(&id).await;
        self.run_blocking(move |db, _| {
            db.with_transaction(|txn| sql::update_transfer_metadata(txn, &id, &metadata))
        })
        .await
    }

    /// Reads a document's bytes from the requested slot. With `verify`, the
    /// hash is recomputed and compared against the recorded one.
    pub async fn document_bytes(
        &self,
        transfer_id: &str,
        document_id: &str,
        slot: BlobSlot,
        verify: bool,
    ) -> Result<Vec<u8>, StoreError> {
        let transfer_id = transfer_id.to_string();
        let document_id = document_id.to_string();
        self.run_blocking(move |db, blobs| {
            let (transfer, document) = db.with_conn(|conn| {
                let transfer = sql::get_transfer(conn, &transfer_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("transfer {transfer_id}")))?;
                let document = sql::get_document(conn, &document_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("document {document_id}")))?;
                Ok((transfer, document))
            })?;
            if document.transfer_id != transfer.id {
                return Err(StoreError::NotFound(format!(
                    "document {document_id} on transfer {transfer_id}"
                )));
            }
            let path = blob_path(transfer.direction, &transfer.id, slot, &document.file_name);
            let bytes = blobs.read(&path)?;
            if verify {
                let expected = match slot {
                    BlobSlot::Original => document.content_hash.clone(),
                    BlobSlot::Signed => blobs.meta(&path)?.hash,
                };
                let got = hash_bytes(&bytes);
                if got != expected {
                    return Err(StoreError::HashMismatch { expected, got });
                }
            }
            Ok(bytes)
        })
        .await
    }

    /// Marks a document signed, stores the signed artifact, and (when
    /// `return_transfer` is given) creates the outgoing return leg — all in
    /// one transaction, so observers never see a signed document without its
    /// return transfer. Racing signers serialize on the per-transfer lock;
    /// the loser gets `SignOutcome::AlreadySigned`.
    pub async fn sign_document(
        &self,
        transfer_id: &str,
        document_id: &str,
        signed_by: &str,
        signed_bytes: Vec<u8>,
        return_transfer: Option<NewTransferRequest>,
    ) -> Result<SignResult, StoreError> {
        let transfer_id = transfer_id.to_string();
        let document_id = document_id.to_string();
        let signed_by = signed_by.to_string();
        let _guard = self.locks.acquire(&transfer_id).await;
        self.run_blocking(move |db, blobs| {
            let mut saved_paths: Vec<String> = Vec::new();
            let result = db.with_transaction(|txn| {
                let transfer = sql::get_transfer(txn, &transfer_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("transfer {transfer_id}")))?;
                let document = sql::get_document(txn, &document_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("document {document_id}")))?;
                if document.transfer_id != transfer.id {
                    return Err(StoreError::NotFound(format!(
                        "document {document_id} on transfer {transfer_id}"
                    )));
                }

                let outcome = sql::mark_document_signed(txn, &document_id, &signed_by)?;
                if let SignOutcome::AlreadySigned(_) = outcome {
                    return Ok(SignResult {
                        outcome,
                        return_transfer: None,
                    });
                }

                let signed_path = blob_path(
                    transfer.direction,
                    &transfer.id,
                    BlobSlot::Signed,
                    &document.file_name,
                );
                blobs.save(&signed_path, &signed_bytes)?;
                saved_paths.push(signed_path);

                let return_bundle = match return_transfer {
                    None => None,
                    Some(request) => Some(create_transfer_rows(
                        txn,
                        blobs,
                        request,
                        TransferDirection::Outgoing,
                        TransferStatus::Pending,
                        &mut saved_paths,
                    )?),
                };

                Ok(SignResult {
                    outcome,
                    return_transfer: return_bundle,
                })
            });
            if result.is_err() {
                for path in &saved_paths {
                    let _ = blobs.delete(path);
                }
            }
            result
        })
        .await
    }

    /// Records an anchor receipt for a document's original or signed bytes.
    pub async fn record_anchor(
        &self,
        transfer_id: &str,
        document_id: &str,
        slot: BlobSlot,
        tx_id: &str,
    ) -> Result<(), StoreError> {
        let transfer_id = transfer_id.to_string();
        let document_id = document_id.to_string();
        let tx_id = tx_id.to_string();
        let _guard = self.locks.acquire(&transfer_id).await;
        self.run_blocking(move |db, _| {
            db.with_conn(|conn| {
                sql::set_document_anchor(conn, &document_id, slot == BlobSlot::Signed, &tx_id)
            })
        })
        .await
    }

    /// Purges a transfer: rows (children cascade) and the whole blob tree.
    pub async fn delete_transfer(&self, transfer_id: &str) -> Result<(), StoreError> {
        let id = transfer_id.to_string();
        let guard = self.locks.acquire(&id).await;
        let result = self
            .run_blocking(move |db, blobs| {
                let transfer = db.with_conn(|conn| {
                    sql::get_transfer(conn, &id)?
                        .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))
                })?;
                db.with_transaction(|txn| sql::delete_transfer(txn, &id))?;
                blobs.delete_tree(&format!(
                    "transfers/{}/{}",
                    transfer.direction.as_str(),
                    transfer.id
                ))?;
                Ok(())
            })
            .await;
        drop(guard);
        self.locks.release_idle();
        result
    }

    /// Aggregate blob-store usage.
    pub async fn usage(&self) -> Result<BlobUsage, StoreError> {
        self.run_blocking(|_, blobs| blobs.usage()).await
    }

    /// Clears the temp staging area. Called once at startup.
    pub async fn clean_temp(&self) -> Result<(), StoreError> {
        self.run_blocking(|_, blobs| blobs.delete_tree("temp")).await
    }
}

/// The create sequence, reusable inside a caller's open transaction (the
/// return-transfer path) or as a whole transaction of its own: insert rows,
/// save blobs, finalize content fields.
fn create_transfer_rows(
    conn: &rusqlite::Connection,
    blobs: &BlobStore,
    request: NewTransferRequest,
    direction: TransferDirection,
    initial_status: TransferStatus,
    saved_paths: &mut Vec<String>,
) -> Result<TransferBundle, StoreError> {
    // Caller- and remote-supplied ids end up in blob paths; anything not an
    // acceptable identifier is refused before a row exists.
    if !request.transfer_id.is_empty() && !firma_types::is_valid_id(&request.transfer_id) {
        return Err(StoreError::PermissionDenied(format!(
            "unacceptable transfer id: {:?}",
            request.transfer_id
        )));
    }
    for document in &request.documents {
        if !document.id.is_empty() && !firma_types::is_valid_id(&document.id) {
            return Err(StoreError::PermissionDenied(format!(
                "unacceptable document id: {:?}",
                document.id
            )));
        }
    }

    let transfer = sql::insert_transfer(
        conn,
        &Transfer {
            id: request.transfer_id,
            direction,
            status: initial_status,
            transport_name: request.transport_name,
            transport_config: request.transport_config,
            sender: request.sender,
            metadata: request.metadata,
            created_at: 0,
            updated_at: 0,
        },
    )?;

    let mut recipients = Vec::with_capacity(request.recipients.len());
    for new_recipient in request.recipients {
        recipients.push(sql::insert_recipient(
            conn,
            &Recipient {
                id: new_recipient.id,
                transfer_id: transfer.id.clone(),
                identifier: new_recipient.identifier,
                transport: new_recipient.transport,
                status: RecipientStatus::Pending,
                preferences: new_recipient.preferences,
                notified_at: None,
                viewed_at: None,
                signed_at: None,
                created_at: 0,
            },
        )?);
    }

    let mut documents = Vec::with_capacity(request.documents.len());
    for new_document in request.documents {
        validate_file_name(&new_document.file_name)?;
        // Content-derived id when the caller assigned none.
        let id = if new_document.id.is_empty() {
            document_id(&hash_bytes(&new_document.bytes), unix_millis())
        } else {
            new_document.id
        };
        // Insert with placeholder content fields, save the blob, then
        // finalize the row from what actually landed on disk.
        let row = sql::insert_document(
            conn,
            &Document {
                id,
                transfer_id: transfer.id.clone(),
                file_name: new_document.file_name.clone(),
                size: 0,
                content_hash: String::new(),
                status: DocumentStatus::Pending,
                signed_at: None,
                signed_by: None,
                original_anchor: None,
                signed_anchor: None,
                created_at: 0,
            },
        )?;
        let path = blob_path(direction, &transfer.id, BlobSlot::Original, &new_document.file_name);
        let saved = blobs.save(&path, &new_document.bytes)?;
        saved_paths.push(path);
        sql::finalize_document_content(conn, &row.id, &saved.hash, saved.size)?;
        documents.push(Document {
            size: saved.size,
            content_hash: saved.hash,
            ..row
        });
    }

    Ok(TransferBundle {
        transfer,
        documents,
        recipients,
    })
}

fn create_transfer_blocking(
    db: &Database,
    blobs: &BlobStore,
    request: NewTransferRequest,
    direction: TransferDirection,
    initial_status: TransferStatus,
) -> Result<TransferBundle, StoreError> {
    let mut saved_paths: Vec<String> = Vec::new();
    let result = db.with_transaction(|txn| {
        create_transfer_rows(txn, blobs, request, direction, initial_status, &mut saved_paths)
    });
    if result.is_err() {
        // The rows rolled back with the transaction; blobs are cleaned by
        // hand.
        for path in &saved_paths {
            let _ = blobs.delete(path);
        }
    }
    result
}

#[cfg(test)]
mod tests;
