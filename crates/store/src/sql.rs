//! SQLite-backed relational store for transfers, documents, and recipients.
//!
//! Single-writer by design: the connection sits behind a mutex and the engine
//! routes every mutation through the coordinator. `with_transaction` exposes
//! ACID sections; re-entry from inside an open transaction fails with
//! `NestedTransaction` instead of deadlocking.
//!
//! Timestamps are whole seconds since the Unix epoch. `updated_at` advances
//! strictly on every state change: when two changes land within the same
//! wall-clock second the second one is stamped `prev + 1`.

use firma_telemetry::unix_secs;
use firma_types::{
    new_id, Document, DocumentStatus, Recipient, RecipientStatus, SenderInfo, StoreError,
    Transfer, TransferDirection, TransferMetadata, TransferStatus, VerificationStatus,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::thread::{self, ThreadId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id                  TEXT PRIMARY KEY,
    type                TEXT NOT NULL,
    status              TEXT NOT NULL,
    sender_id           TEXT,
    sender_name         TEXT,
    sender_email        TEXT,
    sender_public_key   TEXT,
    sender_timestamp    INTEGER,
    sender_verification TEXT,
    transport_type      TEXT NOT NULL,
    transport_config    TEXT,
    metadata            TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    id                     TEXT PRIMARY KEY,
    transfer_id            TEXT NOT NULL REFERENCES transfers(id) ON DELETE CASCADE,
    file_name              TEXT NOT NULL,
    file_size              INTEGER NOT NULL,
    file_hash              TEXT NOT NULL,
    status                 TEXT NOT NULL,
    original_document_id   TEXT,
    signed_at              INTEGER,
    signed_by              TEXT,
    blockchain_tx_original TEXT,
    blockchain_tx_signed   TEXT,
    created_at             INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS recipients (
    id          TEXT PRIMARY KEY,
    transfer_id TEXT NOT NULL REFERENCES transfers(id) ON DELETE CASCADE,
    identifier  TEXT NOT NULL,
    transport   TEXT NOT NULL,
    status      TEXT NOT NULL,
    preferences TEXT,
    notified_at INTEGER,
    viewed_at   INTEGER,
    signed_at   INTEGER,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transfers_type ON transfers(type);
CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status);
CREATE INDEX IF NOT EXISTS idx_transfers_created_at ON transfers(created_at);
CREATE INDEX IF NOT EXISTS idx_documents_transfer_id ON documents(transfer_id);
CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
CREATE INDEX IF NOT EXISTS idx_recipients_transfer_id ON recipients(transfer_id);
CREATE INDEX IF NOT EXISTS idx_recipients_status ON recipients(status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_recipients_unique_address
    ON recipients(transfer_id, identifier, transport);
"#;

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct Database {
    conn: Mutex<Connection>,
    /// Thread currently inside `with_transaction`; same-thread re-entry is
    /// the nested-transaction fault.
    txn_owner: Mutex<Option<ThreadId>>,
}

impl Database {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema. Foreign keys are enforced on this connection.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(backend)?;
        Self::init(conn)
    }

    /// An in-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // journal_mode returns a result row, so it cannot go through
        // pragma_update. In-memory databases stay on their own journal.
        let _mode: Result<String, _> =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0));
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(backend)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
            txn_owner: Mutex::new(None),
        })
    }

    fn check_reentry(&self) -> Result<(), StoreError> {
        if *self.txn_owner.lock() == Some(thread::current().id()) {
            return Err(StoreError::NestedTransaction);
        }
        Ok(())
    }

    /// Runs `f` inside one ACID transaction. The closure gets a
    /// [`Transaction`], which derefs to [`Connection`], so every query helper
    /// in this module works inside it. Nested calls fail with
    /// `NestedTransaction`.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_reentry()?;
        let mut conn = self.conn.lock();
        *self.txn_owner.lock() = Some(thread::current().id());
        let result = (|| {
            let txn = conn.transaction().map_err(backend)?;
            let out = f(&txn)?;
            txn.commit().map_err(backend)?;
            Ok(out)
        })();
        *self.txn_owner.lock() = None;
        result
    }

    /// Runs `f` with the raw connection, outside any transaction. Reads and
    /// single-statement writes go through here.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_reentry()?;
        let conn = self.conn.lock();
        f(&conn)
    }
}

// ---- row mapping ----

fn parse_status(s: &str) -> Result<TransferStatus, StoreError> {
    TransferStatus::parse(s)
        .ok_or_else(|| StoreError::InvalidRecord(format!("unknown transfer status: {s}")))
}

fn parse_direction(s: &str) -> Result<TransferDirection, StoreError> {
    match s {
        "outgoing" => Ok(TransferDirection::Outgoing),
        "incoming" => Ok(TransferDirection::Incoming),
        other => Err(StoreError::InvalidRecord(format!(
            "unknown transfer direction: {other}"
        ))),
    }
}

fn parse_verification(s: &str) -> VerificationStatus {
    match s {
        "verified" => VerificationStatus::Verified,
        "failed" => VerificationStatus::Failed,
        _ => VerificationStatus::Unverified,
    }
}

fn verification_str(v: VerificationStatus) -> &'static str {
    match v {
        VerificationStatus::Verified => "verified",
        VerificationStatus::Unverified => "unverified",
        VerificationStatus::Failed => "failed",
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
    what: &str,
) -> Result<Option<T>, StoreError> {
    match raw {
        None => Ok(None),
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::InvalidRecord(format!("{what}: {e}"))),
    }
}

fn transfer_from_row(row: &Row<'_>) -> Result<Transfer, StoreError> {
    let direction = parse_direction(&row.get::<_, String>("type").map_err(backend)?)?;
    let status = parse_status(&row.get::<_, String>("status").map_err(backend)?)?;
    let metadata: Option<TransferMetadata> = json_column(
        row.get::<_, Option<String>>("metadata").map_err(backend)?,
        "transfer metadata",
    )?;
    let transport_config = json_column(
        row.get::<_, Option<String>>("transport_config")
            .map_err(backend)?,
        "transport config",
    )?;
    let transport_name: String = row.get("transport_type").map_err(backend)?;

    let sender_id: Option<String> = row.get("sender_id").map_err(backend)?;
    let sender = match sender_id {
        None => None,
        Some(sender_id) => Some(SenderInfo {
            sender_id,
            name: row
                .get::<_, Option<String>>("sender_name")
                .map_err(backend)?
                .unwrap_or_default(),
            email: row.get("sender_email").map_err(backend)?,
            public_key: row.get("sender_public_key").map_err(backend)?,
            transport: transport_name.clone(),
            timestamp: row
                .get::<_, Option<i64>>("sender_timestamp")
                .map_err(backend)?
                .unwrap_or(0),
            verification: parse_verification(
                &row.get::<_, Option<String>>("sender_verification")
                    .map_err(backend)?
                    .unwrap_or_default(),
            ),
        }),
    };

    Ok(Transfer {
        id: row.get("id").map_err(backend)?,
        direction,
        status,
        transport_name,
        transport_config,
        sender,
        metadata: metadata.unwrap_or_default(),
        created_at: row.get("created_at").map_err(backend)?,
        updated_at: row.get("updated_at").map_err(backend)?,
    })
}

fn document_from_row(row: &Row<'_>) -> Result<Document, StoreError> {
    let status_raw: String = row.get("status").map_err(backend)?;
    let status = DocumentStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::InvalidRecord(format!("unknown document status: {status_raw}")))?;
    Ok(Document {
        id: row.get("id").map_err(backend)?,
        transfer_id: row.get("transfer_id").map_err(backend)?,
        file_name: row.get("file_name").map_err(backend)?,
        size: row.get::<_, i64>("file_size").map_err(backend)? as u64,
        content_hash: row.get("file_hash").map_err(backend)?,
        status,
        signed_at: row.get("signed_at").map_err(backend)?,
        signed_by: row.get("signed_by").map_err(backend)?,
        original_anchor: row.get("blockchain_tx_original").map_err(backend)?,
        signed_anchor: row.get("blockchain_tx_signed").map_err(backend)?,
        created_at: row.get("created_at").map_err(backend)?,
    })
}

fn recipient_from_row(row: &Row<'_>) -> Result<Recipient, StoreError> {
    let status_raw: String = row.get("status").map_err(backend)?;
    let status = RecipientStatus::parse(&status_raw).ok_or_else(|| {
        StoreError::InvalidRecord(format!("unknown recipient status: {status_raw}"))
    })?;
    Ok(Recipient {
        id: row.get("id").map_err(backend)?,
        transfer_id: row.get("transfer_id").map_err(backend)?,
        identifier: row.get("identifier").map_err(backend)?,
        transport: row.get("transport").map_err(backend)?,
        status,
        preferences: json_column(
            row.get::<_, Option<String>>("preferences").map_err(backend)?,
            "recipient preferences",
        )?,
        notified_at: row.get("notified_at").map_err(backend)?,
        viewed_at: row.get("viewed_at").map_err(backend)?,
        signed_at: row.get("signed_at").map_err(backend)?,
        created_at: row.get("created_at").map_err(backend)?,
    })
}

fn json_text<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, StoreError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(|e| StoreError::Backend(e.to_string())))
        .transpose()
}

// ---- transfers ----

/// Inserts a new transfer row. When `transfer.id` is empty an id is
/// generated; `created_at`/`updated_at` are stamped here.
pub fn insert_transfer(conn: &Connection, transfer: &Transfer) -> Result<Transfer, StoreError> {
    let mut stored = transfer.clone();
    if stored.id.is_empty() {
        stored.id = new_id();
    }
    let now = unix_secs();
    stored.created_at = now;
    stored.updated_at = now;

    let metadata = serde_json::to_string(&stored.metadata)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let result = conn.execute(
        "INSERT INTO transfers (id, type, status, sender_id, sender_name, sender_email, \
         sender_public_key, sender_timestamp, sender_verification, transport_type, \
         transport_config, metadata, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            stored.id,
            stored.direction.as_str(),
            stored.status.as_str(),
            stored.sender.as_ref().map(|s| s.sender_id.clone()),
            stored.sender.as_ref().map(|s| s.name.clone()),
            stored.sender.as_ref().and_then(|s| s.email.clone()),
            stored.sender.as_ref().and_then(|s| s.public_key.clone()),
            stored.sender.as_ref().map(|s| s.timestamp),
            stored.sender.as_ref().map(|s| verification_str(s.verification)),
            stored.transport_name,
            json_text(&stored.transport_config)?,
            metadata,
            stored.created_at,
            stored.updated_at,
        ],
    );
    match result {
        Ok(_) => Ok(stored),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::AlreadyExists(stored.id))
        }
        Err(e) => Err(backend(e)),
    }
}

pub fn get_transfer(conn: &Connection, id: &str) -> Result<Option<Transfer>, StoreError> {
    conn.query_row(
        "SELECT * FROM transfers WHERE id = ?1",
        params![id],
        |row| Ok(transfer_from_row(row)),
    )
    .optional()
    .map_err(backend)?
    .transpose()
}

/// Stamps a new `updated_at` that is strictly greater than the previous one
/// even when two changes land within the same second.
fn next_updated_at(prev: i64) -> i64 {
    unix_secs().max(prev + 1)
}

/// Moves a transfer to `next` after checking the state machine. Returns the
/// updated row.
pub fn update_transfer_status(
    conn: &Connection,
    id: &str,
    next: TransferStatus,
) -> Result<Transfer, StoreError> {
    let current =
        get_transfer(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))?;
    if !current.status.can_transition_to(next) {
        return Err(StoreError::InvalidRecord(format!(
            "transition {} -> {} not admitted",
            current.status.as_str(),
            next.as_str()
        )));
    }
    let updated_at = next_updated_at(current.updated_at);
    conn.execute(
        "UPDATE transfers SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, next.as_str(), updated_at],
    )
    .map_err(backend)?;
    Ok(Transfer {
        status: next,
        updated_at,
        ..current
    })
}

/// Rewrites a transfer's metadata; bumps `updated_at`.
pub fn update_transfer_metadata(
    conn: &Connection,
    id: &str,
    metadata: &TransferMetadata,
) -> Result<Transfer, StoreError> {
    let current =
        get_transfer(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))?;
    let updated_at = next_updated_at(current.updated_at);
    let body = serde_json::to_string(metadata).map_err(|e| StoreError::Backend(e.to_string()))?;
    conn.execute(
        "UPDATE transfers SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, body, updated_at],
    )
    .map_err(backend)?;
    Ok(Transfer {
        metadata: metadata.clone(),
        updated_at,
        ..current
    })
}

/// Deletes the transfer row; documents and recipients cascade.
pub fn delete_transfer(conn: &Connection, id: &str) -> Result<(), StoreError> {
    let n = conn
        .execute("DELETE FROM transfers WHERE id = ?1", params![id])
        .map_err(backend)?;
    if n == 0 {
        return Err(StoreError::NotFound(format!("transfer {id}")));
    }
    Ok(())
}

fn collect_transfers(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Transfer>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(backend)?;
    let rows = stmt
        .query_map(args, |row| Ok(transfer_from_row(row)))
        .map_err(backend)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(backend)??);
    }
    Ok(out)
}

pub fn find_transfers_by_status(
    conn: &Connection,
    status: TransferStatus,
) -> Result<Vec<Transfer>, StoreError> {
    collect_transfers(
        conn,
        "SELECT * FROM transfers WHERE status = ?1 ORDER BY created_at DESC",
        &[&status.as_str()],
    )
}

pub fn find_recent_transfers(conn: &Connection, limit: u32) -> Result<Vec<Transfer>, StoreError> {
    collect_transfers(
        conn,
        "SELECT * FROM transfers ORDER BY created_at DESC, id LIMIT ?1",
        &[&limit],
    )
}

/// Transfers still in flight: everything not in a terminal state. The
/// deadline sweeper scans these.
pub fn find_active_transfers(conn: &Connection) -> Result<Vec<Transfer>, StoreError> {
    collect_transfers(
        conn,
        "SELECT * FROM transfers WHERE status NOT IN ('completed', 'failed', 'cancelled') \
         ORDER BY created_at",
        &[],
    )
}

/// Listing with optional direction/status filters, newest first.
pub fn list_transfers(
    conn: &Connection,
    direction: Option<TransferDirection>,
    status: Option<TransferStatus>,
    limit: u32,
) -> Result<Vec<Transfer>, StoreError> {
    match (direction, status) {
        (None, None) => find_recent_transfers(conn, limit),
        (Some(d), None) => collect_transfers(
            conn,
            "SELECT * FROM transfers WHERE type = ?1 ORDER BY created_at DESC LIMIT ?2",
            &[&d.as_str(), &limit],
        ),
        (None, Some(s)) => collect_transfers(
            conn,
            "SELECT * FROM transfers WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
            &[&s.as_str(), &limit],
        ),
        (Some(d), Some(s)) => collect_transfers(
            conn,
            "SELECT * FROM transfers WHERE type = ?1 AND status = ?2 \
             ORDER BY created_at DESC LIMIT ?3",
            &[&d.as_str(), &s.as_str(), &limit],
        ),
    }
}

// ---- documents ----

pub fn insert_document(conn: &Connection, document: &Document) -> Result<Document, StoreError> {
    let mut stored = document.clone();
    if stored.id.is_empty() {
        stored.id = new_id();
    }
    stored.created_at = unix_secs();
    let result = conn.execute(
        "INSERT INTO documents (id, transfer_id, file_name, file_size, file_hash, status, \
         signed_at, signed_by, blockchain_tx_original, blockchain_tx_signed, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            stored.id,
            stored.transfer_id,
            stored.file_name,
            stored.size as i64,
            stored.content_hash,
            stored.status.as_str(),
            stored.signed_at,
            stored.signed_by,
            stored.original_anchor,
            stored.signed_anchor,
            stored.created_at,
        ],
    );
    match result {
        Ok(_) => Ok(stored),
        Err(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // Either a duplicate id or a missing parent transfer.
            match msg {
                Some(m) if m.contains("FOREIGN KEY") => {
                    Err(StoreError::NotFound(format!("transfer {}", stored.transfer_id)))
                }
                _ => Err(StoreError::AlreadyExists(stored.id)),
            }
        }
        Err(e) => Err(backend(e)),
    }
}

pub fn get_document(conn: &Connection, id: &str) -> Result<Option<Document>, StoreError> {
    conn.query_row(
        "SELECT * FROM documents WHERE id = ?1",
        params![id],
        |row| Ok(document_from_row(row)),
    )
    .optional()
    .map_err(backend)?
    .transpose()
}

pub fn documents_by_transfer(
    conn: &Connection,
    transfer_id: &str,
) -> Result<Vec<Document>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM documents WHERE transfer_id = ?1 ORDER BY created_at, id")
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![transfer_id], |row| Ok(document_from_row(row)))
        .map_err(backend)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(backend)??);
    }
    Ok(out)
}

pub fn documents_by_status(
    conn: &Connection,
    status: DocumentStatus,
) -> Result<Vec<Document>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM documents WHERE status = ?1 ORDER BY created_at, id")
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![status.as_str()], |row| Ok(document_from_row(row)))
        .map_err(backend)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(backend)??);
    }
    Ok(out)
}

/// Finalizes the hash/size of a freshly inserted row once the blob landed
/// (step 4 of the coordinator's create sequence).
pub fn finalize_document_content(
    conn: &Connection,
    id: &str,
    hash: &str,
    size: u64,
) -> Result<(), StoreError> {
    let n = conn
        .execute(
            "UPDATE documents SET file_hash = ?2, file_size = ?3 WHERE id = ?1",
            params![id, hash, size as i64],
        )
        .map_err(backend)?;
    if n == 0 {
        return Err(StoreError::NotFound(format!("document {id}")));
    }
    Ok(())
}

/// Outcome of a signing attempt. The loser of a race gets the winning row
/// back so callers can report who signed first.
#[derive(Debug, Clone, PartialEq)]
pub enum SignOutcome {
    Signed(Document),
    AlreadySigned(Document),
}

/// Marks a document signed. The guard in the WHERE clause makes the first
/// writer win; the loser learns who beat it.
pub fn mark_document_signed(
    conn: &Connection,
    id: &str,
    signed_by: &str,
) -> Result<SignOutcome, StoreError> {
    let now = unix_secs();
    let n = conn
        .execute(
            "UPDATE documents SET status = 'signed', signed_at = ?2, signed_by = ?3 \
             WHERE id = ?1 AND status != 'signed'",
            params![id, now, signed_by],
        )
        .map_err(backend)?;
    let current =
        get_document(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;
    if n == 0 {
        return Ok(SignOutcome::AlreadySigned(current));
    }
    Ok(SignOutcome::Signed(current))
}

pub fn set_document_status(
    conn: &Connection,
    id: &str,
    status: DocumentStatus,
) -> Result<(), StoreError> {
    let n = conn
        .execute(
            "UPDATE documents SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )
        .map_err(backend)?;
    if n == 0 {
        return Err(StoreError::NotFound(format!("document {id}")));
    }
    Ok(())
}

/// Records an anchor receipt against the original or signed bytes.
pub fn set_document_anchor(
    conn: &Connection,
    id: &str,
    signed_slot: bool,
    tx_id: &str,
) -> Result<(), StoreError> {
    let sql = if signed_slot {
        "UPDATE documents SET blockchain_tx_signed = ?2 WHERE id = ?1"
    } else {
        "UPDATE documents SET blockchain_tx_original = ?2 WHERE id = ?1"
    };
    let n = conn.execute(sql, params![id, tx_id]).map_err(backend)?;
    if n == 0 {
        return Err(StoreError::NotFound(format!("document {id}")));
    }
    Ok(())
}

// ---- recipients ----

pub fn insert_recipient(conn: &Connection, recipient: &Recipient) -> Result<Recipient, StoreError> {
    let mut stored = recipient.clone();
    if stored.id.is_empty() {
        stored.id = new_id();
    }
    stored.created_at = unix_secs();
    let result = conn.execute(
        "INSERT INTO recipients (id, transfer_id, identifier, transport, status, preferences, \
         notified_at, viewed_at, signed_at, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            stored.id,
            stored.transfer_id,
            stored.identifier,
            stored.transport,
            stored.status.as_str(),
            json_text(&stored.preferences)?,
            stored.notified_at,
            stored.viewed_at,
            stored.signed_at,
            stored.created_at,
        ],
    );
    match result {
        Ok(_) => Ok(stored),
        Err(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            match msg {
                Some(m) if m.contains("FOREIGN KEY") => {
                    Err(StoreError::NotFound(format!("transfer {}", stored.transfer_id)))
                }
                _ => Err(StoreError::AlreadyExists(format!(
                    "recipient {}@{} on transfer {}",
                    stored.identifier, stored.transport, stored.transfer_id
                ))),
            }
        }
        Err(e) => Err(backend(e)),
    }
}

pub fn get_recipient(conn: &Connection, id: &str) -> Result<Option<Recipient>, StoreError> {
    conn.query_row(
        "SELECT * FROM recipients WHERE id = ?1",
        params![id],
        |row| Ok(recipient_from_row(row)),
    )
    .optional()
    .map_err(backend)?
    .transpose()
}

pub fn recipients_by_transfer(
    conn: &Connection,
    transfer_id: &str,
) -> Result<Vec<Recipient>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM recipients WHERE transfer_id = ?1 ORDER BY created_at, id")
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![transfer_id], |row| Ok(recipient_from_row(row)))
        .map_err(backend)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(backend)??);
    }
    Ok(out)
}

pub fn recipients_by_status(
    conn: &Connection,
    status: RecipientStatus,
) -> Result<Vec<Recipient>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM recipients WHERE status = ?1 ORDER BY created_at, id")
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![status.as_str()], |row| Ok(recipient_from_row(row)))
        .map_err(backend)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(backend)??);
    }
    Ok(out)
}

/// Advances a recipient along the `pending → notified → viewed →
/// signed | rejected` ladder, stamping the matching timestamp. Regressions
/// are ignored (the row already reflects later progress); only an attempt to
/// move past `signed`/`rejected` to a different top state is an error.
pub fn advance_recipient(
    conn: &Connection,
    id: &str,
    next: RecipientStatus,
) -> Result<Recipient, StoreError> {
    let current =
        get_recipient(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("recipient {id}")))?;
    if next.rank() <= current.status.rank() {
        if next.rank() == current.status.rank() && next != current.status {
            return Err(StoreError::InvalidRecord(format!(
                "recipient {id} is terminally {}, cannot become {}",
                current.status.as_str(),
                next.as_str()
            )));
        }
        return Ok(current);
    }
    let now = unix_secs();
    let (notified_at, viewed_at, signed_at) = match next {
        RecipientStatus::Notified => (current.notified_at.or(Some(now)), current.viewed_at, None),
        RecipientStatus::Viewed => (
            current.notified_at.or(Some(now)),
            current.viewed_at.or(Some(now)),
            None,
        ),
        RecipientStatus::Signed => (
            current.notified_at.or(Some(now)),
            current.viewed_at.or(Some(now)),
            Some(now),
        ),
        RecipientStatus::Rejected => (current.notified_at, current.viewed_at, None),
        RecipientStatus::Pending => (None, None, None),
    };
    conn.execute(
        "UPDATE recipients SET status = ?2, notified_at = ?3, viewed_at = ?4, signed_at = ?5 \
         WHERE id = ?1",
        params![id, next.as_str(), notified_at, viewed_at, signed_at],
    )
    .map_err(backend)?;
    Ok(Recipient {
        status: next,
        notified_at,
        viewed_at,
        signed_at,
        ..current
    })
}
