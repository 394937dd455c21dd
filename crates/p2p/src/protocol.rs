//! Wire protocol for `/firma-sign/transfer/1`.
//!
//! One logical transfer per stream: the sender writes exactly one
//! length-prefixed JSON frame, the receiver validates it, answers
//! `{success, error?}` on the same stream, and closes. Document bytes ride
//! base64-encoded inside the frame; the receiver checks the decoded length
//! against `size` and the SHA-256 against `hash`.

use async_trait::async_trait;
use base64::Engine;
use firma_crypto::hash_bytes;
use firma_transport::{IncomingDocument, OutgoingTransfer};
use firma_types::{SenderInfo, VerificationStatus};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response::Codec;
use serde::{Deserialize, Serialize};

/// Protocol id negotiated on every transfer stream.
pub const TRANSFER_PROTOCOL: &str = "/firma-sign/transfer/1";

/// 500 MB per document, checked before any bytes leave the node.
pub const MAX_DOCUMENT_BYTES: u64 = 500 * 1024 * 1024;

/// Frame ceiling: one document at the cap costs 4/3 in base64, plus JSON
/// overhead and room for siblings' metadata.
const MAX_REQUEST_BYTES: usize = 768 * 1024 * 1024;
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFrame {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    /// Base64-encoded document bytes.
    pub data: String,
    /// SHA-256 hex of the decoded bytes.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderFrame {
    pub sender_id: String,
    pub name: String,
    pub transport: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub verification: VerificationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFrame {
    pub transfer_id: String,
    pub documents: Vec<DocumentFrame>,
    pub sender: SenderFrame,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

impl TransferFrame {
    /// Assembles the frame for one outgoing transfer. Document bytes are
    /// base64-encoded here; callers have already enforced the size cap.
    pub fn from_outgoing(transfer: &OutgoingTransfer) -> Self {
        let documents = transfer
            .documents
            .iter()
            .map(|doc| DocumentFrame {
                id: doc.id.clone(),
                file_name: doc.file_name.clone(),
                mime_type: doc.mime_type.clone(),
                size: doc.bytes.len() as u64,
                data: base64::engine::general_purpose::STANDARD.encode(&doc.bytes),
                hash: doc.hash.clone(),
                metadata: None,
            })
            .collect();
        Self {
            transfer_id: transfer.transfer_id.clone(),
            documents,
            sender: SenderFrame {
                sender_id: transfer.sender.sender_id.clone(),
                name: transfer.sender.name.clone(),
                transport: "p2p".to_string(),
                timestamp: transfer.sender.timestamp,
                verification: transfer.sender.verification,
            },
            options: transfer.options.clone(),
        }
    }

    pub fn sender_info(&self) -> SenderInfo {
        SenderInfo {
            sender_id: self.sender.sender_id.clone(),
            name: self.sender.name.clone(),
            email: None,
            public_key: None,
            transport: self.sender.transport.clone(),
            timestamp: self.sender.timestamp,
            verification: self.sender.verification,
        }
    }
}

/// Why an inbound frame was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFault {
    /// Undecodable payload; dropped without a positive acknowledgement.
    Malformed(String),
    /// Decoded length disagrees with the declared `size`.
    SizeMismatch { declared: u64, got: u64 },
    /// SHA-256 of the decoded bytes disagrees with the declared `hash`.
    HashMismatch,
}

impl FrameFault {
    /// The taxonomy token carried in the negative acknowledgement.
    pub fn ack_error(&self) -> &'static str {
        match self {
            FrameFault::Malformed(_) => "OperationFailed",
            FrameFault::SizeMismatch { .. } => "OperationFailed",
            FrameFault::HashMismatch => "HashMismatch",
        }
    }
}

/// Decodes and validates every document of an inbound frame.
pub fn validate_frame(frame: &TransferFrame) -> Result<Vec<IncomingDocument>, FrameFault> {
    let mut documents = Vec::with_capacity(frame.documents.len());
    for doc in &frame.documents {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&doc.data)
            .map_err(|e| FrameFault::Malformed(format!("document {}: {e}", doc.id)))?;
        if bytes.len() as u64 != doc.size {
            return Err(FrameFault::SizeMismatch {
                declared: doc.size,
                got: bytes.len() as u64,
            });
        }
        if hash_bytes(&bytes) != doc.hash {
            return Err(FrameFault::HashMismatch);
        }
        documents.push(IncomingDocument {
            id: doc.id.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.clone(),
            size: doc.size,
            bytes,
            hash: doc.hash.clone(),
            metadata: doc.metadata.clone(),
        });
    }
    Ok(documents)
}

// ---- stream framing ----

async fn read_length_prefixed<T: AsyncRead + Unpin + Send>(
    io: &mut T,
    max_len: usize,
) -> std::io::Result<Vec<u8>> {
    let mut len: u64 = 0;
    let mut shift = 0;
    loop {
        if shift > 63 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "varint too long",
            ));
        }
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        len |= ((byte[0] & 0x7f) as u64) << shift;
        shift += 7;
        if (byte[0] & 0x80) == 0 {
            break;
        }
    }

    if len > max_len as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut body = vec![0u8; len as usize];
    io.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_length_prefixed<T: AsyncWrite + Unpin + Send>(
    io: &mut T,
    data: &[u8],
) -> std::io::Result<()> {
    let mut len = data.len() as u64;
    let mut prefix = [0u8; 10];
    let mut used = 0;
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len != 0 {
            byte |= 0x80;
        }
        prefix[used] = byte;
        used += 1;
        if len == 0 {
            break;
        }
    }
    io.write_all(&prefix[..used]).await?;
    io.write_all(data).await?;
    Ok(())
}

/// Length-prefixed JSON codec for the transfer protocol.
#[derive(Debug, Clone, Default)]
pub struct TransferCodec;

#[async_trait]
impl Codec for TransferCodec {
    type Protocol = &'static str;
    type Request = TransferFrame;
    type Response = TransferAck;

    async fn read_request<T: AsyncRead + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Request> {
        let body = read_length_prefixed(io, MAX_REQUEST_BYTES).await?;
        serde_json::from_slice(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T: AsyncRead + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Response> {
        let body = read_length_prefixed(io, MAX_RESPONSE_BYTES).await?;
        serde_json::from_slice(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T: AsyncWrite + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> std::io::Result<()> {
        let body = serde_json::to_vec(&request)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_length_prefixed(io, &body).await
    }

    async fn write_response<T: AsyncWrite + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        response: Self::Response,
    ) -> std::io::Result<()> {
        let body = serde_json::to_vec(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_length_prefixed(io, &body).await
    }
}
