//! Node identity: a long-lived Ed25519 keypair.
//!
//! Generated on first start and persisted; the node's peer id is the
//! content hash of the public key. When `FIRMA_KEY_PASS` is set the key
//! file is sealed with the password envelope; otherwise it holds the plain
//! protobuf encoding. A file written one way cannot be read the other.

use firma_types::TransportError;
use libp2p::identity::Keypair;
use std::fs;
use std::path::Path;

/// Password for the identity file, when key-at-rest protection is wanted.
const KEY_PASS_ENV: &str = "FIRMA_KEY_PASS";

fn key_pass() -> Option<String> {
    std::env::var(KEY_PASS_ENV).ok().filter(|p| !p.is_empty())
}

/// Loads the keypair at `path`, generating and persisting a fresh one when
/// the file does not exist.
pub fn load_or_generate(path: &Path) -> Result<Keypair, TransportError> {
    if path.exists() {
        let raw = fs::read(path)
            .map_err(|e| TransportError::Internal(format!("read identity file: {e}")))?;
        let encoded = match key_pass() {
            None => raw,
            Some(pass) => {
                let envelope: firma_crypto::EncryptedEnvelope = serde_json::from_slice(&raw)
                    .map_err(|e| {
                        TransportError::Internal(format!("decode identity envelope: {e}"))
                    })?;
                firma_crypto::decrypt(&envelope, &pass)
                    .map_err(|e| TransportError::Internal(format!("unlock identity file: {e}")))?
            }
        };
        return Keypair::from_protobuf_encoding(&encoded)
            .map_err(|e| TransportError::Internal(format!("decode identity file: {e}")));
    }

    let keypair = Keypair::generate_ed25519();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| TransportError::Internal(format!("create identity dir: {e}")))?;
    }
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| TransportError::Internal(format!("encode identity: {e}")))?;
    let body = match key_pass() {
        None => encoded,
        Some(pass) => {
            let envelope = firma_crypto::encrypt(&encoded, &pass)
                .map_err(|e| TransportError::Internal(format!("seal identity file: {e}")))?;
            serde_json::to_vec(&envelope)
                .map_err(|e| TransportError::Internal(format!("encode identity envelope: {e}")))?
        }
    };
    fs::write(path, body)
        .map_err(|e| TransportError::Internal(format!("write identity file: {e}")))?;
    tracing::info!(
        target: "p2p",
        event = "identity_created",
        peer_id = %keypair.public().to_peer_id(),
        sealed = key_pass().is_some(),
        path = %path.display()
    );
    Ok(keypair)
}
