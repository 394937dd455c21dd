//! Password-based authenticated encryption for exported material.
//!
//! AES-256-GCM with a detached tag. The key is derived with PBKDF2-SHA256 at
//! 100 000 iterations from the password and a fresh 32-byte salt; the nonce
//! is a fresh 16-byte value. Decryption fails with `AuthFailed` when the tag
//! does not verify.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aes::Aes256;
use aes_gcm::{AeadInPlace, AesGcm, KeyInit};
use firma_types::CryptoError;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

const SALT_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// AES-256-GCM instantiated with the 16-byte nonce this format uses.
type Cipher = AesGcm<Aes256, U16>;

/// The sealed form: ciphertext plus the material needed to open it again
/// (everything but the password).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedEnvelope {
    pub ciphertext: Vec<u8>,
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Seals `data` under `password`.
pub fn encrypt(data: &[u8], password: &str) -> Result<EncryptedEnvelope, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let cipher = Cipher::new(GenericArray::from_slice(&key));

    let mut ciphertext = data.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), &[], &mut ciphertext)
        .map_err(|e| CryptoError::OperationFailed(e.to_string()))?;

    Ok(EncryptedEnvelope {
        ciphertext,
        salt,
        iv,
        tag: tag.into(),
    })
}

/// Opens `envelope` with `password`. Fails with [`CryptoError::AuthFailed`]
/// when the password is wrong or the envelope was tampered with.
pub fn decrypt(envelope: &EncryptedEnvelope, password: &str) -> Result<Vec<u8>, CryptoError> {
    let key = derive_key(password, &envelope.salt);
    let cipher = Cipher::new(GenericArray::from_slice(&key));

    let mut plaintext = envelope.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&envelope.iv),
            &[],
            &mut plaintext,
            GenericArray::from_slice(&envelope.tag),
        )
        .map_err(|_| CryptoError::AuthFailed)?;

    Ok(plaintext)
}

#[cfg(test)]
mod tests;
