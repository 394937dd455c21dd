use super::*;
use crate::hash::hash_bytes;

#[test]
fn test_roundtrip() {
    let data = b"the quick brown fox";
    let envelope = encrypt(data, "hunter2").unwrap();
    let opened = decrypt(&envelope, "hunter2").unwrap();
    assert_eq!(opened, data);
}

#[test]
fn test_roundtrip_preserves_hash() {
    // Property 2 of the test plan: hashing survives a seal/open cycle.
    let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let envelope = encrypt(&data, "passphrase").unwrap();
    let opened = decrypt(&envelope, "passphrase").unwrap();
    assert_eq!(hash_bytes(&opened), hash_bytes(&data));
}

#[test]
fn test_wrong_password_fails_auth() {
    let envelope = encrypt(b"secret", "right").unwrap();
    let err = decrypt(&envelope, "wrong").unwrap_err();
    assert!(matches!(err, firma_types::CryptoError::AuthFailed));
}

#[test]
fn test_tampered_ciphertext_fails_auth() {
    let mut envelope = encrypt(b"secret payload", "pw").unwrap();
    envelope.ciphertext[0] ^= 0x01;
    assert!(matches!(
        decrypt(&envelope, "pw"),
        Err(firma_types::CryptoError::AuthFailed)
    ));
}

#[test]
fn test_tampered_tag_fails_auth() {
    let mut envelope = encrypt(b"secret payload", "pw").unwrap();
    envelope.tag[0] ^= 0x80;
    assert!(matches!(
        decrypt(&envelope, "pw"),
        Err(firma_types::CryptoError::AuthFailed)
    ));
}

#[test]
fn test_fresh_salt_and_iv_per_envelope() {
    let a = encrypt(b"same input", "pw").unwrap();
    let b = encrypt(b"same input", "pw").unwrap();
    assert_ne!(a.salt, b.salt);
    assert_ne!(a.iv, b.iv);
    assert_ne!(a.ciphertext, b.ciphertext);
}

#[test]
fn test_empty_payload() {
    let envelope = encrypt(b"", "pw").unwrap();
    assert!(envelope.ciphertext.is_empty());
    assert_eq!(decrypt(&envelope, "pw").unwrap(), b"");
}
