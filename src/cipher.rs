//! Cipher service - payload encryption, integrity hashes, permission encoding.
//!
//! # Algorithms
//!
//! - **Encryption**: ChaCha20-Poly1305 (authenticated encryption)
//! - **Nonce**: 96-bit, drawn from the OS RNG on every call
//! - **Integrity hash**: SHA-256, rendered as `sha256-<hex>`
//! - **Permission tokens**: URL-safe base64 over the canonical JSON form
//!
//! Keys are never persisted. A key is handed back to the submitting patient
//! once and is zeroized when the last copy is dropped.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::HealthError;
use crate::permissions::ConsentPermissions;

// =============================================================================
// Constants
// =============================================================================

/// Symmetric key length (256 bits)
pub const KEY_LEN: usize = 32;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

// =============================================================================
// Keys
// =============================================================================

/// Symmetric payload key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Standard base64, the form returned to the patient
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, HealthError> {
        let mut raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| HealthError::Validation(format!("encryption key is not base64: {e}")))?;

        if raw.len() != KEY_LEN {
            let len = raw.len();
            raw.zeroize();
            return Err(HealthError::Validation(format!(
                "encryption key must be {KEY_LEN} bytes, got {len}"
            )));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self(key))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Generate a fresh random key.
pub fn generate_key() -> EncryptionKey {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    EncryptionKey(bytes)
}

// =============================================================================
// Encryption / Decryption
// =============================================================================

/// Ciphertext plus the nonce it was sealed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub iv: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Blob layout: `iv || ciphertext`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HealthError> {
        if bytes.len() < NONCE_LEN + AUTH_TAG_LEN {
            return Err(HealthError::Decryption(format!(
                "payload too short: {} bytes",
                bytes.len()
            )));
        }

        let mut iv = [0u8; NONCE_LEN];
        iv.copy_from_slice(&bytes[..NONCE_LEN]);
        Ok(Self {
            iv,
            ciphertext: bytes[NONCE_LEN..].to_vec(),
        })
    }
}

/// Encrypt with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<EncryptedPayload, HealthError> {
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| HealthError::Internal(format!("Encryption failed: {e}")))?;

    Ok(EncryptedPayload { iv, ciphertext })
}

/// Decrypt and authenticate.
///
/// # Errors
///
/// `Decryption` when the nonce has the wrong length, the key is wrong, or the
/// ciphertext was tampered with.
pub fn decrypt(ciphertext: &[u8], iv: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, HealthError> {
    if iv.len() != NONCE_LEN {
        return Err(HealthError::Decryption(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            iv.len()
        )));
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| HealthError::Decryption("authentication failed".into()))
}

// =============================================================================
// Hashing
// =============================================================================

/// SHA-256 content hash, `sha256-<hex>`
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

// =============================================================================
// Permission tokens
// =============================================================================

/// Encode permissions for storage outside the primary datastore.
pub fn encode_permissions(permissions: &ConsentPermissions) -> Result<String, HealthError> {
    let json = serde_json::to_vec(permissions)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_permissions(token: &str) -> Result<ConsentPermissions, HealthError> {
    let json = URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|e| HealthError::MalformedPermissions(e.to_string()))?;

    serde_json::from_slice(&json).map_err(|e| HealthError::MalformedPermissions(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let messages: [&[u8]; 4] = [
            b"",
            b"x",
            b"{\"glucose\": 5.4, \"hba1c\": 6.1}",
            &[0u8; 4096],
        ];
        for message in messages {
            let sealed = encrypt(message, &key).unwrap();
            assert_eq!(sealed.ciphertext.len(), message.len() + AUTH_TAG_LEN);

            let opened = decrypt(&sealed.ciphertext, &sealed.iv, &key).unwrap();
            assert_eq!(opened, message);
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = generate_key();
        let a = encrypt(b"same plaintext", &key).unwrap();
        let b = encrypt(b"same plaintext", &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let sealed = encrypt(b"private", &generate_key()).unwrap();
        let result = decrypt(&sealed.ciphertext, &sealed.iv, &generate_key());
        assert!(matches!(result, Err(HealthError::Decryption(_))));
    }

    #[test]
    fn test_decrypt_tampered_fails() {
        let key = generate_key();
        let mut sealed = encrypt(b"private", &key).unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(matches!(
            decrypt(&sealed.ciphertext, &sealed.iv, &key),
            Err(HealthError::Decryption(_))
        ));
    }

    #[test]
    fn test_decrypt_bad_nonce_length() {
        let key = generate_key();
        let sealed = encrypt(b"private", &key).unwrap();
        assert!(matches!(
            decrypt(&sealed.ciphertext, &sealed.iv[..8], &key),
            Err(HealthError::Decryption(_))
        ));
    }

    #[test]
    fn test_payload_blob_layout() {
        let key = generate_key();
        let sealed = encrypt(b"layout", &key).unwrap();
        let parsed = EncryptedPayload::from_bytes(&sealed.to_bytes()).unwrap();
        assert_eq!(parsed, sealed);
        assert!(EncryptedPayload::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_key_base64() {
        let key = generate_key();
        let restored = EncryptionKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(restored, key);
        assert!(EncryptionKey::from_base64("c2hvcnQ=").is_err());
        assert_eq!(format!("{:?}", key), "EncryptionKey(<redacted>)");
    }

    #[test]
    fn test_content_hash_deterministic() {
        assert_eq!(content_hash(b"bloodwork"), content_hash(b"bloodwork"));
        assert_ne!(content_hash(b"bloodwork"), content_hash(b"imaging"));
        assert_eq!(
            content_hash(b""),
            "sha256-e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_permission_token_roundtrip() {
        let perms = ConsentPermissions {
            research_use: true,
            third_party_sharing: true,
            ..Default::default()
        };
        let token = encode_permissions(&perms).unwrap();
        assert!(!token.contains('{'));
        assert_eq!(decode_permissions(&token).unwrap(), perms);
    }

    #[test]
    fn test_malformed_permission_token() {
        assert!(matches!(
            decode_permissions("!!not-base64!!"),
            Err(HealthError::MalformedPermissions(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"plain text");
        assert!(matches!(
            decode_permissions(&not_json),
            Err(HealthError::MalformedPermissions(_))
        ));
    }
}
