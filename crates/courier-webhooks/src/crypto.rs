//! Cryptographic operations for webhook secrets and payload signing.
//!
//! - AES-256-GCM encryption/decryption for subscriber secrets at rest
//! - HMAC-SHA256 signatures over `{version}:{ts}:{event_id}:{sha256(body)}`

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::WebhookError;

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// AES-256 key size.
const KEY_SIZE: usize = 32;

/// Current signature scheme version.
pub const SIGNATURE_VERSION: &str = "v1";

/// Signatures older or newer than this are rejected.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Raw bytes in a generated subscriber secret.
const SECRET_BYTES: usize = 32;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// AES-256-GCM encryption/decryption (for secrets at rest)
// ---------------------------------------------------------------------------

/// Encrypt a plaintext secret to a base64-encoded string for DB storage.
///
/// Format: base64(nonce || ciphertext || auth_tag)
pub fn encrypt_secret(plaintext: &str, key: &[u8]) -> Result<String, WebhookError> {
    if key.len() != KEY_SIZE {
        return Err(WebhookError::Crypto(format!(
            "Invalid key length: expected 32 bytes, got {}",
            key.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| WebhookError::Crypto(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| WebhookError::Crypto(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&result))
}

/// Decrypt a base64-encoded secret from DB storage back to plaintext.
///
/// Any failure (bad base64, truncated input, wrong key, tampered tag) is an
/// error; an empty string is only returned for an encrypted empty secret.
pub fn decrypt_secret(encoded: &str, key: &[u8]) -> Result<String, WebhookError> {
    if key.len() != KEY_SIZE {
        return Err(WebhookError::Crypto(format!(
            "Invalid key length: expected 32 bytes, got {}",
            key.len()
        )));
    }

    let encrypted = BASE64
        .decode(encoded)
        .map_err(|e| WebhookError::Crypto(format!("Base64 decode failed: {e}")))?;

    // GCM tag is 16 bytes, so even an empty plaintext is longer than the nonce.
    if encrypted.len() < NONCE_SIZE + 16 {
        return Err(WebhookError::Crypto(
            "Invalid encrypted data format".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| WebhookError::Crypto(e.to_string()))?;

    let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);
    let ciphertext = &encrypted[NONCE_SIZE..];

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| WebhookError::Crypto("Decryption failed".to_string()))?;

    String::from_utf8(plaintext).map_err(|e| WebhookError::Crypto(e.to_string()))
}

/// Encrypts and decrypts subscriber secrets with a key derived from the
/// configured master key (`SHA-256(master_key)`).
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_SIZE],
}

impl SecretCipher {
    #[must_use]
    pub fn from_master_key(master_key: &str) -> Self {
        Self {
            key: Sha256::digest(master_key.as_bytes()).into(),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, WebhookError> {
        encrypt_secret(plaintext, &self.key)
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, WebhookError> {
        decrypt_secret(encoded, &self.key)
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generate a new subscriber secret: 32 random bytes, base64.
#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

// ---------------------------------------------------------------------------
// HMAC-SHA256 payload signing
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of the request body.
#[must_use]
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// The string that gets MACed.
#[must_use]
pub fn signing_message(version: &str, timestamp: i64, event_id: &str, body: &[u8]) -> String {
    format!("{version}:{timestamp}:{event_id}:{}", body_digest(body))
}

/// Sign a webhook body.
///
/// Returns base64(HMAC-SHA256(secret, signing message)).
pub fn sign(
    version: &str,
    timestamp: i64,
    event_id: &str,
    body: &[u8],
    secret: &str,
) -> Result<String, WebhookError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Signing(e.to_string()))?;
    mac.update(signing_message(version, timestamp, event_id, body).as_bytes());

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Verify a signature against the current clock.
#[must_use]
pub fn verify(
    signature: &str,
    version: &str,
    timestamp: i64,
    event_id: &str,
    body: &[u8],
    secret: &str,
) -> bool {
    verify_at(
        signature,
        version,
        timestamp,
        event_id,
        body,
        secret,
        chrono::Utc::now().timestamp(),
    )
}

/// Verify a signature as of `now` (unix seconds).
///
/// Rejects timestamps more than [`SIGNATURE_TOLERANCE_SECS`] away from `now`
/// in either direction, then compares in constant time.
#[must_use]
pub fn verify_at(
    signature: &str,
    version: &str,
    timestamp: i64,
    event_id: &str,
    body: &[u8],
    secret: &str,
    now: i64,
) -> bool {
    if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        return false;
    }

    match sign(version, timestamp, event_id, body, secret) {
        Ok(expected) => constant_time_eq(signature.as_bytes(), expected.as_bytes()),
        Err(_) => false,
    }
}

/// Constant-time byte comparison to prevent timing attacks.
///
/// Length mismatches return immediately.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
