//! The `X-Webhook-Signature` header.
//!
//! Rendered as `v1,ts={unix_seconds},kid={key_id},sig={base64_hmac}`.
//! Receivers parse it back with [`SignatureHeader::from_str`] and check it
//! with [`verify_signature_header`].

use std::fmt;
use std::str::FromStr;

use crate::crypto::{self, SIGNATURE_TOLERANCE_SECS, SIGNATURE_VERSION};

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the event id.
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-Id";

/// Parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub version: String,
    pub timestamp: i64,
    pub key_id: String,
    pub signature: String,
}

impl SignatureHeader {
    /// Sign `body` now and build the header for it.
    pub fn sign(
        timestamp: i64,
        key_id: &str,
        event_id: &str,
        body: &[u8],
        secret: &str,
    ) -> Result<Self, crate::WebhookError> {
        let signature = crypto::sign(SIGNATURE_VERSION, timestamp, event_id, body, secret)?;
        Ok(Self {
            version: SIGNATURE_VERSION.to_string(),
            timestamp,
            key_id: key_id.to_string(),
            signature,
        })
    }
}

impl fmt::Display for SignatureHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},ts={},kid={},sig={}",
            self.version, self.timestamp, self.key_id, self.signature
        )
    }
}

/// Why a received signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Malformed signature header: {0}")]
    Malformed(String),

    #[error("Unsupported signature version: {0}")]
    UnsupportedVersion(String),

    #[error("Signature timestamp outside the {SIGNATURE_TOLERANCE_SECS}s tolerance")]
    Expired,

    #[error("Signature mismatch")]
    Mismatch,
}

impl FromStr for SignatureHeader {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);

        let version = parts
            .next()
            .filter(|v| !v.is_empty() && !v.contains('='))
            .ok_or_else(|| SignatureError::Malformed("missing version".to_string()))?
            .to_string();

        let mut timestamp = None;
        let mut key_id = None;
        let mut signature = None;

        for part in parts {
            // Base64 padding means only the first '=' separates key and value.
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| SignatureError::Malformed(format!("bad segment: {part}")))?;
            match key {
                "ts" => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| {
                        SignatureError::Malformed(format!("bad timestamp: {value}"))
                    })?);
                }
                "kid" => key_id = Some(value.to_string()),
                "sig" => signature = Some(value.to_string()),
                // Unknown segments are ignored so the format can grow.
                _ => {}
            }
        }

        Ok(Self {
            version,
            timestamp: timestamp
                .ok_or_else(|| SignatureError::Malformed("missing ts".to_string()))?,
            key_id: key_id.ok_or_else(|| SignatureError::Malformed("missing kid".to_string()))?,
            signature: signature
                .filter(|s| !s.is_empty())
                .ok_or_else(|| SignatureError::Malformed("missing sig".to_string()))?,
        })
    }
}

/// Verify a received request against the subscriber secret.
pub fn verify_signature_header(
    header: &str,
    event_id: &str,
    body: &[u8],
    secret: &str,
) -> Result<SignatureHeader, SignatureError> {
    verify_signature_header_at(header, event_id, body, secret, chrono::Utc::now().timestamp())
}

/// [`verify_signature_header`] as of `now` (unix seconds).
pub fn verify_signature_header_at(
    header: &str,
    event_id: &str,
    body: &[u8],
    secret: &str,
    now: i64,
) -> Result<SignatureHeader, SignatureError> {
    let parsed: SignatureHeader = header.parse()?;

    if parsed.version != SIGNATURE_VERSION {
        return Err(SignatureError::UnsupportedVersion(parsed.version));
    }
    if now.abs_diff(parsed.timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        return Err(SignatureError::Expired);
    }
    if !crypto::verify_at(
        &parsed.signature,
        &parsed.version,
        parsed.timestamp,
        event_id,
        body,
        secret,
        now,
    ) {
        return Err(SignatureError::Mismatch);
    }

    Ok(parsed)
}
