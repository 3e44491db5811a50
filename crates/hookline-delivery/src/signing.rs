//! HMAC-SHA256 request signing.
//!
//! The signature covers the exact body bytes that go on the wire and is sent
//! lowercase hex-encoded in the `X-Signature` header. Receivers verify it
//! with the app's webhook secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Signs `payload` with `secret` and returns the lowercase hex digest.
///
/// # Errors
///
/// Returns `DeliveryError::SigningError` if the key cannot be used.
pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::signing(format!("invalid webhook secret: {e}")))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a signature produced by [`sign_payload`].
///
/// Accepts raw hex or the `sha256=<hex>` form. Comparison is constant-time.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let encoded = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(encoded.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
