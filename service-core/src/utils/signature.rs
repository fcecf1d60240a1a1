use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded `HMAC-SHA256(body, secret)`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex-encoded body signature using constant-time comparison
pub fn verify_payload(secret: &str, body: &[u8], signature: &str) -> Result<bool, anyhow::Error> {
    let expected = sign_payload(secret, body)?;
    let expected_bytes = expected.as_bytes();
    let signature_bytes = signature.trim().to_ascii_lowercase().into_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(&signature_bytes).into())
}
