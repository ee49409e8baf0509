//! Manifest JWS signature verification
//!
//! Signed manifests carry a `signatures` block in the libtrust style:
//! each signature names an embedded JWK and a protected header holding
//! `formatLength` and `formatTail`, from which the canonical payload is
//! reconstructed as `raw[..formatLength] ++ decode(formatTail)`. The
//! signed message is `protected + "." + base64url(payload)`.
//!
//! Only ES256 with an embedded P-256 JWK is accepted, the libtrust
//! signing default. Anything else fails verification rather than
//! erroring internally.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JwsError {
    #[error("manifest carries no signatures")]
    Missing,

    #[error("malformed signature block: {0}")]
    Malformed(String),

    #[error("unsupported signature algorithm: {0}")]
    Unsupported(String),

    #[error("signature verification failed")]
    BadSignature,
}

#[derive(Deserialize)]
struct SignatureBlock {
    header: SignatureHeader,
    protected: String,
    signature: String,
}

#[derive(Deserialize)]
struct SignatureHeader {
    jwk: Jwk,
    alg: Option<String>,
}

#[derive(Deserialize)]
struct Jwk {
    kty: String,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

#[derive(Deserialize)]
struct Protected {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
}

fn b64(field: &str, value: &str) -> Result<Vec<u8>, JwsError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| JwsError::Malformed(format!("{} is not base64url", field)))
}

/// Verify every signature on a manifest and return the canonical payload
/// they cover.
///
/// The raw bytes are never mutated or re-marshalled; the payload is cut
/// straight out of them so the caller's digest matches what was signed.
pub fn verify(raw: &[u8], doc: &Value) -> Result<Vec<u8>, JwsError> {
    let signatures = doc
        .get("signatures")
        .and_then(Value::as_array)
        .ok_or(JwsError::Missing)?;
    if signatures.is_empty() {
        return Err(JwsError::Missing);
    }

    let mut payload: Option<Vec<u8>> = None;

    for entry in signatures {
        let block: SignatureBlock = serde_json::from_value(entry.clone())
            .map_err(|e| JwsError::Malformed(e.to_string()))?;

        let alg = block.header.alg.as_deref().unwrap_or("none");
        if alg != "ES256" {
            return Err(JwsError::Unsupported(alg.to_string()));
        }
        let jwk = &block.header.jwk;
        if jwk.kty != "EC" || jwk.crv.as_deref() != Some("P-256") {
            return Err(JwsError::Unsupported(format!(
                "jwk kty={} crv={}",
                jwk.kty,
                jwk.crv.as_deref().unwrap_or("")
            )));
        }

        let protected_raw = b64("protected header", &block.protected)?;
        let protected: Protected = serde_json::from_slice(&protected_raw)
            .map_err(|e| JwsError::Malformed(format!("protected header: {}", e)))?;

        if protected.format_length > raw.len() {
            return Err(JwsError::Malformed(
                "formatLength exceeds manifest length".to_string(),
            ));
        }
        let tail = b64("formatTail", &protected.format_tail)?;
        let mut current = raw[..protected.format_length].to_vec();
        current.extend_from_slice(&tail);

        match &payload {
            Some(prev) if prev != &current => {
                return Err(JwsError::Malformed(
                    "signatures cover different payloads".to_string(),
                ));
            }
            Some(_) => {}
            None => payload = Some(current.clone()),
        }

        let key = decode_key(jwk)?;
        let signature_raw = b64("signature", &block.signature)?;
        let signature = Signature::from_slice(&signature_raw)
            .map_err(|_| JwsError::Malformed("signature is not an r||s pair".to_string()))?;

        let message = format!("{}.{}", block.protected, URL_SAFE_NO_PAD.encode(&current));
        key.verify(message.as_bytes(), &signature)
            .map_err(|_| JwsError::BadSignature)?;
    }

    // At least one signature was verified, so a payload was recorded
    payload.ok_or(JwsError::Missing)
}

fn decode_key(jwk: &Jwk) -> Result<VerifyingKey, JwsError> {
    let x = b64("jwk x", jwk.x.as_deref().unwrap_or(""))?;
    let y = b64("jwk y", jwk.y.as_deref().unwrap_or(""))?;
    if x.len() != 32 || y.len() != 32 {
        return Err(JwsError::Malformed(
            "jwk coordinates must be 32 bytes".to_string(),
        ));
    }

    let point = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&x),
        FieldBytes::from_slice(&y),
        false,
    );
    VerifyingKey::from_encoded_point(&point)
        .map_err(|_| JwsError::Malformed("jwk is not a valid P-256 point".to_string()))
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Signing support for tests. The registry itself never signs.

    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::Signer as _;

    /// Append a valid ES256 signature block to an unsigned manifest
    /// JSON object (which must end in `}`).
    pub(crate) fn sign(unsigned: &str) -> String {
        let format_length = unsigned.len() - 1;
        let format_tail = URL_SAFE_NO_PAD.encode("}");
        let protected = URL_SAFE_NO_PAD.encode(format!(
            "{{\"formatLength\":{},\"formatTail\":\"{}\"}}",
            format_length, format_tail
        ));

        let message = format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(unsigned));

        let key = SigningKey::from_slice(&[0x42u8; 32]).unwrap();
        let signature: Signature = key.sign(message.as_bytes());
        let point = key.verifying_key().to_encoded_point(false);
        let x = URL_SAFE_NO_PAD.encode(point.x().unwrap());
        let y = URL_SAFE_NO_PAD.encode(point.y().unwrap());

        format!(
            "{},\"signatures\":[{{\"header\":{{\"jwk\":{{\"crv\":\"P-256\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}},\"alg\":\"ES256\"}},\"protected\":\"{}\",\"signature\":\"{}\"}}]}}",
            &unsigned[..format_length],
            x,
            y,
            protected,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }
}
