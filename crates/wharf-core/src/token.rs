//! HMAC-signed upload-state tokens
//!
//! Resumable upload URLs carry an opaque `_state` token describing the
//! client's view of the session. The MAC must verify under the server
//! secret before any field in it is trusted; the server-side session
//! remains the source of truth for the offset.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Malformed upload state token")]
    Malformed,

    #[error("Upload state token signature mismatch")]
    BadSignature,
}

/// The client-side view of an upload session, as carried in the token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadState {
    /// Repository the upload is scoped to
    pub name: String,
    /// Upload session ID
    pub uuid: String,
    /// Offset the client believes the session is at (advisory)
    pub offset: u64,
    /// Session start time, RFC 3339
    pub started_at: String,
}

fn mac(secret: &[u8], payload: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(payload);
    mac
}

/// Serialize and sign an upload state
pub fn pack(state: &UploadState, secret: &[u8]) -> String {
    let payload =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(state).expect("upload state serializes"));
    let tag = mac(secret, payload.as_bytes()).finalize().into_bytes();
    format!("{}.{}", payload, hex::encode(tag))
}

/// Verify and deserialize an upload state token.
///
/// The MAC is checked (in constant time) before the payload is decoded.
pub fn unpack(token: &str, secret: &[u8]) -> Result<UploadState, TokenError> {
    let (payload, tag_hex) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let tag = hex::decode(tag_hex).map_err(|_| TokenError::Malformed)?;

    mac(secret, payload.as_bytes())
        .verify_slice(&tag)
        .map_err(|_| TokenError::BadSignature)?;

    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)
}
