//! API error types
//!
//! Maps core errors onto the v2 error taxonomy. Every failure response
//! carries a JSON body of the form
//! `{"errors":[{"code","message","detail"},…]}`; a rejected manifest
//! reports every independent failure in one response.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;
use wharf_core::{
    BlobError, DigestError, ManifestError, NameError, Rejection, TagError, UploadError,
};
use wharf_storage::StorageError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("The operation is unsupported")]
    Unsupported,

    #[error("Repository name not known to registry: {0}")]
    NameUnknown(String),

    #[error("Invalid repository name: {0}")]
    NameInvalid(String),

    #[error("Invalid tag: {0}")]
    TagInvalid(String),

    #[error("Invalid digest: {0}")]
    DigestInvalid(String),

    #[error("Invalid content size: {0}")]
    SizeInvalid(String),

    #[error("Blob unknown to registry: {0}")]
    BlobUnknown(String),

    #[error("Blob upload unknown to registry: {0}")]
    BlobUploadUnknown(String),

    #[error("Blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    #[error("Requested range does not match upload offset")]
    RangeMismatch { offset: u64 },

    #[error("Manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("Manifest rejected")]
    ManifestRejected(Vec<Rejection>),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied")]
    Denied,

    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DigestError> for ApiError {
    fn from(e: DigestError) -> Self {
        ApiError::DigestInvalid(e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) => ApiError::NotFound,
            StorageError::DigestMismatch { expected, actual } => ApiError::DigestInvalid(format!(
                "content does not match digest: expected {}, got {}",
                expected, actual
            )),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::Unknown(digest) => ApiError::BlobUnknown(digest),
            BlobError::Digest(e) => e.into(),
            BlobError::Storage(e) => e.into(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Unknown(id) => ApiError::BlobUploadUnknown(id),
            UploadError::InvalidOffset { expected } => ApiError::RangeMismatch { offset: expected },
            UploadError::InvalidToken(msg) => ApiError::BlobUploadInvalid(msg),
            UploadError::Digest(e) => e.into(),
            UploadError::Storage(e) => e.into(),
        }
    }
}

impl From<ManifestError> for ApiError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Unknown(reference) => ApiError::ManifestUnknown(reference),
            ManifestError::Rejected(rejections) => ApiError::ManifestRejected(rejections),
            ManifestError::Digest(e) => e.into(),
            ManifestError::Storage(e) => e.into(),
        }
    }
}

impl From<NameError> for ApiError {
    fn from(e: NameError) -> Self {
        ApiError::NameInvalid(e.0)
    }
}

impl From<TagError> for ApiError {
    fn from(e: TagError) -> Self {
        ApiError::TagInvalid(e.0)
    }
}

fn rejection_entry(rejection: &Rejection) -> Value {
    let (code, message, detail) = match rejection {
        Rejection::Invalid(msg) => ("MANIFEST_INVALID", msg.clone(), Value::Null),
        Rejection::BlobUnknown(digest) => (
            "MANIFEST_BLOB_UNKNOWN",
            "manifest references unknown blob".to_string(),
            json!(digest.to_string()),
        ),
        Rejection::DigestInvalid(msg) => ("DIGEST_INVALID", msg.clone(), Value::Null),
        Rejection::Unverified(msg) => ("MANIFEST_UNVERIFIED", msg.clone(), Value::Null),
    };
    json!({ "code": code, "message": message, "detail": detail })
}

fn error_body(entries: Vec<Value>) -> axum::Json<Value> {
    axum::Json(json!({ "errors": entries }))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::ManifestRejected(rejections) => {
                let entries = rejections.iter().map(rejection_entry).collect();
                (StatusCode::BAD_REQUEST, error_body(entries)).into_response()
            }
            ApiError::RangeMismatch { offset } => {
                let range = if offset == 0 {
                    "0-0".to_string()
                } else {
                    format!("0-{}", offset - 1)
                };
                let entries = vec![json!({
                    "code": "BLOB_UPLOAD_INVALID",
                    "message": "chunk offset does not match upload offset",
                    "detail": { "offset": offset },
                })];
                let mut response = (StatusCode::RANGE_NOT_SATISFIABLE, error_body(entries))
                    .into_response();
                response.headers_mut().insert(
                    header::RANGE,
                    HeaderValue::from_str(&range).unwrap(),
                );
                response
            }
            ApiError::Internal(ref msg) => {
                // 5xx responses never leak backend detail to clients
                error!("Internal error: {}", msg);
                let entries = vec![json!({
                    "code": "UNKNOWN",
                    "message": "internal error",
                    "detail": Value::Null,
                })];
                (StatusCode::INTERNAL_SERVER_ERROR, error_body(entries)).into_response()
            }
            other => {
                let (status, code, detail) = match &other {
                    ApiError::Unsupported => (StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED", Value::Null),
                    ApiError::NameUnknown(name) => {
                        (StatusCode::NOT_FOUND, "NAME_UNKNOWN", json!({ "name": name }))
                    }
                    ApiError::NameInvalid(name) => {
                        (StatusCode::BAD_REQUEST, "NAME_INVALID", json!({ "name": name }))
                    }
                    ApiError::TagInvalid(tag) => {
                        (StatusCode::BAD_REQUEST, "TAG_INVALID", json!({ "tag": tag }))
                    }
                    ApiError::DigestInvalid(_) => {
                        (StatusCode::BAD_REQUEST, "DIGEST_INVALID", Value::Null)
                    }
                    ApiError::SizeInvalid(_) => {
                        (StatusCode::BAD_REQUEST, "SIZE_INVALID", Value::Null)
                    }
                    ApiError::Unauthorized => {
                        (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", Value::Null)
                    }
                    ApiError::Denied => (StatusCode::FORBIDDEN, "DENIED", Value::Null),
                    ApiError::BlobUnknown(digest) => {
                        (StatusCode::NOT_FOUND, "BLOB_UNKNOWN", json!(digest))
                    }
                    ApiError::BlobUploadUnknown(_) => {
                        (StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", Value::Null)
                    }
                    ApiError::BlobUploadInvalid(_) => {
                        (StatusCode::BAD_REQUEST, "BLOB_UPLOAD_INVALID", Value::Null)
                    }
                    ApiError::ManifestUnknown(reference) => {
                        (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", json!(reference))
                    }
                    // UNSUPPORTED is reserved for disabled operations
                    // (405); unroutable paths and malformed requests get
                    // the generic code at their own status
                    ApiError::NotFound => (StatusCode::NOT_FOUND, "UNKNOWN", Value::Null),
                    ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "UNKNOWN", Value::Null),
                    // Handled above
                    ApiError::ManifestRejected(_)
                    | ApiError::RangeMismatch { .. }
                    | ApiError::Internal(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", Value::Null)
                    }
                };

                let entries = vec![json!({
                    "code": code,
                    "message": other.to_string(),
                    "detail": detail,
                })];
                (status, error_body(entries)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_errors_map_to_taxonomy() {
        let err: ApiError = UploadError::Unknown("x".to_string()).into();
        assert!(matches!(err, ApiError::BlobUploadUnknown(_)));

        let err: ApiError = UploadError::InvalidOffset { expected: 7 }.into();
        assert!(matches!(err, ApiError::RangeMismatch { offset: 7 }));
    }

    #[test]
    fn test_manifest_rejections_become_error_list() {
        let rejections = vec![
            Rejection::Invalid("missing tag".to_string()),
            Rejection::Unverified("no signatures".to_string()),
        ];
        let response = ApiError::ManifestRejected(rejections).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_range_mismatch_carries_range_header() {
        let response = ApiError::RangeMismatch { offset: 10 }.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers().get(header::RANGE).unwrap(), "0-9");
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let response = ApiError::Internal("disk quota exceeded on /srv/blobs".to_string())
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
