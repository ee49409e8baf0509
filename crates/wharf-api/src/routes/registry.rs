//! Distribution API routes
//!
//! Repository names contain slashes, so everything below `/v2/` goes
//! through a wildcard route and the path is parsed by suffix. The
//! dispatcher validates the HMAC upload-state token on every
//! upload-related request before any session state is touched, and
//! refuses mutations in read-only and mirror deployments.

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use wharf_core::{Digest, ManifestRef, UploadManager, uploads::UploadSession};
use wharf_storage::{ByteStream, StorageError};

use crate::error::ApiError;
use crate::state::AppState;

/// Media type served for stored signed manifests
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Manifests are small JSON documents; anything larger is rejected
const MANIFEST_SIZE_LIMIT: usize = 4 * 1024 * 1024;

/// Query parameters across the registry endpoints
#[derive(Deserialize, Default)]
pub struct RegistryQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
    n: Option<usize>,
    last: Option<String>,
    #[serde(rename = "_state")]
    state: Option<String>,
}

// ==================== Routes ====================

/// Create registry routes
pub fn routes() -> Router<AppState> {
    Router::new()
        // Version check
        .route("/v2/", get(version_check))
        // Repository catalog
        .route("/v2/_catalog", get(catalog))
        // Everything else embeds a repository name, which may span
        // multiple path segments (e.g. library/alpine)
        .route(
            "/v2/{*path}",
            get(handle_get_or_head_request)
                .put(handle_put_request)
                .post(handle_post_request)
                .patch(handle_patch_request)
                .delete(handle_delete_request),
        )
}

// ==================== Path parsing ====================

enum RegistryRequest {
    Tags { name: String },
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    StartUpload { name: String },
    Upload { name: String, uuid: String },
}

/// Parse a path to extract the repository name and operation
fn parse_registry_path(path: &str) -> Option<RegistryRequest> {
    // Paths are like:
    // - library/alpine/tags/list
    // - library/alpine/manifests/latest
    // - library/alpine/blobs/sha256:...
    // - library/alpine/blobs/uploads/
    // - library/alpine/blobs/uploads/{uuid}

    if let Some(name) = path.strip_suffix("/tags/list") {
        return Some(RegistryRequest::Tags {
            name: name.to_string(),
        });
    }

    // Uploads before blobs: an upload path contains "/blobs/" too
    if let Some(idx) = path.rfind("/blobs/uploads/") {
        let name = &path[..idx];
        let uuid = &path[idx + 15..]; // len("/blobs/uploads/")
        if uuid.is_empty() {
            return Some(RegistryRequest::StartUpload {
                name: name.to_string(),
            });
        }
        return Some(RegistryRequest::Upload {
            name: name.to_string(),
            uuid: uuid.to_string(),
        });
    }

    if let Some(idx) = path.rfind("/manifests/") {
        let name = &path[..idx];
        let reference = &path[idx + 11..]; // len("/manifests/")
        return Some(RegistryRequest::Manifest {
            name: name.to_string(),
            reference: reference.to_string(),
        });
    }

    if let Some(idx) = path.rfind("/blobs/") {
        let name = &path[..idx];
        let digest = &path[idx + 7..]; // len("/blobs/")
        return Some(RegistryRequest::Blob {
            name: name.to_string(),
            digest: digest.to_string(),
        });
    }

    None
}

// ==================== Helpers ====================

fn parse_name(name: &str) -> Result<(), ApiError> {
    wharf_core::validate_name(name)?;
    Ok(())
}

fn parse_digest(raw: &str) -> Result<Digest, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::DigestInvalid(raw.to_string()))
}

fn parse_manifest_ref(reference: &str) -> Result<ManifestRef, ApiError> {
    if reference.contains(':') {
        Ok(ManifestRef::Digest(parse_digest(reference)?))
    } else {
        wharf_core::validate_tag(reference)?;
        Ok(ManifestRef::Tag(reference.to_string()))
    }
}

fn ensure_writable(state: &AppState) -> Result<(), ApiError> {
    if state.read_only || state.mirror_mode {
        return Err(ApiError::Unsupported);
    }
    Ok(())
}

fn require_token(
    uploads: &UploadManager,
    query: &RegistryQuery,
    name: &str,
    uuid: &str,
) -> Result<(), ApiError> {
    let raw = query
        .state
        .as_deref()
        .ok_or_else(|| ApiError::BlobUploadInvalid("missing upload state".to_string()))?;
    let state = uploads.verify_token(raw, name, uuid)?;
    debug!(
        "Upload {} token verified (client offset {})",
        uuid, state.offset
    );
    Ok(())
}

/// Range header value for an upload at `offset`
fn upload_range(offset: u64) -> String {
    if offset == 0 {
        "0-0".to_string()
    } else {
        format!("0-{}", offset - 1)
    }
}

fn upload_location(name: &str, uuid: &str, token: &str) -> String {
    format!("/v2/{}/blobs/uploads/{}?_state={}", name, uuid, token)
}

fn etag(digest: &Digest) -> String {
    format!("\"{}\"", digest)
}

fn if_none_match_hits(headers: &HeaderMap, digest: &Digest) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag(digest) || v == digest.to_string())
}

/// Adapt a request body into the storage byte stream the core consumes
fn body_stream(request: Request) -> ByteStream {
    Box::pin(
        request
            .into_body()
            .into_data_stream()
            .map(|result| result.map_err(|e| StorageError::Io(std::io::Error::other(e)))),
    )
}

/// Paginate a sorted listing with `?n=<max>&last=<marker>` semantics.
/// Returns the page and the marker for a next page, if one may exist.
fn paginate(
    items: Vec<String>,
    n: Option<usize>,
    last: Option<&str>,
) -> (Vec<String>, Option<String>) {
    let start = last
        .and_then(|l| items.iter().position(|x| x == l))
        .map(|i| i + 1)
        .unwrap_or(0);

    match n {
        None => (items.into_iter().skip(start).collect(), None),
        Some(n) => {
            let page: Vec<String> = items.into_iter().skip(start).take(n).collect();
            let next = if n > 0 && page.len() == n {
                page.last().cloned()
            } else {
                None
            };
            (page, next)
        }
    }
}

fn upload_accepted(
    status: StatusCode,
    name: &str,
    uuid: &str,
    token: &str,
    offset: u64,
) -> Response {
    let mut response = status.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&upload_location(name, uuid, token)).unwrap(),
    );
    headers.insert(
        header::RANGE,
        HeaderValue::from_str(&upload_range(offset)).unwrap(),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
    headers.insert("Docker-Upload-UUID", HeaderValue::from_str(uuid).unwrap());
    response
}

// ==================== Version check ====================

/// GET /v2/ - API version check
async fn version_check() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::HeaderName::from_static("docker-distribution-api-version"),
                "registry/2.0",
            ),
        ],
        "{}",
    )
        .into_response()
}

// ==================== Catalog ====================

/// GET /v2/_catalog - list repositories
async fn catalog(
    State(state): State<AppState>,
    Query(query): Query<RegistryQuery>,
) -> Result<Response, ApiError> {
    let repositories = state.namespace.catalog().await?;
    let (page, next) = paginate(repositories, query.n, query.last.as_deref());

    let mut response = (
        StatusCode::OK,
        axum::Json(json!({ "repositories": page })),
    )
        .into_response();
    if let (Some(last), Some(n)) = (next, query.n) {
        let link = format!("</v2/_catalog?n={}&last={}>; rel=\"next\"", n, last);
        response
            .headers_mut()
            .insert(header::LINK, HeaderValue::from_str(&link).unwrap());
    }
    Ok(response)
}

// ==================== GET / HEAD ====================

/// Handle GET and HEAD requests
async fn handle_get_or_head_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<RegistryQuery>,
    headers: HeaderMap,
    method: Method,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or(ApiError::NotFound)?;

    match req {
        RegistryRequest::Tags { name } => tags_list(&state, &name, &query).await,
        RegistryRequest::Manifest { name, reference } => {
            parse_name(&name)?;
            let reference = parse_manifest_ref(&reference)?;
            debug!("{} manifest: {}:{}", method, name, reference);

            let (raw, digest) = state.manifests.get(&name, &reference).await?;
            metrics::counter!("wharf_manifest_pulls_total").increment(1);

            if if_none_match_hits(&headers, &digest) {
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                response
                    .headers_mut()
                    .insert(header::ETAG, HeaderValue::from_str(&etag(&digest)).unwrap());
                return Ok(response);
            }

            let size = raw.len();
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                Body::from(raw)
            };

            let mut response = (StatusCode::OK, body).into_response();
            let resp_headers = response.headers_mut();
            resp_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(MANIFEST_MEDIA_TYPE),
            );
            resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            resp_headers.insert(
                "Docker-Content-Digest",
                HeaderValue::from_str(&digest.to_string()).unwrap(),
            );
            resp_headers.insert(header::ETAG, HeaderValue::from_str(&etag(&digest)).unwrap());
            Ok(response)
        }
        RegistryRequest::Blob { name, digest } => {
            parse_name(&name)?;
            let digest = parse_digest(&digest)?;
            debug!("{} blob: {}", method, digest);

            if method == Method::HEAD {
                let size = state
                    .blobs
                    .stat(&digest)
                    .await?
                    .ok_or_else(|| ApiError::BlobUnknown(digest.to_string()))?;

                let mut response = StatusCode::OK.into_response();
                blob_headers(response.headers_mut(), &digest, Some(size));
                return Ok(response);
            }

            if if_none_match_hits(&headers, &digest) {
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                response
                    .headers_mut()
                    .insert(header::ETAG, HeaderValue::from_str(&etag(&digest)).unwrap());
                return Ok(response);
            }

            let (stream, size) = state.blobs.open(&digest).await?;
            metrics::counter!("wharf_blob_pulls_total").increment(1);

            // Stream the blob to the client (bounded memory usage)
            let body = Body::from_stream(stream);
            let mut response = (StatusCode::OK, body).into_response();
            blob_headers(
                response.headers_mut(),
                &digest,
                (size > 0).then_some(size),
            );
            Ok(response)
        }
        RegistryRequest::Upload { name, uuid } => {
            parse_name(&name)?;
            require_token(&state.uploads, &query, &name, &uuid)?;
            debug!("GET upload status: {}", uuid);

            let handle = state.uploads.resume(&name, &uuid).await?;
            let session = handle.lock().await;
            let token = state.uploads.issue_token(&session);

            let mut response = StatusCode::NO_CONTENT.into_response();
            let resp_headers = response.headers_mut();
            resp_headers.insert(
                header::LOCATION,
                HeaderValue::from_str(&upload_location(&name, &session.uuid, &token)).unwrap(),
            );
            resp_headers.insert(
                header::RANGE,
                HeaderValue::from_str(&upload_range(session.offset)).unwrap(),
            );
            resp_headers.insert(
                "Docker-Upload-UUID",
                HeaderValue::from_str(&session.uuid).unwrap(),
            );
            Ok(response)
        }
        RegistryRequest::StartUpload { .. } => Err(ApiError::NotFound),
    }
}

fn blob_headers(headers: &mut HeaderMap, digest: &Digest, size: Option<u64>) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    headers.insert(
        "Docker-Content-Digest",
        HeaderValue::from_str(&digest.to_string()).unwrap(),
    );
    headers.insert(header::ETAG, HeaderValue::from_str(&etag(digest)).unwrap());
    // Blobs are immutable; cache aggressively
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=31536000"),
    );
}

async fn tags_list(
    state: &AppState,
    name: &str,
    query: &RegistryQuery,
) -> Result<Response, ApiError> {
    parse_name(name)?;
    if !state.namespace.exists(name).await? {
        return Err(ApiError::NameUnknown(name.to_string()));
    }

    let tags = state.namespace.list_tags(name).await?;
    let (page, next) = paginate(tags, query.n, query.last.as_deref());

    let mut response = (
        StatusCode::OK,
        axum::Json(json!({ "name": name, "tags": page })),
    )
        .into_response();
    if let (Some(last), Some(n)) = (next, query.n) {
        let link = format!(
            "</v2/{}/tags/list?n={}&last={}>; rel=\"next\"",
            name, n, last
        );
        response
            .headers_mut()
            .insert(header::LINK, HeaderValue::from_str(&link).unwrap());
    }
    Ok(response)
}

// ==================== PUT ====================

/// Handle PUT requests: manifest push or upload finalization
async fn handle_put_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<RegistryQuery>,
    request: Request,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or(ApiError::NotFound)?;

    match req {
        RegistryRequest::Manifest { name, reference } => {
            ensure_writable(&state)?;
            parse_name(&name)?;
            let reference = parse_manifest_ref(&reference)?;
            debug!("PUT manifest: {}:{}", name, reference);

            let raw = axum::body::to_bytes(request.into_body(), MANIFEST_SIZE_LIMIT)
                .await
                .map_err(|_| ApiError::BadRequest("manifest payload too large".to_string()))?;

            let digest = state.manifests.put(&name, &reference, raw).await?;
            metrics::counter!("wharf_manifest_pushes_total").increment(1);

            let location = format!("/v2/{}/manifests/{}", name, digest);
            let mut response = StatusCode::CREATED.into_response();
            let resp_headers = response.headers_mut();
            resp_headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
            resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
            resp_headers.insert(
                "Docker-Content-Digest",
                HeaderValue::from_str(&digest.to_string()).unwrap(),
            );
            Ok(response)
        }
        RegistryRequest::Upload { name, uuid } => {
            ensure_writable(&state)?;
            parse_name(&name)?;
            require_token(&state.uploads, &query, &name, &uuid)?;

            let digest = query
                .digest
                .as_deref()
                .ok_or_else(|| ApiError::DigestInvalid("missing digest parameter".to_string()))?;
            let digest = parse_digest(digest)?;
            debug!("PUT upload: {} -> {}", uuid, digest);

            let handle = state.uploads.resume(&name, &uuid).await?;
            let mut session = handle.lock().await;

            // The body, when present, is the final chunk
            let descriptor = finalize_upload(&state, &mut session, &digest, request).await?;
            metrics::counter!("wharf_blob_pushes_total").increment(1);

            let location = format!("/v2/{}/blobs/{}", name, descriptor.digest);
            let mut response = StatusCode::CREATED.into_response();
            let resp_headers = response.headers_mut();
            resp_headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
            resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
            resp_headers.insert(
                "Docker-Content-Digest",
                HeaderValue::from_str(&descriptor.digest.to_string()).unwrap(),
            );
            Ok(response)
        }
        _ => Err(ApiError::NotFound),
    }
}

async fn finalize_upload(
    state: &AppState,
    session: &mut UploadSession,
    digest: &Digest,
    request: Request,
) -> Result<wharf_core::Descriptor, ApiError> {
    state
        .uploads
        .patch_chunk(session, None, body_stream(request))
        .await?;
    Ok(state.uploads.commit(session, digest).await?)
}

// ==================== POST ====================

/// Handle POST requests: initiate an upload (or mount a blob)
async fn handle_post_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<RegistryQuery>,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or(ApiError::NotFound)?;

    match req {
        RegistryRequest::StartUpload { name } => {
            ensure_writable(&state)?;
            parse_name(&name)?;

            // Cross-repository mount: the blob store is global, so
            // presence is all that matters
            if let (Some(mount), Some(from)) = (query.mount.as_deref(), query.from.as_deref()) {
                parse_name(from)?;
                let digest = parse_digest(mount)?;
                debug!("Mount request: {} from {}", digest, from);

                if state.blobs.stat(&digest).await?.is_some() {
                    let location = format!("/v2/{}/blobs/{}", name, digest);
                    let mut response = StatusCode::CREATED.into_response();
                    let headers = response.headers_mut();
                    headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
                    headers.insert(
                        "Docker-Content-Digest",
                        HeaderValue::from_str(&digest.to_string()).unwrap(),
                    );
                    return Ok(response);
                }
                // Absent blob: fall through to a regular upload
            }

            debug!("Starting upload for: {}", name);
            let started = state.uploads.create(&name).await?;
            metrics::counter!("wharf_uploads_started_total").increment(1);

            Ok(upload_accepted(
                StatusCode::ACCEPTED,
                &name,
                &started.uuid,
                &started.token,
                0,
            ))
        }
        _ => Err(ApiError::NotFound),
    }
}

// ==================== PATCH ====================

/// Handle PATCH requests: upload a chunk
async fn handle_patch_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<RegistryQuery>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or(ApiError::NotFound)?;

    match req {
        RegistryRequest::Upload { name, uuid } => {
            ensure_writable(&state)?;
            parse_name(&name)?;
            require_token(&state.uploads, &query, &name, &uuid)?;

            // Content-Range is optional; when present, the start must
            // equal the session offset exactly
            let range = match headers
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
            {
                Some(raw) => Some(parse_content_range(raw).ok_or_else(|| {
                    ApiError::BlobUploadInvalid("invalid content range".to_string())
                })?),
                None => None,
            };

            // A declared body length must agree with the range span
            // before any byte is accepted
            let content_length = headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            if let (Some((start, end)), Some(length)) = (range, content_length)
                && end - start + 1 != length
            {
                return Err(ApiError::SizeInvalid(format!(
                    "content range {}-{} does not span {} bytes",
                    start, end, length
                )));
            }

            let asserted_offset = range.map(|(start, _)| start);

            let handle = state.uploads.resume(&name, &uuid).await?;
            let mut session = handle.lock().await;
            debug!("PATCH upload: {} at offset {}", uuid, session.offset);

            let new_offset = state
                .uploads
                .patch_chunk(&mut session, asserted_offset, body_stream(request))
                .await?;

            let token = state.uploads.issue_token(&session);
            Ok(upload_accepted(
                StatusCode::ACCEPTED,
                &name,
                &session.uuid,
                &token,
                new_offset,
            ))
        }
        _ => Err(ApiError::NotFound),
    }
}

fn parse_content_range(header: &str) -> Option<(u64, u64)> {
    let raw = header.trim();
    let raw = raw
        .strip_prefix("bytes ")
        .or_else(|| raw.strip_prefix("bytes="))
        .unwrap_or(raw);
    let raw = raw.split('/').next()?;

    let (start, end) = raw.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    (start <= end).then_some((start, end))
}

// ==================== DELETE ====================

/// Handle DELETE requests: manifests, blobs, upload cancellation
async fn handle_delete_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<RegistryQuery>,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or(ApiError::NotFound)?;

    match req {
        RegistryRequest::Manifest { name, reference } => {
            ensure_writable(&state)?;
            if !state.delete_enabled {
                return Err(ApiError::Unsupported);
            }
            parse_name(&name)?;

            // Deletion addresses the immutable revision, never a tag
            let ManifestRef::Digest(digest) = parse_manifest_ref(&reference)? else {
                return Err(ApiError::Unsupported);
            };
            debug!("DELETE manifest: {}@{}", name, digest);

            state.manifests.delete(&name, &digest).await?;
            Ok(StatusCode::ACCEPTED.into_response())
        }
        RegistryRequest::Blob { name, digest } => {
            ensure_writable(&state)?;
            if !state.delete_enabled {
                return Err(ApiError::Unsupported);
            }
            parse_name(&name)?;
            let digest = parse_digest(&digest)?;
            debug!("DELETE blob: {}", digest);

            state.blobs.delete(&digest).await?;
            Ok(StatusCode::ACCEPTED.into_response())
        }
        RegistryRequest::Upload { name, uuid } => {
            ensure_writable(&state)?;
            parse_name(&name)?;
            require_token(&state.uploads, &query, &name, &uuid)?;
            debug!("DELETE upload: {}", uuid);

            let handle = state.uploads.resume(&name, &uuid).await?;
            let mut session = handle.lock().await;
            state.uploads.cancel(&mut session).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(ApiError::NotFound),
    }
}
