//! Storage path layout
//!
//! Maps registry objects onto storage driver paths. The layout is split
//! into a global content-addressable blob store and per-repository
//! metadata:
//!
//! ```text
//! blobs/<algorithm>/<first two hex chars>/<hex>/data
//! repositories/<name>/_manifests/revisions/<algorithm>/<hex>/data
//! repositories/<name>/_manifests/tags/<tag>/current/link
//! repositories/<name>/_uploads/<uuid>/{data,hashstate,startedat}
//! ```
//!
//! The two-character prefix directory shards the blob namespace to bound
//! directory sizes.

use crate::digest::Digest;

/// Path to the content of a blob
pub fn blob_data(digest: &Digest) -> String {
    format!(
        "blobs/{}/{}/{}/data",
        digest.algorithm(),
        &digest.hex()[..2],
        digest.hex()
    )
}

/// Root of a repository's manifest metadata
pub fn manifests(name: &str) -> String {
    format!("repositories/{}/_manifests", name)
}

/// Path to the stored bytes of a manifest revision
pub fn manifest_revision_data(name: &str, digest: &Digest) -> String {
    format!(
        "repositories/{}/_manifests/revisions/{}/{}/data",
        name,
        digest.algorithm(),
        digest.hex()
    )
}

/// Directory of a manifest revision, for deletion
pub fn manifest_revision(name: &str, digest: &Digest) -> String {
    format!(
        "repositories/{}/_manifests/revisions/{}/{}",
        name,
        digest.algorithm(),
        digest.hex()
    )
}

/// Directory holding a repository's tags
pub fn tags(name: &str) -> String {
    format!("repositories/{}/_manifests/tags", name)
}

/// Path to the link resolving a tag to a manifest digest
pub fn tag_current_link(name: &str, tag: &str) -> String {
    format!(
        "repositories/{}/_manifests/tags/{}/current/link",
        name, tag
    )
}

/// Directory of a single upload session
pub fn upload(name: &str, uuid: &str) -> String {
    format!("repositories/{}/_uploads/{}", name, uuid)
}

/// Path to the staged bytes of an upload session
pub fn upload_data(name: &str, uuid: &str) -> String {
    format!("repositories/{}/_uploads/{}/data", name, uuid)
}

/// Path to the durable hash state of an upload session
pub fn upload_hashstate(name: &str, uuid: &str) -> String {
    format!("repositories/{}/_uploads/{}/hashstate", name, uuid)
}

/// Path to the start timestamp of an upload session
pub fn upload_startedat(name: &str, uuid: &str) -> String {
    format!("repositories/{}/_uploads/{}/startedat", name, uuid)
}
