//! Object storage for the merged dataset.
//!
//! The uploader writes `stock_data/{run_date}/merged_stock_data.csv` into a
//! bucket. Re-uploading identical bytes is a no-op: the blake3 content hash is
//! stored with each object and compared before writing.

pub mod gcs;
pub mod local;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthError;

pub use gcs::GcsObjectStore;
pub use local::LocalObjectStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object storage I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object storage request failed: {0}")]
    Http(String),

    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("invalid object metadata for {key}: {message}")]
    BadMetadata { key: String, message: String },

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// blake3 hex digest of the content, when the backend recorded one.
    pub content_hash: Option<String>,
}

impl ObjectMeta {
    pub fn uri(&self, scheme: &str) -> String {
        format!("{scheme}://{}/{}", self.bucket, self.key)
    }
}

/// Result of [`upload_if_changed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded { meta: ObjectMeta },
    Unchanged { meta: ObjectMeta },
}

impl UploadOutcome {
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            UploadOutcome::Uploaded { meta } | UploadOutcome::Unchanged { meta } => meta,
        }
    }
}

/// A bucket of named objects.
pub trait ObjectStore: Send + Sync {
    /// Backend name for logs, also the URI scheme (`file`, `gs`).
    fn name(&self) -> &str;

    fn bucket(&self) -> &str;

    /// Write `bytes` under `key`, replacing any existing object.
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<ObjectMeta, StorageError>;

    /// Metadata of `key`, `None` when it does not exist.
    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Upload unless an object with the same content hash already exists.
pub fn upload_if_changed(
    store: &dyn ObjectStore,
    key: &str,
    bytes: &[u8],
    content_type: &str,
) -> Result<UploadOutcome, StorageError> {
    let hash = content_hash(bytes);
    if let Some(existing) = store.head(key)? {
        if existing.content_hash.as_deref() == Some(hash.as_str()) {
            tracing::info!(
                store = store.name(),
                uri = %existing.uri(store.name()),
                "object unchanged, skipping upload"
            );
            return Ok(UploadOutcome::Unchanged { meta: existing });
        }
        tracing::info!(store = store.name(), key, "object exists with different content, replacing");
    }

    let meta = store.put(key, bytes, content_type)?;
    tracing::info!(
        store = store.name(),
        uri = %meta.uri(store.name()),
        bytes = meta.size,
        "uploaded object"
    );
    Ok(UploadOutcome::Uploaded { meta })
}
