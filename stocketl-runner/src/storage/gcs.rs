//! Google Cloud Storage over the JSON API.
//!
//! Uploads are multipart (metadata + media) so the blake3 hash travels as
//! custom object metadata and `head` can compare it without downloading.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use super::{content_hash, ObjectMeta, ObjectStore, StorageError};
use crate::auth::TokenSource;

pub const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";
const HASH_METADATA_KEY: &str = "blake3";
const BOUNDARY: &str = "stocketl-multipart-boundary";

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    /// GCS encodes int64 as a JSON string.
    size: String,
    #[serde(default)]
    metadata: std::collections::BTreeMap<String, String>,
}

pub struct GcsObjectStore {
    client: Client,
    base_url: String,
    bucket: String,
    tokens: Arc<dyn TokenSource>,
}

impl GcsObjectStore {
    pub fn new(bucket: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| StorageError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            bucket: bucket.into(),
            tokens,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// `{base}/storage/v1/b/{bucket}/o/{key}` with the key as one encoded segment.
    fn object_url(&self, key: &str) -> Result<Url, StorageError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| StorageError::Http(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Http(format!("base url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["storage", "v1", "b", &self.bucket, "o", key]);
        Ok(url)
    }

    fn upload_url(&self) -> Result<Url, StorageError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| StorageError::Http(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Http(format!("base url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["upload", "storage", "v1", "b", &self.bucket, "o"]);
        url.query_pairs_mut().append_pair("uploadType", "multipart");
        Ok(url)
    }

    fn to_meta(&self, obj: GcsObject) -> Result<ObjectMeta, StorageError> {
        let size = obj.size.parse().map_err(|_| StorageError::BadMetadata {
            key: obj.name.clone(),
            message: format!("size '{}' is not an integer", obj.size),
        })?;
        Ok(ObjectMeta {
            bucket: self.bucket.clone(),
            content_hash: obj.metadata.get(HASH_METADATA_KEY).cloned(),
            key: obj.name,
            size,
        })
    }

    fn check_status(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, StorageError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(StorageError::Http(format!("HTTP {status}: {snippet}")))
    }
}

/// `multipart/related` body: JSON metadata part, then the media part.
pub(crate) fn multipart_body(metadata: &serde_json::Value, content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

impl ObjectStore for GcsObjectStore {
    fn name(&self) -> &str {
        "gs"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<ObjectMeta, StorageError> {
        let mut custom = serde_json::Map::new();
        custom.insert(HASH_METADATA_KEY.to_string(), content_hash(bytes).into());
        let metadata = json!({
            "name": key,
            "contentType": content_type,
            "metadata": custom,
        });
        let resp = self
            .client
            .post(self.upload_url()?)
            .bearer_auth(self.tokens.token()?)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={BOUNDARY}"),
            )
            .body(multipart_body(&metadata, content_type, bytes))
            .send()
            .map_err(|e| StorageError::Http(e.without_url().to_string()))?;
        let obj: GcsObject = Self::check_status(resp)?
            .json()
            .map_err(|e| StorageError::Http(e.to_string()))?;
        self.to_meta(obj)
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let resp = self
            .client
            .get(self.object_url(key)?)
            .bearer_auth(self.tokens.token()?)
            .send()
            .map_err(|e| StorageError::Http(e.without_url().to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let obj: GcsObject = Self::check_status(resp)?
            .json()
            .map_err(|e| StorageError::Http(e.to_string()))?;
        self.to_meta(obj).map(Some)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.tokens.token()?)
            .send()
            .map_err(|e| StorageError::Http(e.without_url().to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            });
        }
        let bytes = Self::check_status(resp)?
            .bytes()
            .map_err(|e| StorageError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;

    fn store() -> GcsObjectStore {
        GcsObjectStore::new("stock-data", Arc::new(StaticTokenSource("t".into())))
            .unwrap()
            .with_base_url("http://localhost:4443/")
    }

    #[test]
    fn object_key_is_one_encoded_segment() {
        let url = store()
            .object_url("stock_data/2024-01-02/merged_stock_data.csv")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:4443/storage/v1/b/stock-data/o/stock_data%2F2024-01-02%2Fmerged_stock_data.csv"
        );
    }

    #[test]
    fn upload_url_is_multipart() {
        assert_eq!(
            store().upload_url().unwrap().as_str(),
            "http://localhost:4443/upload/storage/v1/b/stock-data/o?uploadType=multipart"
        );
    }

    #[test]
    fn multipart_body_has_both_parts() {
        let body = multipart_body(&json!({"name": "k"}), "text/csv", b"a,b\n");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(&format!("--{BOUNDARY}\r\n")));
        assert!(text.contains(r#"{"name":"k"}"#));
        assert!(text.contains("Content-Type: text/csv\r\n\r\na,b\n"));
        assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }

    #[test]
    fn parses_object_resource() {
        let obj: GcsObject = serde_json::from_str(
            r#"{"kind": "storage#object", "name": "k.csv", "size": "42",
                "metadata": {"blake3": "abc"}}"#,
        )
        .unwrap();
        let meta = store().to_meta(obj).unwrap();
        assert_eq!(meta.size, 42);
        assert_eq!(meta.content_hash.as_deref(), Some("abc"));
    }
}
