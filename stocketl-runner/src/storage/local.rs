//! Filesystem object store: `{root}/{bucket}/{key}`.
//!
//! Objects are written to a `.tmp` sibling and renamed into place. Each object
//! has a `{key}.meta.json` sidecar carrying its size and content hash.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{content_hash, ObjectMeta, ObjectStore, StorageError};

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    size: u64,
    content_hash: String,
    content_type: String,
    written_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            bucket: bucket.into(),
        }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(&self.bucket).join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root
            .join(&self.bucket)
            .join(format!("{key}{META_SUFFIX}"))
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |source| StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Self::io_err(parent))?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(Self::io_err(&tmp))?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StorageError::Io {
                path: path.display().to_string(),
                source: e,
            }
        })
    }
}

impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "file"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<ObjectMeta, StorageError> {
        let path = self.object_path(key);
        Self::write_atomic(&path, bytes)?;

        let sidecar = Sidecar {
            size: bytes.len() as u64,
            content_hash: content_hash(bytes),
            content_type: content_type.to_string(),
            written_at: chrono::Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&sidecar).map_err(|e| StorageError::BadMetadata {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::write_atomic(&self.meta_path(key), &json)?;

        Ok(ObjectMeta {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size: sidecar.size,
            content_hash: Some(sidecar.content_hash),
        })
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let path = self.object_path(key);
        let file_meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_err(&path)(e)),
        };

        // A missing or unreadable sidecar just means the hash is unknown.
        let content_hash = fs::read(self.meta_path(key))
            .ok()
            .and_then(|b| serde_json::from_slice::<Sidecar>(&b).ok())
            .filter(|s| s.size == file_meta.len())
            .map(|s| s.content_hash);

        Ok(Some(ObjectMeta {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size: file_meta.len(),
            content_hash,
        }))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            }),
            Err(e) => Err(Self::io_err(&path)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_head_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "bucket");
        let meta = store.put("a/b.csv", b"hello", "text/csv").unwrap();
        assert_eq!(meta.size, 5);
        assert!(store.object_path("a/b.csv").ends_with("bucket/a/b.csv"));

        let head = store.head("a/b.csv").unwrap().unwrap();
        assert_eq!(head, meta);
        assert_eq!(store.get("a/b.csv").unwrap(), b"hello");
        assert!(!dir.path().join("bucket/a/b.csv.tmp").exists());
    }

    #[test]
    fn missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "bucket");
        assert_eq!(store.head("nope.csv").unwrap(), None);
        assert!(matches!(store.get("nope.csv"), Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn tampered_object_loses_its_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "bucket");
        store.put("k.csv", b"abc", "text/csv").unwrap();
        fs::write(store.object_path("k.csv"), b"abcd").unwrap();
        assert_eq!(store.head("k.csv").unwrap().unwrap().content_hash, None);
    }
}
