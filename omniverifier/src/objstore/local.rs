//! Local filesystem storage backend.

use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use async_trait::async_trait;

use crate::errors::{Error, Result};

use super::ObjectStore;

/// Stores objects as files under a base directory. Presigned URLs are
/// `file://` paths; TTLs are not enforced.
pub struct LocalObjectStore {
    base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(Error::ObjectStore(format!("invalid object key '{key}'")));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::ObjectStore(e.to_string()))?;
        }
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| Error::ObjectStore(e.to_string()))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::ObjectStore(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| Error::ObjectStore(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        fs::read(&path)
            .await
            .map_err(|e| Error::ObjectStore(format!("read '{key}': {e}")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path)
            .await
            .map_err(|e| Error::ObjectStore(e.to_string()))?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::ObjectStore(e.to_string())),
        }
    }

    async fn presign_put(&self, key: &str, _ttl: Duration) -> Result<String> {
        let path = self.resolve(key)?;
        Ok(format!("file://{}", path.display()))
    }

    async fn presign_get(&self, key: &str, _ttl: Duration) -> Result<String> {
        let path = self.resolve(key)?;
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .put("uploads/a/source.csv", b"email\na@x.com\n".to_vec(), "text/csv")
            .await
            .unwrap();
        assert!(store.exists("uploads/a/source.csv").await.unwrap());
        assert_eq!(
            store.get("uploads/a/source.csv").await.unwrap(),
            b"email\na@x.com\n".to_vec()
        );

        store.delete("uploads/a/source.csv").await.unwrap();
        assert!(!store.exists("uploads/a/source.csv").await.unwrap());
        // Deleting again is a no-op.
        store.delete("uploads/a/source.csv").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
    }
}
