//! Object storage provider.
//!
//! Thin wrapper over `object_store` giving the pipeline and its transform
//! plugins a uniform get/put/list surface across S3, the local filesystem,
//! and an in-memory store for tests.

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::prelude::*;
use std::sync::Arc;

use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};

/// Storage provider bound to a single bucket-like root.
///
/// Keys passed to operations are relative to that root.
#[derive(Clone)]
pub struct ObjectStorage {
    object_store: Arc<dyn ObjectStore>,
    canonical_url: String,
}

impl std::fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStorage<{}>", self.canonical_url)
    }
}

impl ObjectStorage {
    /// Build a provider for the given URL.
    ///
    /// Supported forms: `s3://bucket`, `file:///path`, a bare absolute
    /// path, and `memory` for the in-memory store.
    pub fn for_url(url: &str) -> Result<Self, StorageError> {
        if url == "memory" {
            return Ok(Self::memory());
        }

        if let Some(rest) = url.strip_prefix("s3://") {
            let bucket = rest.split('/').next().unwrap_or("");
            ensure!(!bucket.is_empty(), InvalidUrlSnafu { url });
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .context(ObjectStoreSnafu)?;
            return Ok(Self {
                object_store: Arc::new(store),
                canonical_url: format!("s3://{bucket}"),
            });
        }

        let path = url.strip_prefix("file://").unwrap_or(url);
        ensure!(path.starts_with('/'), InvalidUrlSnafu { url });
        let store = LocalFileSystem::new_with_prefix(path).context(ObjectStoreSnafu)?;
        Ok(Self {
            object_store: Arc::new(store),
            canonical_url: format!("file://{path}"),
        })
    }

    /// Build an in-memory provider.
    pub fn memory() -> Self {
        Self {
            object_store: Arc::new(InMemory::new()),
            canonical_url: "memory".to_string(),
        }
    }

    /// Fetch an object's bytes.
    pub async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = Path::from(key);
        let result = self.object_store.get(&path).await.context(ObjectStoreSnafu)?;
        result.bytes().await.context(ObjectStoreSnafu)
    }

    /// Write an object's bytes.
    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = Path::from(key);
        self.object_store
            .put(&path, PutPayload::from(bytes))
            .await
            .context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// List all object keys under a prefix.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = Path::from(prefix);
        self.object_store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .context(ObjectStoreSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let storage = ObjectStorage::memory();
        storage
            .put("pre-stage/team/ds/file.csv", Bytes::from("a,b,c"))
            .await
            .unwrap();

        let bytes = storage.get("pre-stage/team/ds/file.csv").await.unwrap();
        assert_eq!(bytes, Bytes::from("a,b,c"));
    }

    #[tokio::test]
    async fn test_list_keys_under_prefix() {
        let storage = ObjectStorage::memory();
        storage
            .put("post-stage/team/ds/part-0.parquet", Bytes::from("x"))
            .await
            .unwrap();
        storage
            .put("post-stage/team/ds/part-1.parquet", Bytes::from("y"))
            .await
            .unwrap();
        storage
            .put("post-stage/team/other/part-0.parquet", Bytes::from("z"))
            .await
            .unwrap();

        let mut keys = storage.list_keys("post-stage/team/ds").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            [
                "post-stage/team/ds/part-0.parquet",
                "post-stage/team/ds/part-1.parquet"
            ]
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = ObjectStorage::for_url("ftp://nope").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }
}
