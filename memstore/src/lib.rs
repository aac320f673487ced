//! An in-memory `MetadataStore` implementation.
//!
//! This is the storage backend used by the test suites and example
//! harnesses of `cluster-core`. It keeps every index in a map guarded by a
//! single `RwLock`, and implements the same optimistic-versioning contract
//! a real engine would: every document carries a monotonic version starting
//! at 1, and stale expectations fail with `DocVersionConflict`.

use std::collections::HashMap;

use async_trait::async_trait;
use cluster_core::error::StoreError;
use cluster_core::storage::MetadataStore;
use rmpv::Value;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemIndex {
    metadata: HashMap<String, Vec<u8>>,
    documents: HashMap<String, (Value, u64)>,
}

/// An in-memory metadata store.
#[derive(Default)]
pub struct MemStore {
    indices: RwLock<HashMap<String, MemIndex>>,
}

impl MemStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents held by the index at `path` (testing aid).
    pub async fn document_count(&self, path: &str) -> usize {
        let indices = self.indices.read().await;
        indices.get(path).map(|index| index.documents.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MetadataStore for MemStore {
    async fn get_metadata(&self, path: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let indices = self.indices.read().await;
        let index = indices.get(path).ok_or(StoreError::DatabaseNotFound)?;
        Ok(index.metadata.get(key).cloned())
    }

    async fn set_metadata(&self, path: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut indices = self.indices.write().await;
        let index = indices.entry(path.to_string()).or_default();
        index.metadata.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_document(&self, path: &str, id: &str) -> Result<(Value, u64), StoreError> {
        let indices = self.indices.read().await;
        let index = indices.get(path).ok_or(StoreError::DatabaseNotFound)?;
        let (value, version) = index.documents.get(id).ok_or(StoreError::DocNotFound)?;
        Ok((value.clone(), *version))
    }

    async fn update(
        &self,
        path: &str,
        id: &str,
        expected_version: u64,
        create: bool,
        obj: Value,
        _commit: bool,
    ) -> Result<u64, StoreError> {
        let mut indices = self.indices.write().await;
        if !indices.contains_key(path) && !create {
            return Err(StoreError::DatabaseNotFound);
        }
        let index = indices.entry(path.to_string()).or_default();
        match index.documents.get_mut(id) {
            Some((value, version)) => {
                if expected_version != 0 && expected_version != *version {
                    tracing::debug!(%path, %id, expected_version, current = *version, "version conflict");
                    return Err(StoreError::DocVersionConflict { current: *version });
                }
                *value = obj;
                *version += 1;
                Ok(*version)
            }
            None => {
                if !create {
                    return Err(StoreError::DocNotFound);
                }
                if expected_version != 0 {
                    tracing::debug!(%path, %id, expected_version, "version conflict creating document");
                    return Err(StoreError::DocVersionConflict { current: 0 });
                }
                index.documents.insert(id.to_string(), (obj, 1));
                Ok(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(tag: &str) -> Value {
        Value::Map(vec![(Value::from("tag"), Value::from(tag))])
    }

    #[tokio::test]
    async fn metadata_is_last_writer_wins() {
        let store = MemStore::new();
        assert!(matches!(
            store.get_metadata("idx", "schema").await,
            Err(StoreError::DatabaseNotFound)
        ));
        store.set_metadata("idx", "schema", b"one".to_vec()).await.unwrap();
        store.set_metadata("idx", "schema", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get_metadata("idx", "schema").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.get_metadata("idx", "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_and_update_documents() {
        let store = MemStore::new();
        let v1 = store.update("idx", "doc", 0, true, doc("a"), false).await.unwrap();
        assert_eq!(v1, 1);
        let (value, version) = store.get_document("idx", "doc").await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(value, doc("a"));

        let v2 = store.update("idx", "doc", 1, true, doc("b"), false).await.unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemStore::new();
        store.update("idx", "doc", 0, true, doc("a"), false).await.unwrap();
        store.update("idx", "doc", 1, true, doc("b"), false).await.unwrap();
        let err = store.update("idx", "doc", 1, true, doc("c"), false).await.unwrap_err();
        match err {
            StoreError::DocVersionConflict { current } => assert_eq!(current, 2),
            other => panic!("expected version conflict, got {:?}", other),
        }
        // The conflicting write must not have landed.
        let (value, version) = store.get_document("idx", "doc").await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(value, doc("b"));
    }

    #[tokio::test]
    async fn unconditional_update_with_zero_expectation() {
        let store = MemStore::new();
        store.update("idx", "doc", 0, true, doc("a"), false).await.unwrap();
        let v = store.update("idx", "doc", 0, true, doc("b"), false).await.unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn missing_documents_and_databases() {
        let store = MemStore::new();
        assert!(matches!(
            store.get_document("idx", "doc").await,
            Err(StoreError::DatabaseNotFound)
        ));
        store.set_metadata("idx", "k", vec![1]).await.unwrap();
        assert!(matches!(store.get_document("idx", "doc").await, Err(StoreError::DocNotFound)));
        assert!(matches!(
            store.update("idx", "doc", 0, false, doc("a"), false).await,
            Err(StoreError::DocNotFound)
        ));
    }
}
