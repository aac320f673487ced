//! The metadata storage interface.
//!
//! The coordination core persists index settings and schemas through this
//! trait; the backing engine (the document storage proper) is out of scope
//! and lives behind it. The `memstore` crate provides the in-memory
//! implementation used by tests and harnesses.

use async_trait::async_trait;
use rmpv::Value;

use crate::error::StoreError;

/// A trait defining the interface to the replicated internal index.
///
/// All operations address documents inside an index named by `path`
/// (e.g. `.xapiand/indices`). Documents carry a monotonic version number
/// starting at 1; `update` performs an optimistically locked write and
/// returns [`StoreError::DocVersionConflict`] when the caller's expectation
/// is stale. Writers drive retry loops by pattern-matching that variant.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Read a metadata blob of the index at `path`.
    ///
    /// Returns `Ok(None)` when the key was never written. May return
    /// [`StoreError::DatabaseNotFound`] when the index itself is absent.
    async fn get_metadata(&self, path: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a metadata blob of the index at `path`, last-writer-wins.
    async fn set_metadata(&self, path: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch a document and its version.
    async fn get_document(&self, path: &str, id: &str) -> Result<(Value, u64), StoreError>;

    /// Optimistically update (or create) a document.
    ///
    /// With `expected_version == 0` the write is unconditional; otherwise
    /// the stored version must match or `DocVersionConflict` is returned
    /// carrying the current version. Returns the new version. `create`
    /// permits creating a missing document; `commit` requests an immediate
    /// durable commit.
    async fn update(
        &self,
        path: &str,
        id: &str,
        expected_version: u64,
        create: bool,
        obj: Value,
        commit: bool,
    ) -> Result<u64, StoreError>;
}

/// Look up a key in a MsgPack map value.
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v),
        _ => None,
    }
}

/// Interpret a MsgPack value as an unsigned integer.
pub fn value_u64(value: &Value) -> Option<u64> {
    value.as_u64()
}

/// Interpret a MsgPack value as a string slice.
pub fn value_str(value: &Value) -> Option<&str> {
    value.as_str()
}
