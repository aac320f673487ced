use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cluster_core::config::Config;
use cluster_core::error::StoreError;
use cluster_core::schemas::Schema;
use cluster_core::schemas::SchemasLRU;
use cluster_core::storage::MetadataStore;
use cluster_core::ClientError;
use memstore::MemStore;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use rmpv::Value;

#[macro_use]
mod fixtures;

fn foreign_value(uri: &str) -> Value {
    Value::Map(vec![
        (Value::from("_type"), Value::from("foreign/object")),
        (Value::from("_endpoint"), Value::from(uri)),
    ])
}

fn local_value(field: &str) -> Value {
    Value::Map(vec![(
        Value::from("schema"),
        Value::Map(vec![(Value::from(field), Value::Map(vec![]))]),
    )])
}

fn msgpack(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).unwrap();
    buf
}

fn test_config() -> Arc<Config> {
    Arc::new(Config::build("schema-cache".into()).validate().unwrap())
}

/// A store wrapper that yields on metadata reads, forcing racing tasks to
/// interleave between their cache read and their CAS.
struct YieldStore(Arc<MemStore>);

#[async_trait]
impl MetadataStore for YieldStore {
    async fn get_metadata(&self, path: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        tokio::task::yield_now().await;
        self.0.get_metadata(path, key).await
    }

    async fn set_metadata(&self, path: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.0.set_metadata(path, key, value).await
    }

    async fn get_document(&self, path: &str, id: &str) -> Result<(Value, u64), StoreError> {
        self.0.get_document(path, id).await
    }

    async fn update(
        &self,
        path: &str,
        id: &str,
        expected_version: u64,
        create: bool,
        obj: Value,
        commit: bool,
    ) -> Result<u64, StoreError> {
        self.0.update(path, id, expected_version, create, obj, commit).await
    }
}

/// Schema foreign cycle test.
///
/// What does this test do?
///
/// - persists schema metadata for `a` pointing at a document in `b`, whose
///   body points back at a document in `a`.
/// - asserts that fetching `a`'s schema fails with a cyclic-reference
///   client error and that the caches hold at most the foreign descriptor,
///   never a resolved body.
#[tokio::test]
async fn foreign_cycle_is_detected() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let store = Arc::new(MemStore::new());
    store.set_metadata("a", "schema", msgpack(&foreign_value("b/doc"))).await?;
    store.set_metadata("b", "schema", msgpack(&foreign_value("a/doc"))).await?;
    store.update("b", "doc", 0, true, foreign_value("a/doc"), false).await?;
    store.update("a", "doc", 0, true, foreign_value("b/doc"), false).await?;

    let store: Arc<dyn MetadataStore> = store;
    let schemas = SchemasLRU::new(test_config(), store, None);

    let err = schemas.get("a", None).await.unwrap_err();
    assert!(
        err.to_string().contains("Cyclic schema reference detected"),
        "unexpected error: {}",
        err
    );
    assert!(matches!(err, ClientError::CyclicSchemaReference(_)));

    // The foreign slots must not hold a resolved body.
    assert!(schemas.cached("b/doc").is_none());
    assert!(schemas.cached("a/doc").is_none());
    // The local slot may hold only the foreign descriptor.
    if let Some(local) = schemas.cached("a/") {
        assert_eq!(local.body(), &foreign_value("b/doc"));
    }
    Ok(())
}

/// Schema save race test.
///
/// What does this test do?
///
/// - two tasks concurrently `set` different schemas on the same path.
/// - asserts exactly one wins, the loser is handed the winner's schema,
///   and an immediate `get` observes the same value (CAS fidelity).
#[tokio::test]
async fn concurrent_set_has_single_winner() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let store: Arc<dyn MetadataStore> = Arc::new(YieldStore(Arc::new(MemStore::new())));
    let schemas = SchemasLRU::new(test_config(), store, None);

    // `.xapiand/nodes` keeps its schema local, so the race is on the
    // local slot and its metadata write-through.
    let path = ".xapiand/nodes";
    let ns1 = Arc::new(Schema::new(local_value("first")));
    let ns2 = Arc::new(Schema::new(local_value("second")));
    let mut old1 = Arc::new(Schema::new(Value::Nil));
    let mut old2 = Arc::new(Schema::new(Value::Nil));

    let (r1, r2) = tokio::join!(
        schemas.set(path, &mut old1, &ns1, true),
        schemas.set(path, &mut old2, &ns2, true),
    );
    let (r1, r2) = (r1?, r2?);
    assert!(r1 ^ r2, "exactly one writer must win (got {} and {})", r1, r2);

    let (winner, loser_old) = if r1 { (&ns1, &old2) } else { (&ns2, &old1) };
    assert_eq!(winner.body(), loser_old.body());

    // CAS fidelity: an immediate get observes the winner's schema.
    let (current, _foreign) = schemas.get(path, None).await?;
    assert_eq!(current.body(), winner.body());
    Ok(())
}

/// Default foreignization test.
///
/// What does this test do?
///
/// - fetches the schema of a regular path with no stored metadata.
/// - asserts the local slot synthesizes a foreign link into the settings
///   index with the path %2F-encoded.
#[tokio::test]
async fn missing_metadata_foreignizes_by_default() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let store: Arc<dyn MetadataStore> = Arc::new(MemStore::new());
    let schemas = SchemasLRU::new(test_config(), store, None);

    let (schema, foreign_uri) = schemas.get("some/index", None).await?;
    assert_eq!(foreign_uri.as_deref(), Some(".xapiand/indices/some%2Findex"));
    // The resolved foreign schema wraps the initial template.
    assert!(schema.body().is_map());

    let local = schemas.cached("some/index/").expect("local slot populated");
    assert_eq!(local.body(), &foreign_value(".xapiand/indices/some%2Findex"));
    Ok(())
}
