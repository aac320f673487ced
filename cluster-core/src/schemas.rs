//! The two-tier schema cache.
//!
//! Schemas are immutable, `Arc`-shared MsgPack trees. A schema is either
//! **local** (it embeds the shape) or **foreign** (it carries a
//! `{_type: "foreign/object", _endpoint: "<uri>"}` link to the index that
//! owns the shape). Two LRUs are kept: local schemas keyed by
//! `<endpoints_path>/` and foreign schemas keyed by URI; a third map tracks
//! last-known foreign versions to suppress redundant refreshes.
//!
//! Updates follow a CAS protocol under the cache mutex: read the slot, do
//! storage I/O with no lock held, re-lock and install only if the slot is
//! still what we read. A lost race reports `failure = true` and hands the
//! caller the winner's pointer; persistence failures revert the slot before
//! rethrowing, so subsequent reads observe the prior value.

use std::collections::HashMap;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use futures::future::BoxFuture;
use lru::LruCache;
use percent_encoding::percent_decode_str;
use rmpv::Value;

use crate::config::Config;
use crate::discovery::Discovery;
use crate::endpoint;
use crate::endpoint::SYSTEM_INDICES;
use crate::endpoint::SYSTEM_NODES;
use crate::error::ClientError;
use crate::error::StoreError;
use crate::storage::map_get;
use crate::storage::MetadataStore;
use crate::MAX_SCHEMA_RECURSION;

const RESERVED_TYPE: &str = "_type";
const RESERVED_ENDPOINT: &str = "_endpoint";
const RESERVED_RECURSE: &str = "_recurse";
const RESERVED_SCHEMA: &str = "_schema";
const SCHEMA_FIELD_NAME: &str = "schema";
const ID_FIELD_NAME: &str = "_id";
const FOREIGN_TYPE: &str = "foreign/object";

/// The metadata key schemas are persisted under.
const SCHEMA_METADATA_KEY: &str = "schema";

/// Cached schemas older than this are discarded by [`SchemasLRU::cleanup`].
const SCHEMA_CACHE_MAX_AGE: Duration = Duration::from_secs(3600);

/// An immutable, shared schema object.
///
/// The version word doubles as the "loaded from the store" flag: zero means
/// the object was synthesized locally and not yet persisted. Equality is by
/// body value, which is what the CAS protocol compares.
#[derive(Debug)]
pub struct Schema {
    body: Value,
    version: AtomicU64,
}

impl Schema {
    /// A schema that has not been persisted yet.
    pub fn new(body: Value) -> Self {
        Self { body, version: AtomicU64::new(0) }
    }

    /// A schema loaded from the store at the given version.
    pub fn with_version(body: Value, version: u64) -> Self {
        Self { body, version: AtomicU64::new(version) }
    }

    /// The schema tree.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The persisted version; zero when not yet written.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}

/// A shared schema pointer.
pub type SchemaRef = Arc<Schema>;

/// A validated foreign schema reference.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ForeignRef {
    uri: String,
    path: String,
    id: String,
}

/// Check whether a schema object declares a foreign link, validating it.
fn validate_foreign(object: &Value) -> Result<Option<ForeignRef>, ClientError> {
    let uri = match map_get(object, RESERVED_ENDPOINT).and_then(|v| v.as_str()) {
        Some(uri) => uri.to_string(),
        None => return Ok(None),
    };
    if let Some(type_val) = map_get(object, RESERVED_TYPE).and_then(|v| v.as_str()) {
        if !type_val.contains("foreign") {
            return Ok(None);
        }
    }
    let (path, id) = match uri.rsplit_once('/') {
        Some((path, id)) if !path.is_empty() && !id.is_empty() => (path, id),
        _ => return Err(ClientError::ForeignUriMissingParts { uri }),
    };
    let path = percent_decode_str(path).decode_utf8_lossy().into_owned();
    let id = percent_decode_str(id).decode_utf8_lossy().into_owned();
    Ok(Some(ForeignRef { uri, path, id }))
}

/// Build a foreign link descriptor.
fn foreign_link(uri: &str) -> Value {
    Value::Map(vec![
        (Value::from(RESERVED_TYPE), Value::from(FOREIGN_TYPE)),
        (Value::from(RESERVED_ENDPOINT), Value::from(uri)),
    ])
}

/// The initial schema template for brand-new indices.
fn initial_schema() -> Value {
    Value::Map(vec![(Value::from(SCHEMA_FIELD_NAME), Value::Map(vec![]))])
}

/// The built-in schema of the settings index, returned when resolution
/// re-enters it (the chicken-and-egg case).
fn default_indices_schema() -> Value {
    Value::Map(vec![
        (Value::from(RESERVED_RECURSE), Value::from(false)),
        (
            Value::from(SCHEMA_FIELD_NAME),
            Value::Map(vec![(
                Value::from(ID_FIELD_NAME),
                Value::Map(vec![(Value::from(RESERVED_TYPE), Value::from("keyword"))]),
            )]),
        ),
    ])
}

fn serialise_schema(schema: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, schema).expect("writing msgpack to a Vec cannot fail");
    buf
}

fn unserialise_schema(mut bytes: &[u8]) -> Result<Value, ClientError> {
    rmpv::decode::read_value(&mut bytes)
        .map_err(|err| ClientError::Store(StoreError::Backend(anyhow::anyhow!("corrupt schema metadata: {}", err))))
}

/// Apply a drill (`a.b.c`) or field (`{a,b}`) selector to a document.
fn select(object: &Value, selector: &str) -> Value {
    if let Some(fields) = selector.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        let mut entries = Vec::new();
        for field in fields.split(',') {
            let field = field.trim();
            if let Some(value) = map_get(object, field) {
                entries.push((Value::from(field), value.clone()));
            }
        }
        return Value::Map(entries);
    }
    let mut current = object.clone();
    for segment in selector.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = map_get(&current, segment).cloned().unwrap_or(Value::Nil);
    }
    current
}

/// The outcome of a cache CAS: the slot's resulting pointer and whether the
/// caller's candidate lost to a concurrent writer.
enum CasOutcome {
    Installed(SchemaRef),
    Lost(SchemaRef),
}

/// The two-tier schema cache.
pub struct SchemasLRU {
    config: Arc<Config>,
    store: Arc<dyn MetadataStore>,
    discovery: Option<Discovery>,
    schemas: Mutex<LruCache<String, SchemaRef>>,
    versions: Mutex<LruCache<String, u64>>,
    inserted: Mutex<HashMap<String, Instant>>,
}

impl SchemasLRU {
    /// Create a schema cache over the given store; `discovery` carries
    /// schema-updated notifications to peers and may be `None`.
    pub fn new(config: Arc<Config>, store: Arc<dyn MetadataStore>, discovery: Option<Discovery>) -> Self {
        let capacity = NonZeroUsize::new(config.schema_cache_size.max(1)).unwrap();
        Self {
            config,
            store,
            discovery,
            schemas: Mutex::new(LruCache::new(capacity)),
            versions: Mutex::new(LruCache::unbounded()),
            inserted: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the schema governing `path`.
    ///
    /// `obj` may carry a `_schema` member declaring a foreign link. Returns
    /// the schema and the foreign URI it resolved through, if any.
    #[tracing::instrument(level = "debug", skip(self, obj))]
    pub async fn get(&self, path: &str, obj: Option<&Value>) -> Result<(SchemaRef, Option<String>), ClientError> {
        let schema_obj = obj.filter(|o| o.is_map()).and_then(|o| map_get(o, RESERVED_SCHEMA));
        let (_failure, schema, foreign_uri) = self._update("GET", path, None, schema_obj, false).await?;
        Ok((schema, foreign_uri))
    }

    /// Install `new_schema` as the schema of `path`.
    ///
    /// Returns `Ok(true)` on success. On contention returns `Ok(false)`
    /// and replaces `old_schema` with the winner's pointer — callers treat
    /// that as "retry with the schema I was given back".
    #[tracing::instrument(level = "debug", skip(self, old_schema, new_schema))]
    pub async fn set(
        &self,
        path: &str,
        old_schema: &mut SchemaRef,
        new_schema: &SchemaRef,
        writable: bool,
    ) -> Result<bool, ClientError> {
        let (failure, schema, _foreign_uri) =
            self._update("SET", path, Some(new_schema), None, writable).await?;
        if failure {
            *old_schema = schema;
            return Ok(false);
        }
        Ok(true)
    }

    /// Record that a peer announced `uri` at `version`, suppressing
    /// redundant refreshes.
    pub fn updated(&self, uri: &str, version: u64) {
        let mut versions = self.versions.lock().unwrap();
        match versions.get_mut(uri) {
            Some(known) => {
                if *known < version {
                    *known = version;
                }
            }
            None => {
                versions.put(uri.to_string(), version);
            }
        }
        tracing::debug!(%uri, version, "schema updated");
    }

    /// Peek a cache slot (local `<path>/` keys or foreign URIs) without
    /// touching its LRU position.
    pub fn cached(&self, key: &str) -> Option<SchemaRef> {
        self.schemas.lock().unwrap().peek(key).cloned()
    }

    /// Forget a cached schema (local and per-shard keys are the caller's
    /// concern; this evicts exactly the given key).
    pub fn invalidate(&self, key: &str) {
        self.schemas.lock().unwrap().pop(key);
        self.inserted.lock().unwrap().remove(key);
    }

    /// Drop cache entries past their age limit.
    pub fn cleanup(&self) {
        let mut schemas = self.schemas.lock().unwrap();
        let mut inserted = self.inserted.lock().unwrap();
        let now = Instant::now();
        inserted.retain(|key, &mut at| {
            if now.duration_since(at) > SCHEMA_CACHE_MAX_AGE {
                schemas.pop(key);
                false
            } else {
                true
            }
        });
    }

    /// The update protocol; see the module docs.
    ///
    /// Always returns `(failure, schema, foreign_uri)`; `failure = true`
    /// means the caller's desired state was not installed, and the returned
    /// pointer is what an immediate `get` would observe.
    async fn _update(
        &self,
        prefix: &str,
        path: &str,
        new_schema: Option<&SchemaRef>,
        schema_obj: Option<&Value>,
        writable: bool,
    ) -> Result<(bool, SchemaRef, Option<String>), ClientError> {
        let (endpoints_path, _) = endpoint::unsharded_path(path);
        let endpoints_path = endpoints_path.to_string();
        let local_schema_path = format!("{}/", endpoints_path);

        let mut failure = false;

        // Whatever the caller passed may declare a foreign link.
        let mut declared_foreign = None;
        if let Some(new_schema) = new_schema {
            declared_foreign = validate_foreign(new_schema.body())?;
        } else if let Some(schema_obj) = schema_obj {
            declared_foreign = validate_foreign(schema_obj)?;
        }

        let local_schema_ptr = self.schemas.lock().unwrap().get(&local_schema_path).cloned();

        let mut schema_ptr: SchemaRef;
        match &local_schema_ptr {
            Some(local_ptr) => {
                tracing::trace!(%prefix, key=%local_schema_path, "schema found in cache");
                if let Some(foreign) = &declared_foreign {
                    let candidate = Arc::new(Schema::new(foreign_link(&foreign.uri)));
                    if candidate == *local_ptr {
                        schema_ptr = local_ptr.clone();
                    } else {
                        match self.cas(&local_schema_path, &local_schema_ptr, candidate) {
                            CasOutcome::Installed(installed) => schema_ptr = installed,
                            CasOutcome::Lost(current) => {
                                schema_ptr = current;
                                failure = true;
                            }
                        }
                    }
                } else {
                    schema_ptr = local_ptr.clone();
                }
            }
            None => {
                // Not cached; read the metadata from the store.
                tracing::trace!(%prefix, key=%local_schema_path, "schema not in cache, loading metadata");
                let schema_ser = match self.store.get_metadata(&endpoints_path, SCHEMA_METADATA_KEY).await {
                    Ok(ser) => ser,
                    Err(err) if err.is_not_found() => None,
                    Err(err) => {
                        tracing::error!(error=%err, "error reading schema metadata");
                        None
                    }
                };
                schema_ptr = match schema_ser {
                    Some(ser) if !ser.is_empty() => {
                        Arc::new(Schema::with_version(unserialise_schema(&ser)?, 1))
                    }
                    _ => {
                        if let Some(foreign) = &declared_foreign {
                            Arc::new(Schema::new(foreign_link(&foreign.uri)))
                        } else if endpoints_path != SYSTEM_NODES {
                            // Foreign by default: the schema of any regular
                            // index lives in the settings index.
                            let encoded = endpoints_path.replace('/', "%2F");
                            Arc::new(Schema::new(foreign_link(&format!(
                                "{}/{}",
                                SYSTEM_INDICES, encoded
                            ))))
                        } else if let Some(new_schema) = new_schema {
                            new_schema.clone()
                        } else {
                            Arc::new(Schema::new(initial_schema()))
                        }
                    }
                };
                match self.cas(&local_schema_path, &local_schema_ptr, schema_ptr) {
                    CasOutcome::Installed(installed) => schema_ptr = installed,
                    CasOutcome::Lost(current) => {
                        schema_ptr = current;
                        failure = true;
                    }
                }
            }
        }

        // If the local schema still needs writing, write it through.
        if writable && schema_ptr.version() == 0 {
            match self
                .persist_local(&endpoints_path, &local_schema_path, &local_schema_ptr, schema_ptr.clone())
                .await
            {
                Ok((persisted, lost)) => {
                    schema_ptr = persisted;
                    failure = failure || lost;
                }
                Err(err) => {
                    self.revert(&local_schema_path, &schema_ptr, &local_schema_ptr);
                    return Err(err);
                }
            }
        }

        if new_schema.is_some() {
            if let Some(foreign) = &declared_foreign {
                return Ok((failure, schema_ptr, Some(foreign.uri.clone())));
            }
        }

        // Follow the foreign link, if the resolved schema carries one.
        let foreign = match validate_foreign(schema_ptr.body())? {
            Some(foreign) => foreign,
            None => return Ok((failure, schema_ptr, declared_foreign.map(|f| f.uri))),
        };

        let foreign_schema_ptr = self.schemas.lock().unwrap().get(&foreign.uri).cloned();
        match &foreign_schema_ptr {
            Some(cached)
                if new_schema.map(|ns| *ns == *cached).unwrap_or(true) =>
            {
                tracing::trace!(%prefix, uri=%foreign.uri, "foreign schema found in cache");
                schema_ptr = cached.clone();
            }
            _ => {
                if let Some(new_schema) = new_schema {
                    match self.cas(&foreign.uri, &foreign_schema_ptr, new_schema.clone()) {
                        CasOutcome::Installed(installed) => schema_ptr = installed,
                        CasOutcome::Lost(current) => {
                            schema_ptr = current;
                            failure = true;
                        }
                    }
                } else {
                    // The foreign schema needs to be read.
                    let mut context: HashSet<String> = HashSet::new();
                    context.insert(endpoints_path.clone());
                    let loaded = self
                        .get_shared(foreign.path.clone(), foreign.id.clone(), &mut context)
                        .await;
                    schema_ptr = match loaded {
                        Ok((version, value)) => Arc::new(Schema::with_version(value, version)),
                        Err(err @ ClientError::CyclicSchemaReference(_))
                        | Err(err @ ClientError::MaxSchemaRecursion(_))
                        | Err(err @ ClientError::ForeignUriMissingParts { .. }) => return Err(err),
                        Err(err) => {
                            tracing::debug!(error=%err, uri=%foreign.uri, "foreign schema couldn't be loaded");
                            Arc::new(Schema::new(initial_schema()))
                        }
                    };
                    match self.cas(&foreign.uri, &foreign_schema_ptr, schema_ptr) {
                        CasOutcome::Installed(installed) => schema_ptr = installed,
                        CasOutcome::Lost(current) => {
                            schema_ptr = current;
                            failure = true;
                        }
                    }
                }
            }
        }

        // If the foreign schema document still needs saving, save it.
        if writable && schema_ptr.version() == 0 {
            let mut context: HashSet<String> = HashSet::new();
            context.insert(endpoints_path.clone());
            let saved = self
                .save_shared(&foreign.path, &foreign.id, schema_ptr.body().clone(), &mut context)
                .await;
            match saved {
                Ok(version) => {
                    schema_ptr.set_version(version);
                    self.notify_schema_updated(&foreign.uri, version);
                }
                Err(ClientError::Store(StoreError::DocVersionConflict { .. })) => {
                    // A concurrent writer got there first; reload theirs.
                    let mut context: HashSet<String> = HashSet::new();
                    context.insert(endpoints_path.clone());
                    let reloaded = self
                        .get_shared(foreign.path.clone(), foreign.id.clone(), &mut context)
                        .await;
                    schema_ptr = match reloaded {
                        Ok((version, value)) => Arc::new(Schema::with_version(value, version)),
                        Err(err @ ClientError::CyclicSchemaReference(_)) => return Err(err),
                        Err(_) => Arc::new(Schema::new(initial_schema())),
                    };
                    match self.cas(&foreign.uri, &foreign_schema_ptr, schema_ptr) {
                        CasOutcome::Installed(installed) => schema_ptr = installed,
                        CasOutcome::Lost(current) => schema_ptr = current,
                    }
                    failure = true;
                }
                Err(err) => {
                    self.revert(&foreign.uri, &schema_ptr, &foreign_schema_ptr);
                    return Err(err);
                }
            }
        }

        Ok((failure, schema_ptr, Some(foreign.uri)))
    }

    /// Re-inspect a slot under the cache mutex and install `candidate` only
    /// when the slot is still what `observed` was.
    fn cas(&self, key: &str, observed: &Option<SchemaRef>, candidate: SchemaRef) -> CasOutcome {
        let mut schemas = self.schemas.lock().unwrap();
        let slot = schemas.get(key).cloned();
        match (&slot, observed) {
            (None, _) => {
                schemas.put(key.to_string(), candidate.clone());
                self.inserted.lock().unwrap().insert(key.to_string(), Instant::now());
                CasOutcome::Installed(candidate)
            }
            (Some(current), Some(observed)) if Arc::ptr_eq(current, observed) => {
                schemas.put(key.to_string(), candidate.clone());
                self.inserted.lock().unwrap().insert(key.to_string(), Instant::now());
                CasOutcome::Installed(candidate)
            }
            (Some(current), _) => {
                if *current == candidate {
                    CasOutcome::Installed(current.clone())
                } else {
                    CasOutcome::Lost(current.clone())
                }
            }
        }
    }

    /// Put a slot back to its prior value, but only if we still own it.
    fn revert(&self, key: &str, ours: &SchemaRef, prior: &Option<SchemaRef>) {
        let mut schemas = self.schemas.lock().unwrap();
        let slot = schemas.get(key).cloned();
        let owned = match &slot {
            None => true,
            Some(current) => Arc::ptr_eq(current, ours),
        };
        if owned {
            match prior {
                Some(prior) => {
                    schemas.put(key.to_string(), prior.clone());
                }
                None => {
                    schemas.pop(key);
                }
            }
            tracing::debug!(%key, "schema slot reverted after persistence failure");
        }
    }

    /// Write the local schema metadata through, handling the case where
    /// somebody else's metadata landed first.
    ///
    /// Returns the effective schema and whether the caller lost the write.
    async fn persist_local(
        &self,
        endpoints_path: &str,
        local_schema_path: &str,
        local_schema_ptr: &Option<SchemaRef>,
        schema_ptr: SchemaRef,
    ) -> Result<(SchemaRef, bool), ClientError> {
        let fresh = match local_schema_ptr {
            None => true,
            Some(prior) => **prior == *schema_ptr,
        };
        if !fresh {
            // The caller deliberately replaced a cached schema; overwrite.
            self.store
                .set_metadata(endpoints_path, SCHEMA_METADATA_KEY, serialise_schema(schema_ptr.body()))
                .await?;
            schema_ptr.set_version(1);
            return Ok((schema_ptr, false));
        }

        // Only write when there's no diverging metadata there already.
        let existing = match self.store.get_metadata(endpoints_path, SCHEMA_METADATA_KEY).await {
            Ok(ser) => ser.filter(|ser| !ser.is_empty()),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                tracing::error!(error=%err, "error reading schema metadata");
                None
            }
        };
        match existing {
            None => {
                self.store
                    .set_metadata(endpoints_path, SCHEMA_METADATA_KEY, serialise_schema(schema_ptr.body()))
                    .await?;
                schema_ptr.set_version(1);
                Ok((schema_ptr, false))
            }
            Some(ser) if matches!(local_schema_ptr, Some(prior) if serialise_schema(prior.body()) == ser) => {
                self.store
                    .set_metadata(endpoints_path, SCHEMA_METADATA_KEY, serialise_schema(schema_ptr.body()))
                    .await?;
                schema_ptr.set_version(1);
                Ok((schema_ptr, false))
            }
            Some(ser) => {
                // Pre-existing metadata differs from our cached view:
                // adopt it and report the lost write.
                let reloaded = Arc::new(Schema::with_version(unserialise_schema(&ser)?, 1));
                let effective = match self.cas(local_schema_path, &Some(schema_ptr), reloaded) {
                    CasOutcome::Installed(installed) => installed,
                    CasOutcome::Lost(current) => current,
                };
                Ok((effective, true))
            }
        }
    }

    /// Fetch a foreign schema document, re-wrapping it in a non-recursive
    /// envelope. Re-entering an endpoint already being resolved is a cycle.
    fn get_shared<'a>(
        &'a self,
        path: String,
        id: String,
        context: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<(u64, Value), ClientError>> {
        Box::pin(async move {
            if context.len() > MAX_SCHEMA_RECURSION {
                return Err(ClientError::MaxSchemaRecursion(path));
            }
            if !context.insert(path.clone()) {
                if path == SYSTEM_INDICES {
                    // The settings index's own schema (chicken and egg).
                    return Ok((0, default_indices_schema()));
                }
                return Err(ClientError::CyclicSchemaReference(path));
            }
            let result = self.get_shared_inner(&path, &id, context).await;
            context.remove(&path);
            result
        })
    }

    async fn get_shared_inner(
        &self,
        path: &str,
        id: &str,
        context: &mut HashSet<String>,
    ) -> Result<(u64, Value), ClientError> {
        // Split off a drill (`.field`) or field (`{…}`) selector.
        let (doc_id, selector) = match id[1..].find(|c| c == '.' || c == '{') {
            Some(pos) => {
                let pos = pos + 1;
                let selector = if id.as_bytes()[pos] == b'.' { &id[pos + 1..] } else { &id[pos..] };
                (&id[..pos], selector)
            }
            None => (id, ""),
        };
        let (obj, version) = self.store.get_document(path, doc_id).await?;
        let body = if selector.is_empty() {
            map_get(&obj, SCHEMA_FIELD_NAME).cloned().unwrap_or(obj.clone())
        } else {
            select(&obj, selector)
        };

        // A foreign document may itself be a link; chase it.
        if let Some(next) = validate_foreign(&body)? {
            return self.get_shared(next.path, next.id, context).await;
        }

        let envelope = Value::Map(vec![
            (Value::from(RESERVED_RECURSE), Value::from(false)),
            (Value::from(SCHEMA_FIELD_NAME), body),
        ]);
        Ok((version, envelope))
    }

    /// Save a foreign schema document, with the same cycle protection as
    /// [`get_shared`](Self::get_shared).
    async fn save_shared(
        &self,
        path: &str,
        id: &str,
        schema: Value,
        context: &mut HashSet<String>,
    ) -> Result<u64, ClientError> {
        if context.len() > MAX_SCHEMA_RECURSION {
            return Err(ClientError::MaxSchemaRecursion(path.to_string()));
        }
        if !context.insert(path.to_string()) {
            if path == SYSTEM_INDICES {
                return Ok(0);
            }
            return Err(ClientError::CyclicSchemaReference(path.to_string()));
        }
        let doc_id = match id[1..].find(|c| c == '.' || c == '{') {
            Some(pos) => &id[..pos + 1],
            None => id,
        };
        let result = self.store.update(path, doc_id, 0, true, schema, false).await;
        context.remove(path);
        Ok(result?)
    }

    /// Announce a foreign schema advance to peers, unless the known version
    /// already covers it.
    fn notify_schema_updated(&self, uri: &str, version: u64) {
        if self.config.solo {
            return;
        }
        {
            let mut versions = self.versions.lock().unwrap();
            if matches!(versions.get(uri), Some(&known) if known >= version) {
                return;
            }
            versions.put(uri.to_string(), version);
        }
        if let Some(discovery) = &self.discovery {
            discovery.db_update_send(uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn validates_foreign_links() {
        let ok = foreign_link("some/index/docid");
        let foreign = validate_foreign(&ok).unwrap().unwrap();
        assert_eq!(foreign.uri, "some/index/docid");
        assert_eq!(foreign.path, "some/index");
        assert_eq!(foreign.id, "docid");

        let missing_id = foreign_link("justonepart");
        assert!(matches!(
            validate_foreign(&missing_id),
            Err(ClientError::ForeignUriMissingParts { .. })
        ));

        let local = initial_schema();
        assert!(validate_foreign(&local).unwrap().is_none());
    }

    #[test]
    fn foreign_uri_is_percent_decoded() {
        let link = foreign_link(".xapiand/indices/some%2Findex");
        let foreign = validate_foreign(&link).unwrap().unwrap();
        assert_eq!(foreign.path, ".xapiand/indices");
        assert_eq!(foreign.id, "some/index");
    }

    #[test]
    fn schema_equality_is_by_body() {
        let a = Schema::new(initial_schema());
        let b = Schema::with_version(initial_schema(), 7);
        assert_eq!(a, b);
        let c = Schema::new(foreign_link("a/b"));
        assert!(a != c);
    }

    #[test]
    fn selectors() {
        let doc = Value::Map(vec![
            (Value::from("a"), Value::Map(vec![(Value::from("b"), Value::from(1u64))])),
            (Value::from("c"), Value::from(2u64)),
        ]);
        assert_eq!(select(&doc, "a.b"), Value::from(1u64));
        assert_eq!(select(&doc, "missing"), Value::Nil);
        let fields = select(&doc, "{c}");
        assert_eq!(map_get(&fields, "c"), Some(&Value::from(2u64)));
    }

    #[test]
    fn schema_serialisation_roundtrip() {
        let schema = default_indices_schema();
        let ser = serialise_schema(&schema);
        assert_eq!(unserialise_schema(&ser).unwrap(), schema);
    }
}
