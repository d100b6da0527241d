//! The store facade.
//!
//! A [`Store`] owns the identity cache, the notification manager and the record array manager, and drives a storage
//! backend built for it. Every mutating operation runs inside a batch ([`Store::join`]), so subscribers see the result
//! of an operation only once it is complete.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;

use fieldx::fxstruct;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::instrument;

use crate::capabilities::CacheCapabilities;
use crate::config::StoreConfig;
use crate::document::ApiError;
use crate::document::CachedDocument;
use crate::document::JsonApiDocument;
use crate::document::ResourceObject;
use crate::error::Result;
use crate::identifier::DocumentKey;
use crate::identifier::IdentifierCache;
use crate::identifier::ResourceKey;
use crate::notification::NotificationManager;
use crate::record::Record;
use crate::record_array::Collection;
use crate::record_array_manager::CollectionConfig;
use crate::record_array_manager::RecordArrayManager;
use crate::scheduler::FlushScheduler;
use crate::scheduler::SyncScheduler;
use crate::scheduler::TaskQueue;
use crate::schema::DefaultSchema;
use crate::traits::Cache;
use crate::traits::Schema;

/// Parameters a [`Store`] is built with.
///
/// ```
/// # use std::rc::Rc;
/// # use live_store::prelude::*;
/// let store = Store::builder()
///     .config(StoreConfig::builder().log_notifications(true).build().unwrap())
///     .schema(Rc::new(SchemaService::new().hide_new("draft")))
///     .build_with(MemoryCache::new)
///     .unwrap();
/// assert!(store.config().log_notifications());
/// ```
#[fxstruct(builder(
    doc("Builder object of [`StoreSetup`].", "", "See [`Store::builder()`] method."),
    method_doc("Implement builder pattern for [`StoreSetup`]."),
))]
pub struct StoreSetup {
    #[fieldx(get, builder(into), default(StoreConfig::new()))]
    config: StoreConfig,

    /// Where flushes go when [`StoreConfig::async_flush`] is set.
    #[fieldx(get(clone), default(Rc::new(SyncScheduler) as Rc<dyn FlushScheduler>))]
    scheduler: Rc<dyn FlushScheduler>,

    #[fieldx(get(clone), default(Rc::new(DefaultSchema) as Rc<dyn Schema>))]
    schema: Rc<dyn Schema>,
}

impl StoreSetupBuilder {
    /// Finishes the setup and builds the store around the backend `factory` creates.
    pub fn build_with<F, C>(mut self, factory: F) -> Result<Rc<Store>>
    where
        F: FnOnce(Rc<CacheCapabilities>) -> C,
        C: Cache + 'static,
    {
        Ok(self.build()?.into_store(factory))
    }
}

impl StoreSetup {
    /// Builds the store and its backend. `factory` receives the capabilities handle the backend reports changes
    /// through; it must not call into the store yet.
    pub fn into_store<F, C>(self, factory: F) -> Rc<Store>
    where
        F: FnOnce(Rc<CacheCapabilities>) -> C,
        C: Cache + 'static,
    {
        let identifiers = Rc::new(IdentifierCache::new());
        let queue = Rc::new(TaskQueue::new());
        let notifications =
            NotificationManager::new(identifiers.clone(), queue.clone(), self.scheduler(), self.config());
        let schema = self.schema();
        let config = self.config;

        let store = Rc::new_cyclic(|myself: &Weak<Store>| {
            let capabilities = Rc::new(CacheCapabilities::new(myself.clone(), identifiers.clone()));
            let cache: Rc<dyn Cache> = Rc::new(factory(capabilities.clone()));
            Store {
                myself: myself.clone(),
                config,
                identifiers,
                queue,
                notifications,
                capabilities,
                cache,
                schema,
                record_arrays: RecordArrayManager::new(myself.clone()),
                instances: RefCell::new(HashMap::new()),
                destroyed: Cell::new(false),
            }
        });

        store.record_arrays.connect(&store.notifications);
        debug!("store is ready");
        store
    }
}

pub struct Store {
    myself:        Weak<Store>,
    config:        StoreConfig,
    identifiers:   Rc<IdentifierCache>,
    queue:         Rc<TaskQueue>,
    notifications: Rc<NotificationManager>,
    capabilities:  Rc<CacheCapabilities>,
    cache:         Rc<dyn Cache>,
    schema:        Rc<dyn Schema>,
    record_arrays: Rc<RecordArrayManager>,
    instances:     RefCell<HashMap<ResourceKey, Record>>,
    destroyed:     Cell<bool>,
}

impl Store {
    pub fn builder() -> StoreSetupBuilder {
        StoreSetup::builder()
    }

    /// A store with default settings.
    pub fn new<F, C>(factory: F) -> Rc<Self>
    where
        F: FnOnce(Rc<CacheCapabilities>) -> C,
        C: Cache + 'static,
    {
        StoreSetup::new().into_store(factory)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn identifiers(&self) -> &Rc<IdentifierCache> {
        &self.identifiers
    }

    pub fn notifications(&self) -> &Rc<NotificationManager> {
        &self.notifications
    }

    pub fn capabilities(&self) -> &Rc<CacheCapabilities> {
        &self.capabilities
    }

    pub fn cache(&self) -> &Rc<dyn Cache> {
        &self.cache
    }

    pub fn schema(&self) -> &Rc<dyn Schema> {
        &self.schema
    }

    pub fn record_arrays(&self) -> &Rc<RecordArrayManager> {
        &self.record_arrays
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    fn assert_alive(&self) {
        assert!(!self.destroyed.get(), "The store has been destroyed");
    }

    /// Runs `f` as one batch: notifications raised inside are delivered after the outermost `join` returns.
    pub fn join<R>(&self, f: impl FnOnce() -> R) -> R {
        self.queue.join(f)
    }

    pub fn is_batching(&self) -> bool {
        self.queue.is_batching()
    }

    // Identity.

    pub fn identifier_for(&self, resource_type: &str, id: &str) -> ResourceKey {
        self.identifiers.get_or_create(resource_type, Some(id), None)
    }

    pub fn peek_identifier(&self, resource_type: &str, id: &str) -> Option<ResourceKey> {
        self.identifiers.peek(resource_type, id)
    }

    pub fn document_identifier(&self, lid: &str) -> DocumentKey {
        self.identifiers.document(lid)
    }

    // Data.

    #[instrument(level = "trace", skip(self, document))]
    pub fn push(&self, document: JsonApiDocument) -> Result<CachedDocument> {
        self.assert_alive();
        self.join(|| self.cache.put(document, None))
    }

    pub fn push_json(&self, json: &str) -> Result<CachedDocument> {
        self.push(JsonApiDocument::from_json(json)?)
    }

    /// Stores `document` as the result of `request`.
    pub fn put_request(&self, request: &DocumentKey, document: JsonApiDocument) -> Result<CachedDocument> {
        self.assert_alive();
        self.join(|| self.cache.put(document, Some(request)))
    }

    pub fn peek_request(&self, request: &DocumentKey) -> Option<CachedDocument> {
        self.cache.peek_request(request)
    }

    pub fn invalidate_request(&self, request: &DocumentKey) -> Result<()> {
        self.assert_alive();
        self.join(|| self.cache.invalidate_request(request))
    }

    /// Creates a resource that exists only locally until it is committed.
    pub fn create_record(&self, resource_type: &str, attributes: Map<String, Value>) -> Result<ResourceKey> {
        self.assert_alive();
        let key = self.identifiers.create_for_new(resource_type);
        debug!("creating {key}");
        self.join(|| self.cache.client_did_create(&key, attributes))?;
        Ok(key)
    }

    /// Marks the resource deleted. Until the deletion is committed only new resources disappear from collections.
    pub fn delete_record(&self, key: &ResourceKey) -> Result<()> {
        self.assert_alive();
        self.join(|| self.cache.set_is_deleted(key, true))
    }

    pub fn will_commit(&self, key: &ResourceKey) -> Result<()> {
        self.assert_alive();
        self.join(|| self.cache.will_commit(key))
    }

    pub fn did_commit(&self, key: &ResourceKey, data: Option<ResourceObject>) -> Result<()> {
        self.assert_alive();
        self.join(|| self.cache.did_commit(key, data))
    }

    pub fn commit_was_rejected(&self, key: &ResourceKey, errors: Vec<ApiError>) -> Result<()> {
        self.assert_alive();
        self.join(|| self.cache.commit_was_rejected(key, errors))
    }

    /// Drops the resource's data. The backend disconnects the key, after which it must not be used anymore.
    pub fn unload_record(&self, key: &ResourceKey) -> Result<()> {
        self.assert_alive();
        self.join(|| self.cache.unload_record(key))
    }

    /// Unloads every resource currently in the live collection of `resource_type`.
    pub fn unload_all(&self, resource_type: &str) -> Result<()> {
        self.assert_alive();
        let keys = self.live_array_for(resource_type).identifiers();
        self.join(|| keys.iter().try_for_each(|key| self.cache.unload_record(key)))
    }

    /// Whether the resource counts as present. With `filter_deleted` a resource whose deletion has been committed
    /// doesn't.
    pub fn record_is_loaded(&self, key: &ResourceKey, filter_deleted: bool) -> bool {
        if self.cache.is_new(key) {
            return !self.cache.is_deleted(key);
        }
        if filter_deleted && self.cache.is_deletion_committed(key) {
            return false;
        }
        !self.cache.is_empty(key)
    }

    // Records.

    /// The record handle of a loaded resource. Handles are created once per key and reused.
    pub fn peek_record(&self, key: &ResourceKey) -> Option<Record> {
        if !self.identifiers.is_stable(key) || !self.record_is_loaded(key, true) {
            return None;
        }
        Some(
            self.instances
                .borrow_mut()
                .entry(key.clone())
                .or_insert_with(|| Record::new(key.clone(), self.myself.clone()))
                .clone(),
        )
    }

    pub fn peek_record_for(&self, resource_type: &str, id: &str) -> Option<Record> {
        self.peek_identifier(resource_type, id)
            .and_then(|key| self.peek_record(&key))
    }

    pub fn has_record(&self, key: &ResourceKey) -> bool {
        self.instances.borrow().contains_key(key)
    }

    // Collections.

    pub fn live_array_for(&self, resource_type: &str) -> Collection {
        self.record_arrays.live_array_for(resource_type)
    }

    pub fn get_collection(&self, config: CollectionConfig) -> Collection {
        self.record_arrays.get_collection(config)
    }

    /// The collection mirroring the primary data of `request`. The document must be in the cache by the time the
    /// collection is first read.
    pub fn request_collection(&self, request: &DocumentKey) -> Collection {
        self.get_collection(CollectionConfig::Request {
            document: request.clone(),
        })
    }

    /// Pushes the response to a query and returns a collection of its primary data.
    #[instrument(level = "trace", skip(self, document))]
    pub fn query(&self, resource_type: &str, query: Option<Value>, document: JsonApiDocument) -> Result<Collection> {
        let collection = self
            .record_arrays
            .get_collection(CollectionConfig::query(resource_type, query));
        match self.push(document) {
            Ok(cached) => {
                self.record_arrays
                    .populate_query(&collection, cached.keys(), cached.meta, cached.links);
                Ok(collection)
            }
            Err(err) => {
                collection.destroy();
                Err(err)
            }
        }
    }

    // Teardown.

    pub(crate) fn disconnect(&self, key: &ResourceKey) {
        debug!("disconnecting {key}");
        self.instances.borrow_mut().remove(key);
        self.record_arrays.disconnect(key);
        self.notifications.purge(key);
        self.identifiers.forget(key);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Tears down collections, subscriptions and identities. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        debug!("destroying store");
        self.record_arrays.destroy();
        self.notifications.destroy();
        self.instances.borrow_mut().clear();
        self.identifiers.clear();
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::document::ResourceObject;
    use crate::memory::MemoryCache;
    use crate::test::memory_store;
    use crate::test::widget;

    #[test]
    fn setup() {
        let defaults = StoreSetup::new();
        assert!(!defaults.config().async_flush());
        assert!(!defaults.schema().hides_new_resources("widget"));
        let store = defaults.into_store(MemoryCache::new);
        assert!(!store.config().log_notifications());

        let store = Store::builder()
            .config(StoreConfig::builder().async_flush(true).build().unwrap())
            .schema(Rc::new(crate::schema::SchemaService::new().hide_new("widget")))
            .build_with(MemoryCache::new)
            .unwrap();
        assert!(store.config().async_flush());
        assert!(store.schema().hides_new_resources("widget"));
        assert!(!store.schema().hides_new_resources("user"));
    }

    #[test]
    fn loaded_state() {
        let store = memory_store();
        store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
        let key = store.identifier_for("widget", "1");
        assert!(store.record_is_loaded(&key, true));

        store.delete_record(&key).unwrap();
        // Deleted but not committed yet.
        assert!(store.record_is_loaded(&key, true));
        store.will_commit(&key).unwrap();
        store.did_commit(&key, None).unwrap();
        assert!(!store.record_is_loaded(&key, true));
        assert!(store.record_is_loaded(&key, false));

        let created = store.create_record("widget", Map::new()).unwrap();
        assert!(store.record_is_loaded(&created, true));
        store.delete_record(&created).unwrap();
        assert!(!store.record_is_loaded(&created, false));

        let unknown = store.identifier_for("widget", "404");
        assert!(!store.record_is_loaded(&unknown, false));
    }

    #[test]
    fn record_handles() {
        let store = memory_store();
        store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
        let key = store.identifier_for("widget", "1");

        assert!(!store.has_record(&key));
        assert!(!store.capabilities().has_record(&key));
        let record = store.peek_record(&key).unwrap();
        assert!(store.has_record(&key));
        assert!(store.capabilities().has_record(&key));
        assert_eq!(store.peek_record_for("widget", "1"), Some(record.clone()));
        assert_eq!(store.peek_record_for("widget", "2"), None);

        record.set_attr("name", "Cog").unwrap();
        assert_eq!(record.attr("name").unwrap(), Some(json!("Cog")));
        assert_eq!(record.rollback_attributes().unwrap(), vec!["name"]);

        store.unload_record(&key).unwrap();
        assert!(!store.has_record(&key));
        assert!(store.peek_record(&key).is_none());
    }

    #[test]
    fn record_outliving_store() {
        let store = memory_store();
        store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
        let record = store.peek_record_for("widget", "1").unwrap();
        drop(store);
        assert!(matches!(record.attr("name"), Err(crate::error::StoreError::Detached(_))));
    }

    #[test]
    fn query_collection() {
        let store = memory_store();
        let collection = store
            .query(
                "widget",
                Some(json!({ "color": "red" })),
                JsonApiDocument {
                    meta: Some(json!({ "total": 2 })),
                    ..JsonApiDocument::many(vec![widget("1", "A"), widget("2", "B")])
                },
            )
            .unwrap();

        assert!(collection.is_loaded());
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.meta(), Some(json!({ "total": 2 })));

        let failing = store.query("widget", None, JsonApiDocument::one(ResourceObject {
            id: None,
            ..widget("3", "C")
        }));
        assert!(failing.is_err());
    }

    #[test]
    fn destroy_is_idempotent() {
        let store = Store::new(MemoryCache::new);
        let live = store.live_array_for("widget");
        store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
        store.destroy();
        store.destroy();

        assert!(store.is_destroyed());
        assert!(store.notifications().is_destroyed());
        assert!(store.record_arrays().is_destroyed());
        assert!(live.is_destroyed());
        assert!(live.is_empty());
        assert!(store.identifiers().is_empty());
    }

    #[test]
    #[should_panic(expected = "has been destroyed")]
    fn push_after_destroy_panics() {
        let store = memory_store();
        store.destroy();
        let _ = store.push(JsonApiDocument::one(widget("1", "Sprocket")));
    }
}
