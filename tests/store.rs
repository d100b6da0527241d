#![cfg(feature = "test")]

use std::cell::RefCell;
use std::rc::Rc;

use live_store::document::ApiError;
use live_store::document::CachedDocument;
use live_store::document::Linkage;
use live_store::document::RelationshipState;
use live_store::document::ResourceIdentifierObject;
use live_store::error::Result;
use live_store::notification::callback;
use live_store::prelude::*;
use live_store::record_array::SLICE_BATCH_SIZE;
use live_store::scheduler::TokioScheduler;
use live_store::test::init_tracing;
use live_store::test::memory_store;
use live_store::test::memory_store_with;
use live_store::test::widget;
use live_store::test::Recorder;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

#[test]
fn widget_lifecycle() {
    init_tracing();
    let store = memory_store();
    let key = store.identifier_for("widget", "1");
    let widgets = store.live_array_for("widget");
    let keyed = Recorder::new();
    let channel = Recorder::new();
    store.notifications().subscribe(&key, keyed.callback());
    store
        .notifications()
        .subscribe(SubscriptionTarget::AnyResource, channel.callback());

    store
        .push_json(r#"{ "data": { "type": "widget", "id": "1", "attributes": { "name": "Sprocket" } } }"#)
        .unwrap();
    assert_eq!(widgets.identifiers(), vec![key.clone()]);

    let record = store.peek_record(&key).unwrap();
    record.set_attr("name", "Cog").unwrap();
    assert_eq!(record.attr("name").unwrap(), Some(json!("Cog")));

    store.unload_record(&key).unwrap();
    assert!(widgets.is_empty());
    assert!(!store.identifiers().is_stable(&key));

    let name = key.to_string();
    assert_eq!(
        keyed.events(),
        vec![
            format!("{name} added"),
            format!("{name} attributes name"),
            format!("{name} removed"),
        ]
    );
    assert_eq!(channel.events(), vec![format!("{name} added"), format!("{name} removed")]);
}

#[test]
fn batch_delivers_once_complete() {
    let store = memory_store();
    store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
    let key = store.identifier_for("widget", "1");
    let seen = Rc::new(RefCell::new(Vec::new()));

    // The subscriber reads back from the store; by then both edits must be visible.
    let weak = Rc::downgrade(&store);
    let s = seen.clone();
    let k = key.clone();
    store.notifications().subscribe(
        &key,
        callback(move |_, _, field| {
            let store = weak.upgrade().unwrap();
            let value = store.cache().get_attr(&k, field.unwrap()).unwrap();
            s.borrow_mut().push((field.unwrap().to_string(), value));
        }),
    );

    store.join(|| {
        let record = store.peek_record(&key).unwrap();
        record.set_attr("name", "Cog").unwrap();
        record.set_attr("size", 3).unwrap();
        assert!(seen.borrow().is_empty());
    });

    assert_eq!(
        *seen.borrow(),
        vec![
            ("name".to_string(), Some(json!("Cog"))),
            ("size".to_string(), Some(json!(3)))
        ]
    );
}

#[test]
fn unload_drops_pending_field_notifications() {
    let store = memory_store();
    store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
    let key = store.identifier_for("widget", "1");
    let recorder = Recorder::new();
    store.notifications().subscribe(&key, recorder.callback());

    store
        .join(|| {
            store.cache().set_attr(&key, "name", json!("Cog"))?;
            store.unload_record(&key)
        })
        .unwrap();

    assert_eq!(recorder.events(), vec![format!("{key} removed")]);
    assert!(!store.notifications().has_pending());
}

#[test]
fn relationship_changes_are_coalesced() {
    let store = memory_store();
    let key = store.identifier_for("widget", "1");
    let recorder = Recorder::new();
    store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
    store.notifications().subscribe(&key, recorder.callback());

    let owned_by = |owner: &str| {
        widget("1", "Sprocket").relationship("owner", Linkage::One(ResourceIdentifierObject::new("user", owner)))
    };
    store.join(|| {
        store.push(JsonApiDocument::one(owned_by("3"))).unwrap();
        store.push(JsonApiDocument::one(owned_by("4"))).unwrap();
    });

    assert_eq!(recorder.events(), vec![format!("{key} relationships owner")]);
    let user = store.identifier_for("user", "4");
    assert_eq!(
        store
            .cache()
            .get_relationship(&key, "owner")
            .unwrap()
            .and_then(|state| state.data),
        Some(live_store::document::RelationshipValue::One(Some(user)))
    );
}

#[test]
fn large_appends() {
    let store = memory_store();
    let widgets = store.live_array_for("widget");
    let count = SLICE_BATCH_SIZE * 2 + 500;

    let resources = (0..count)
        .map(|i| widget(&i.to_string(), &format!("Widget {i}")))
        .collect();
    store.push(JsonApiDocument::many(resources)).unwrap();

    assert_eq!(widgets.len(), count);
    widgets.with_identifiers(|keys| {
        assert_eq!(keys[0].id().as_deref(), Some("0"));
        assert_eq!(keys[SLICE_BATCH_SIZE].id(), Some(SLICE_BATCH_SIZE.to_string()));
        assert_eq!(keys[count - 1].id(), Some((count - 1).to_string()));
    });

    // Removing everything takes the fast path.
    store.unload_all("widget").unwrap();
    assert!(widgets.is_empty());
}

#[test]
#[should_panic(expected = "which is already used by")]
fn conflicting_id_panics() {
    let store = memory_store();
    store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
    let key = store.create_record("widget", Map::new()).unwrap();
    store.will_commit(&key).unwrap();
    let _ = store.did_commit(&key, Some(widget("1", "Sprocket")));
}

#[test]
#[should_panic(expected = "Expected a stable identifier")]
fn subscribing_to_unloaded_key_panics() {
    let store = memory_store();
    store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
    let key = store.identifier_for("widget", "1");
    store.unload_record(&key).unwrap();
    store.notifications().subscribe(&key, Recorder::new().callback());
}

#[test]
fn hidden_new_resources() {
    let store = memory_store_with(Store::builder().schema(Rc::new(SchemaService::new().hide_new("widget"))));
    let widgets = store.live_array_for("widget");
    store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();

    let mut attributes = Map::new();
    attributes.insert("name".into(), json!("Draft"));
    let draft = store.create_record("widget", attributes).unwrap();
    assert_eq!(widgets.len(), 1);

    store.will_commit(&draft).unwrap();
    store.did_commit(&draft, Some(widget("2", "Draft"))).unwrap();
    assert_eq!(widgets.len(), 2);
    assert_eq!(widgets.get(1), Some(draft));
}

#[tokio::test]
async fn async_flush_with_tokio() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let store = memory_store_with(
                Store::builder()
                    .config(StoreConfig::builder().async_flush(true).build().unwrap())
                    .scheduler(Rc::new(TokioScheduler)),
            );
            store.push(JsonApiDocument::one(widget("1", "Sprocket"))).unwrap();
            let key = store.identifier_for("widget", "1");
            let recorder = Recorder::new();
            store.notifications().subscribe(&key, recorder.callback());

            store.cache().set_attr(&key, "name", json!("Cog")).unwrap();
            store.cache().set_attr(&key, "size", json!(3)).unwrap();
            assert!(recorder.events().is_empty());
            assert!(store.notifications().is_flush_scheduled());

            for _ in 0..10 {
                if !recorder.events().is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert_eq!(
                recorder.events(),
                vec![format!("{key} attributes name"), format!("{key} attributes size")]
            );
        })
        .await;
}

// Implements only what a backend has to.
struct MinimalCache(MemoryCache);

impl Cache for MinimalCache {
    fn put(&self, document: JsonApiDocument, request: Option<&DocumentKey>) -> Result<CachedDocument> {
        self.0.put(document, request)
    }

    fn upsert(
        &self,
        key: &ResourceKey,
        data: ResourceObject,
        calculate_changes: bool,
    ) -> Result<Option<Vec<String>>> {
        self.0.upsert(key, data, calculate_changes)
    }

    fn peek(&self, key: &ResourceKey) -> Option<ResourceObject> {
        self.0.peek(key)
    }

    fn peek_request(&self, request: &DocumentKey) -> Option<CachedDocument> {
        self.0.peek_request(request)
    }

    fn get_attr(&self, key: &ResourceKey, field: &str) -> Result<Option<Value>> {
        self.0.get_attr(key, field)
    }

    fn set_attr(&self, key: &ResourceKey, field: &str, value: Value) -> Result<()> {
        self.0.set_attr(key, field, value)
    }

    fn get_relationship(&self, key: &ResourceKey, field: &str) -> Result<Option<RelationshipState>> {
        self.0.get_relationship(key, field)
    }

    fn client_did_create(&self, key: &ResourceKey, attributes: Map<String, Value>) -> Result<()> {
        self.0.client_did_create(key, attributes)
    }

    fn will_commit(&self, key: &ResourceKey) -> Result<()> {
        self.0.will_commit(key)
    }

    fn did_commit(&self, key: &ResourceKey, data: Option<ResourceObject>) -> Result<()> {
        self.0.did_commit(key, data)
    }

    fn commit_was_rejected(&self, key: &ResourceKey, errors: Vec<ApiError>) -> Result<()> {
        self.0.commit_was_rejected(key, errors)
    }

    fn unload_record(&self, key: &ResourceKey) -> Result<()> {
        self.0.unload_record(key)
    }

    fn set_is_deleted(&self, key: &ResourceKey, is_deleted: bool) -> Result<()> {
        self.0.set_is_deleted(key, is_deleted)
    }

    fn is_new(&self, key: &ResourceKey) -> bool {
        self.0.is_new(key)
    }

    fn is_deleted(&self, key: &ResourceKey) -> bool {
        self.0.is_deleted(key)
    }

    fn is_deletion_committed(&self, key: &ResourceKey) -> bool {
        self.0.is_deletion_committed(key)
    }

    fn is_empty(&self, key: &ResourceKey) -> bool {
        Cache::is_empty(&self.0, key)
    }
}

#[test]
fn optional_capabilities_report_not_implemented() {
    let store = Store::new(|capabilities| MinimalCache(MemoryCache::new(capabilities)));
    let request = store.document_identifier("/widgets");
    store
        .put_request(&request, JsonApiDocument::many(vec![widget("1", "Sprocket")]))
        .unwrap();

    let widgets = store.request_collection(&request);
    assert_eq!(widgets.len(), 1);

    let record = store.peek_record(&widgets.get(0).unwrap()).unwrap();
    assert!(matches!(
        record.changed_attributes(),
        Err(StoreError::NotImplemented {
            method: "changed_attributes"
        })
    ));
    assert!(matches!(
        record.rollback_attributes(),
        Err(StoreError::NotImplemented { .. })
    ));
    let err = store.invalidate_request(&request).unwrap_err();
    assert_eq!(err.to_string(), "invalidate_request is not implemented by this cache");
}
