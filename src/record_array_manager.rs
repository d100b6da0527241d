//! Keeps every collection in line with the cache.
//!
//! The manager listens on the wildcard resource and document channels. Changes are routed to the collections that
//! care about the key as pending changesets:
//!
//! - the live collection of the key's type, or a per-type staged changeset if that live collection hasn't been
//!   requested yet;
//! - managed collections (query, source and request collections) the key has been associated with, for removals and
//!   re-additions.
//!
//! Nothing is applied until a collection is read.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;
use std::rc::Weak;

use serde_json::Value;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::identifier::DocumentKey;
use crate::identifier::ResourceKey;
use crate::notification::callback;
use crate::notification::NotificationManager;
use crate::notification::SubscriptionToken;
use crate::record_array::fast_push;
use crate::record_array::record_change;
use crate::record_array::ChangeSet;
use crate::record_array::Collection;
use crate::record_array::CollectionKind;
use crate::store::Store;
use crate::types::ChangeAction;
use crate::types::Operation;
use crate::types::SubscriptionTarget;

/// What [`RecordArrayManager::get_collection`] should create.
#[derive(Debug, Clone)]
pub enum CollectionConfig {
    /// A query result. With `identifiers` the collection starts populated, otherwise it waits for
    /// [`RecordArrayManager::populate_query`].
    Query {
        resource_type: String,
        query:         Option<Value>,
        identifiers:   Option<Vec<ResourceKey>>,
        meta:          Option<Value>,
        links:         Option<Value>,
    },
    /// A fixed list of keys. Members still disappear when they are removed from the cache.
    Source { identifiers: Vec<ResourceKey> },
    /// The primary data of a request document, refreshed whenever the document is updated. One collection per
    /// document.
    Request { document: DocumentKey },
}

impl CollectionConfig {
    pub fn query(resource_type: impl Into<String>, query: Option<Value>) -> Self {
        Self::Query {
            resource_type: resource_type.into(),
            query,
            identifiers: None,
            meta: None,
            links: None,
        }
    }
}

enum PendingTarget {
    Collection(Collection),
    Staged(String),
}

#[derive(Default)]
struct ArrayRegistry {
    live:        HashMap<String, Collection>,
    managed:     HashSet<Collection>,
    staged:      HashMap<String, ChangeSet>,
    identifiers: HashMap<ResourceKey, HashSet<Collection>>,
    requests:    HashMap<DocumentKey, Collection>,
    // Last known add/remove state of every key seen on the resource channel.
    visibility:  HashMap<ResourceKey, bool>,
    // Keys whose `removed` notification has been routed and which haven't been disconnected yet.
    removed:     HashSet<ResourceKey>,
    next_id:     u64,
}

impl ArrayRegistry {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn associate(&mut self, collection: &Collection, keys: &[ResourceKey]) {
        let mut associated = collection.0.associated.borrow_mut();
        for key in keys {
            if associated.insert(key.clone()) {
                self.identifiers
                    .entry(key.clone())
                    .or_default()
                    .insert(collection.clone());
            }
        }
    }

    fn disassociate_all(&mut self, collection: &Collection) {
        let associated = std::mem::take(&mut *collection.0.associated.borrow_mut());
        for key in associated {
            if let Some(collections) = self.identifiers.get_mut(&key) {
                collections.remove(collection);
                if collections.is_empty() {
                    self.identifiers.remove(&key);
                }
            }
        }
    }

    fn pending_targets(&self, key: &ResourceKey, include_managed: bool, is_remove: bool) -> Vec<PendingTarget> {
        let mut targets = Vec::new();

        if include_managed {
            if let Some(collections) = self.identifiers.get(key) {
                targets.extend(collections.iter().cloned().map(PendingTarget::Collection));
            }
        }

        match self.live.get(key.resource_type()) {
            Some(live) => {
                // Nothing to remove from a live collection that is empty and has nothing coming.
                if !(is_remove && live.raw_len() == 0 && !live.has_pending()) {
                    targets.push(PendingTarget::Collection(live.clone()));
                }
            }
            None => targets.push(PendingTarget::Staged(key.resource_type().to_string())),
        }

        targets
    }
}

pub struct RecordArrayManager {
    myself:        Weak<RecordArrayManager>,
    store:         Weak<Store>,
    registry:      RefCell<ArrayRegistry>,
    subscriptions: RefCell<Vec<SubscriptionToken>>,
    destroying:    Cell<bool>,
    destroyed:     Cell<bool>,
}

impl RecordArrayManager {
    pub(crate) fn new(store: Weak<Store>) -> Rc<Self> {
        Rc::new_cyclic(|myself| Self {
            myself: myself.clone(),
            store,
            registry: RefCell::new(ArrayRegistry::default()),
            subscriptions: RefCell::new(Vec::new()),
            destroying: Cell::new(false),
            destroyed: Cell::new(false),
        })
    }

    /// Subscribes to the wildcard channels of `notifications`.
    pub(crate) fn connect(&self, notifications: &NotificationManager) {
        let manager = self.myself.clone();
        let resources = notifications.subscribe(
            SubscriptionTarget::AnyResource,
            callback(move |identifier, operation, _| {
                if let (Some(manager), Some(key)) = (manager.upgrade(), identifier.as_resource()) {
                    manager.on_resource_change(key, operation);
                }
            }),
        );

        let manager = self.myself.clone();
        let documents = notifications.subscribe(
            SubscriptionTarget::AnyDocument,
            callback(move |identifier, operation, _| {
                if let (Some(manager), Some(document)) = (manager.upgrade(), identifier.as_document()) {
                    manager.on_document_change(document, operation);
                }
            }),
        );

        self.subscriptions.borrow_mut().extend([resources, documents]);
    }

    fn store(&self) -> Option<Rc<Store>> {
        self.store.upgrade()
    }

    fn is_destroying(&self) -> bool {
        self.destroying.get() || self.destroyed.get()
    }

    fn on_resource_change(&self, key: &ResourceKey, operation: Operation) {
        if self.is_destroying() {
            return;
        }
        let Some(store) = self.store()
        else {
            return;
        };
        // A key may have been disconnected between buffering and delivery. Its removal has been accounted for then.
        if !store.identifiers().is_stable(key) {
            return;
        }

        match operation {
            Operation::Added => {
                let visible = self.is_visible(&store, key, true);
                {
                    let mut registry = self.registry.borrow_mut();
                    registry.removed.remove(key);
                    registry.visibility.insert(key.clone(), visible);
                }
                if visible {
                    self.identifier_added(key);
                }
                else {
                    trace!("{key} is hidden while new");
                }
            }
            Operation::Removed => {
                {
                    let mut registry = self.registry.borrow_mut();
                    registry.visibility.insert(key.clone(), false);
                    registry.removed.insert(key.clone());
                }
                self.identifier_removed(key);
            }
            Operation::State => self.identifier_changed(key),
            _ => (),
        }
    }

    fn on_document_change(&self, document: &DocumentKey, operation: Operation) {
        if self.is_destroying() || operation != Operation::Updated {
            return;
        }
        let collection = self.registry.borrow().requests.get(document).cloned();
        if let Some(collection) = collection {
            debug!("{document} updated, {collection:?} will resync");
            collection.0.should_sync_from_cache.set(true);
            collection.mark_dirty();
        }
    }

    // `on_add` is set for an `added` notification: a resource added to the cache counts as loaded even when the
    // backend can't tell yet.
    fn is_visible(&self, store: &Store, key: &ResourceKey, on_add: bool) -> bool {
        let cache = store.cache();
        if store.schema().hides_new_resources(key.resource_type()) && cache.is_new(key) {
            return false;
        }
        on_add || store.record_is_loaded(key, true)
    }

    /// The live collection of `resource_type`, created on first request from whatever has been staged for the type.
    pub fn live_array_for(&self, resource_type: &str) -> Collection {
        let mut registry = self.registry.borrow_mut();
        if let Some(live) = registry.live.get(resource_type) {
            return live.clone();
        }

        let identifiers: Vec<ResourceKey> = registry
            .staged
            .remove(resource_type)
            .map(|staged| {
                staged
                    .into_iter()
                    .filter(|(_, action)| *action == ChangeAction::Add)
                    .map(|(key, _)| key)
                    .collect()
            })
            .unwrap_or_default();

        debug!("creating live collection for '{resource_type}' with {} key(s)", identifiers.len());
        let id = registry.next_id();
        let live = Collection::new(
            id,
            CollectionKind::Live {
                resource_type: resource_type.to_string(),
            },
            identifiers,
            self.myself.clone(),
        );
        live.0.is_loaded.set(true);
        registry.live.insert(resource_type.to_string(), live.clone());
        live
    }

    /// Creates a managed collection. For [`CollectionConfig::Request`] an existing collection of the same document
    /// is returned instead.
    pub fn get_collection(&self, config: CollectionConfig) -> Collection {
        let mut registry = self.registry.borrow_mut();
        let id = registry.next_id();

        let collection = match config {
            CollectionConfig::Query {
                resource_type,
                query,
                identifiers,
                meta,
                links,
            } => {
                let is_loaded = identifiers.as_ref().is_some_and(|keys| !keys.is_empty());
                let identifiers = identifiers.unwrap_or_default();
                let collection = Collection::new(
                    id,
                    CollectionKind::Query { resource_type, query },
                    identifiers.clone(),
                    self.myself.clone(),
                );
                *collection.0.meta.borrow_mut() = meta;
                *collection.0.links.borrow_mut() = links;
                collection.0.is_loaded.set(is_loaded);
                registry.associate(&collection, &identifiers);
                collection
            }
            CollectionConfig::Source { identifiers } => {
                let collection =
                    Collection::new(id, CollectionKind::Source, identifiers.clone(), self.myself.clone());
                collection.0.is_loaded.set(true);
                registry.associate(&collection, &identifiers);
                collection
            }
            CollectionConfig::Request { document } => {
                if let Some(existing) = registry.requests.get(&document) {
                    return existing.clone();
                }
                let collection = Collection::new(
                    id,
                    CollectionKind::Request {
                        document: document.clone(),
                    },
                    Vec::new(),
                    self.myself.clone(),
                );
                collection.0.should_sync_from_cache.set(true);
                collection.mark_dirty();
                registry.requests.insert(document, collection.clone());
                collection
            }
        };

        registry.managed.insert(collection.clone());
        collection
    }

    /// Replaces the content of a managed collection. Keys that were associated with it and are not part of the new
    /// content are no longer routed to it.
    ///
    /// # Panics
    ///
    /// When called for a live collection.
    pub fn populate_query(
        &self,
        collection: &Collection,
        identifiers: Vec<ResourceKey>,
        meta: Option<Value>,
        links: Option<Value>,
    ) {
        assert!(!collection.is_live(), "Cannot repopulate a live collection");
        self.populate(collection, identifiers, meta, links);
    }

    fn populate(&self, collection: &Collection, identifiers: Vec<ResourceKey>, meta: Option<Value>, links: Option<Value>) {
        let data = &collection.0;
        data.pending.borrow_mut().clear();
        data.should_reset.set(false);
        data.should_sync_from_cache.set(false);

        let mut members = HashSet::with_capacity(identifiers.len());
        let identifiers: Vec<ResourceKey> = identifiers
            .into_iter()
            .filter(|key| members.insert(key.clone()))
            .collect();

        {
            let mut source = data.source.borrow_mut();
            source.clear();
            fast_push(&mut *source, identifiers.clone());
        }
        *data.members.borrow_mut() = members;
        *data.meta.borrow_mut() = meta;
        *data.links.borrow_mut() = links;
        data.is_loaded.set(true);
        collection.bump();

        let mut registry = self.registry.borrow_mut();
        registry.disassociate_all(collection);
        registry.associate(collection, &identifiers);
    }

    /// Brings a dirty collection up to date. Called by the collection's read accessors.
    #[instrument(level = "trace", skip(self))]
    pub(crate) fn sync_array(&self, collection: &Collection) {
        if self.is_destroying() || !collection.0.should_reset.get() {
            return;
        }

        if collection.0.should_sync_from_cache.get() {
            self.sync_from_cache(collection);
            return;
        }

        let changes = std::mem::take(&mut *collection.0.pending.borrow_mut());
        collection.0.should_reset.set(false);
        if changes.is_empty() {
            return;
        }

        let data = &collection.0;
        let mut source = data.source.borrow_mut();
        let mut members = data.members.borrow_mut();
        let mut adds = Vec::new();
        let mut removes = Vec::new();

        for (key, action) in changes {
            match action {
                ChangeAction::Add => {
                    if members.insert(key.clone()) {
                        adds.push(key);
                    }
                }
                ChangeAction::Del => {
                    if members.remove(&key) {
                        removes.push(key);
                    }
                }
            }
        }

        if !removes.is_empty() {
            if removes.len() == source.len() {
                source.clear();
            }
            else {
                for key in &removes {
                    if let Some(index) = source.iter().position(|k| k == key) {
                        source.remove(index);
                    }
                }
            }
        }

        if !adds.is_empty() {
            fast_push(&mut *source, adds);
        }
    }

    fn sync_from_cache(&self, collection: &Collection) {
        let Some(document) = collection.document().cloned()
        else {
            return;
        };
        let Some(store) = self.store()
        else {
            return;
        };
        let Some(cached) = store.cache().peek_request(&document)
        else {
            panic!("Expected to find a cached document for {document}, but the cache has none");
        };
        let identifiers = cached.keys();
        self.populate(collection, identifiers, cached.meta, cached.links);
    }

    fn apply(&self, key: &ResourceKey, action: ChangeAction, include_managed: bool) {
        let mut registry = self.registry.borrow_mut();
        let targets = registry.pending_targets(key, include_managed, action == ChangeAction::Del);

        for target in targets {
            match target {
                PendingTarget::Collection(collection) => {
                    if collection.0.should_sync_from_cache.get() {
                        // Gets fully repopulated on the next read anyway.
                        continue;
                    }
                    if record_change(&mut collection.0.pending.borrow_mut(), key, action) {
                        collection.mark_dirty();
                    }
                }
                PendingTarget::Staged(resource_type) => {
                    record_change(registry.staged.entry(resource_type).or_default(), key, action);
                }
            }
        }
    }

    /// Routes an addition to the live collection of the key's type.
    pub fn identifier_added(&self, key: &ResourceKey) {
        if self.is_destroying() {
            return;
        }
        self.apply(key, ChangeAction::Add, false);
    }

    /// Routes a removal to the live collection of the key's type and to every managed collection the key is
    /// associated with.
    pub fn identifier_removed(&self, key: &ResourceKey) {
        if self.is_destroying() {
            return;
        }
        self.apply(key, ChangeAction::Del, true);
    }

    /// Re-evaluates whether the key is visible and routes a change if that differs from what was last routed.
    pub fn identifier_changed(&self, key: &ResourceKey) {
        if self.is_destroying() {
            return;
        }
        let Some(store) = self.store()
        else {
            return;
        };

        let visible = self.is_visible(&store, key, false);
        let previous = self.registry.borrow_mut().visibility.insert(key.clone(), visible);
        if previous == Some(visible) {
            return;
        }

        trace!("{key} visibility changed to {visible}");
        if visible {
            self.apply(key, ChangeAction::Add, true);
        }
        else {
            self.apply(key, ChangeAction::Del, true);
        }
    }

    /// Forgets everything the manager knows about a key after recording its removal.
    pub(crate) fn disconnect(&self, key: &ResourceKey) {
        if self.is_destroying() {
            return;
        }
        let routed = self.registry.borrow_mut().removed.remove(key);
        if !routed {
            self.identifier_removed(key);
        }

        let mut registry = self.registry.borrow_mut();
        if let Some(collections) = registry.identifiers.remove(key) {
            for collection in collections {
                collection.0.associated.borrow_mut().remove(key);
            }
        }
        registry.visibility.remove(key);
    }

    /// Drops a collection. Called by [`Collection::destroy`].
    pub(crate) fn release(&self, collection: &Collection) {
        {
            let mut registry = self.registry.borrow_mut();
            registry.managed.remove(collection);
            registry.disassociate_all(collection);
            match collection.kind() {
                CollectionKind::Live { resource_type } => {
                    if registry.live.get(resource_type) == Some(collection) {
                        registry.live.remove(resource_type);
                    }
                }
                CollectionKind::Request { document } => {
                    if registry.requests.get(document) == Some(collection) {
                        registry.requests.remove(document);
                    }
                }
                _ => (),
            }
        }
        collection.teardown();
    }

    /// Whether `resource_type` has a live collection yet.
    pub fn has_live_array(&self, resource_type: &str) -> bool {
        self.registry.borrow().live.contains_key(resource_type)
    }

    /// Net additions staged for a type whose live collection hasn't been requested.
    pub fn staged_for(&self, resource_type: &str) -> Vec<(ResourceKey, ChangeAction)> {
        self.registry
            .borrow()
            .staged
            .get(resource_type)
            .map(|staged| staged.iter().map(|(k, a)| (k.clone(), *a)).collect())
            .unwrap_or_default()
    }

    /// Managed collections `key` is routed to.
    pub fn collections_of(&self, key: &ResourceKey) -> Vec<Collection> {
        self.registry
            .borrow()
            .identifiers
            .get(key)
            .map(|collections| collections.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Tears down every collection and stops listening. Idempotent.
    pub fn destroy(&self) {
        if self.destroying.replace(true) {
            return;
        }

        let registry = std::mem::take(&mut *self.registry.borrow_mut());
        for collection in registry.live.values().chain(registry.managed.iter()) {
            collection.teardown();
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        if let Some(store) = self.store() {
            for token in subscriptions {
                if store.notifications().is_subscribed(token) {
                    store.notifications().unsubscribe(token);
                }
            }
        }

        self.destroyed.set(true);
    }
}
