//! The handle a storage backend gets to call back into its store.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use indexmap::IndexMap;
use indexmap::IndexSet;
use tracing::debug;

use crate::identifier::DocumentKey;
use crate::identifier::IdentifierCache;
use crate::identifier::ResourceKey;
use crate::store::Store;
use crate::traits::Schema;
use crate::types::Identifier;
use crate::types::Operation;

pub struct CacheCapabilities {
    store:       Weak<Store>,
    identifiers: Rc<IdentifierCache>,
    // Relationship changes waiting for the end of the current batch, deduplicated per key and field.
    pending:     RefCell<IndexMap<ResourceKey, IndexSet<String>>>,
    will_notify: Cell<bool>,
}

impl CacheCapabilities {
    pub(crate) fn new(store: Weak<Store>, identifiers: Rc<IdentifierCache>) -> Self {
        Self {
            store,
            identifiers,
            pending: RefCell::new(IndexMap::new()),
            will_notify: Cell::new(false),
        }
    }

    fn store(&self) -> Option<Rc<Store>> {
        self.store.upgrade().filter(|store| !store.is_destroyed())
    }

    /// Reports a change made by the backend.
    ///
    /// Field-level relationship changes are collected and delivered once per key and field: at the end of the
    /// current store batch, or right away when there is no batch. Anything else goes straight to the notification
    /// manager.
    pub fn notify_change(&self, target: impl Into<Identifier>, operation: Operation, sub_key: Option<&str>) {
        let Some(store) = self.store()
        else {
            return;
        };
        let target = target.into();

        if let (Identifier::Resource(key), Operation::Relationships, Some(field)) = (&target, operation, sub_key) {
            self.schedule_relationship(&store, key, field);
            return;
        }

        store.notifications().notify(target, operation, sub_key);
    }

    fn schedule_relationship(&self, store: &Store, key: &ResourceKey, field: &str) {
        self.pending
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .insert(field.to_string());

        if self.will_notify.replace(true) {
            return;
        }

        let weak = self.store.clone();
        let task: Box<dyn FnOnce()> = Box::new(move || {
            if let Some(store) = weak.upgrade() {
                store.capabilities().flush_notifications();
            }
        });
        if let Err(task) = store.queue().schedule(task) {
            task();
        }
    }

    /// Delivers collected relationship changes.
    pub fn flush_notifications(&self) {
        if !self.will_notify.replace(false) {
            return;
        }
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let Some(store) = self.store()
        else {
            return;
        };

        for (key, fields) in pending {
            for field in fields {
                store
                    .notifications()
                    .notify(&key, Operation::Relationships, Some(field.as_str()));
            }
        }
    }

    /// Assigns the persisted id to a resource that had none.
    ///
    /// # Panics
    ///
    /// If the resource already has a different id or if another resource already uses `id`.
    pub fn set_record_id(&self, key: &ResourceKey, id: &str) {
        if key.id().as_deref() == Some(id) {
            return;
        }
        debug!("assigning id '{id}' to {key}");
        self.identifiers.update_id(key, id);
        if let Some(store) = self.store() {
            store.notifications().notify(key, Operation::Identity, None);
        }
    }

    /// Whether a record handle has been materialized for the key.
    pub fn has_record(&self, key: &ResourceKey) -> bool {
        self.store().is_some_and(|store| store.has_record(key))
    }

    /// Tears the resource down on the store's side. Pending relationship changes of the key are discarded.
    pub fn disconnect_record(&self, key: &ResourceKey) {
        self.pending.borrow_mut().shift_remove(key);
        if let Some(store) = self.store.upgrade() {
            store.disconnect(key);
        }
    }

    /// Resolves raw resource coordinates into a key, creating it on first reference.
    pub fn identifier_for(&self, resource_type: &str, id: Option<&str>, lid: Option<&str>) -> ResourceKey {
        self.identifiers.get_or_create(resource_type, id, lid)
    }

    pub fn document_identifier(&self, lid: &str) -> DocumentKey {
        self.identifiers.document(lid)
    }

    /// The store's schema. `None` once the store is gone.
    pub fn schema(&self) -> Option<Rc<dyn Schema>> {
        self.store.upgrade().map(|store| store.schema().clone())
    }

    pub fn is_stable(&self, key: &ResourceKey) -> bool {
        self.identifiers.is_stable(key)
    }

    pub fn has_pending_notifications(&self) -> bool {
        !self.pending.borrow().is_empty()
    }
}
