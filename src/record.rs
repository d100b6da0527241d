use std::fmt::Debug;
use std::rc::Rc;
use std::rc::Weak;

use serde_json::Map;
use serde_json::Value;

use crate::document::ApiError;
use crate::document::RelationshipState;
use crate::error::Result;
use crate::error::StoreError;
use crate::identifier::ResourceKey;
use crate::store::Store;

/// Materialized view of a resource. Reads and writes go straight through to the store's backend.
#[derive(Clone)]
pub struct Record {
    key:   ResourceKey,
    store: Weak<Store>,
}

impl Record {
    pub(crate) fn new(key: ResourceKey, store: Weak<Store>) -> Self {
        Self { key, store }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn id(&self) -> Option<String> {
        self.key.id()
    }

    pub fn resource_type(&self) -> &str {
        self.key.resource_type()
    }

    fn store(&self) -> Result<Rc<Store>> {
        self.store
            .upgrade()
            .ok_or_else(|| StoreError::Detached(self.key.to_string()))
    }

    pub fn attr(&self, field: &str) -> Result<Option<Value>> {
        self.store()?.cache().get_attr(&self.key, field)
    }

    pub fn set_attr(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let store = self.store()?;
        let value = value.into();
        store.join(|| store.cache().set_attr(&self.key, field, value))
    }

    pub fn relationship(&self, field: &str) -> Result<Option<RelationshipState>> {
        self.store()?.cache().get_relationship(&self.key, field)
    }

    pub fn changed_attributes(&self) -> Result<Map<String, Value>> {
        self.store()?.cache().changed_attributes(&self.key)
    }

    pub fn rollback_attributes(&self) -> Result<Vec<String>> {
        let store = self.store()?;
        store.join(|| store.cache().rollback_attributes(&self.key))
    }

    pub fn errors(&self) -> Result<Vec<ApiError>> {
        self.store()?.cache().errors(&self.key)
    }

    pub fn is_new(&self) -> Result<bool> {
        Ok(self.store()?.cache().is_new(&self.key))
    }

    pub fn is_deleted(&self) -> Result<bool> {
        Ok(self.store()?.cache().is_deleted(&self.key))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.store.ptr_eq(&other.store)
    }
}

impl Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Record").field(&self.key).finish()
    }
}
