//! Stable identity tokens for resources and request documents.
//!
//! Every other component addresses resources only through a [`ResourceKey`]. Keys compare by reference: two keys are
//! equal only when they are clones of the same token. This is what allows a client-created resource to receive its
//! server id later without invalidating references held by collections or subscribers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;
use std::rc::Rc;

use tracing::trace;

struct ResourceKeyData {
    resource_type: String,
    id:            RefCell<Option<String>>,
    lid:           String,
    client_id:     u64,
}

/// Opaque, reference-equal identity of one logical resource.
#[derive(Clone)]
pub struct ResourceKey(Rc<ResourceKeyData>);

impl ResourceKey {
    fn new(resource_type: &str, id: Option<&str>, lid: String, client_id: u64) -> Self {
        Self(Rc::new(ResourceKeyData {
            resource_type: resource_type.to_string(),
            id: RefCell::new(id.map(String::from)),
            lid,
            client_id,
        }))
    }

    pub fn resource_type(&self) -> &str {
        &self.0.resource_type
    }

    /// The persisted primary key, if the resource has one yet.
    pub fn id(&self) -> Option<String> {
        self.0.id.borrow().clone()
    }

    pub fn has_id(&self) -> bool {
        self.0.id.borrow().is_some()
    }

    /// Locally unique id. Never changes for the lifetime of the token.
    pub fn lid(&self) -> &str {
        &self.0.lid
    }

    /// Sequence number assigned by the issuing [`IdentifierCache`].
    pub fn client_id(&self) -> u64 {
        self.0.client_id
    }

    fn set_id(&self, id: &str) {
        *self.0.id.borrow_mut() = Some(id.to_string());
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ResourceKey {}

impl Hash for ResourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.lid.hash(state);
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.id.borrow().as_deref() {
            Some(id) => write!(f, "Record<{}:{} ({})>", self.0.resource_type, id, self.0.lid),
            None => write!(f, "Record<{}:null ({})>", self.0.resource_type, self.0.lid),
        }
    }
}

impl Debug for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceKey")
            .field("type", &self.0.resource_type)
            .field("id", &*self.0.id.borrow())
            .field("lid", &self.0.lid)
            .finish()
    }
}

/// Opaque, reference-equal identity of one cached request result.
#[derive(Clone)]
pub struct DocumentKey(Rc<String>);

impl DocumentKey {
    pub fn lid(&self) -> &str {
        &self.0
    }
}

impl PartialEq for DocumentKey {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DocumentKey {}

impl Hash for DocumentKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Document<{}>", self.0)
    }
}

impl Debug for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DocumentKey").field(&*self.0).finish()
    }
}

#[derive(Default)]
struct IdentifierIndex {
    lids:        HashMap<String, ResourceKey>,
    by_type:     HashMap<String, HashMap<String, ResourceKey>>,
    documents:   HashMap<String, DocumentKey>,
    next_client: u64,
}

impl IdentifierIndex {
    fn generate_lid(&mut self, resource_type: &str, id: Option<&str>) -> String {
        let lid = match id {
            Some(id) => format!("@lid:{resource_type}-{id}"),
            None => format!("@lid:new:{resource_type}-{}", self.next_client),
        };
        if self.lids.contains_key(&lid) {
            format!("{lid}~{}", self.next_client)
        }
        else {
            lid
        }
    }

    fn assign_id(&mut self, key: &ResourceKey, id: &str) {
        if let Some(current) = key.id() {
            assert!(
                current == id,
                "Cannot update the id of {key} to '{id}': an id has already been assigned"
            );
            return;
        }

        let by_id = self.by_type.entry(key.resource_type().to_string()).or_default();
        if let Some(existing) = by_id.get(id) {
            assert!(
                existing == key,
                "'{}' was given the id '{id}' which is already used by {existing}",
                key.resource_type()
            );
        }

        key.set_id(id);
        by_id.insert(id.to_string(), key.clone());
    }
}

/// Issues and retains one [`ResourceKey`] per `(type, id)` or local id, and one [`DocumentKey`] per request.
#[derive(Default)]
pub struct IdentifierCache {
    index: RefCell<IdentifierIndex>,
}

impl IdentifierCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the key for the given resource coordinates, creating one on first reference.
    ///
    /// A known `lid` wins over the `(type, id)` pair. When the resource behind a known `lid` has no id yet and `id`
    /// is provided, the key is promoted in place.
    pub fn get_or_create(&self, resource_type: &str, id: Option<&str>, lid: Option<&str>) -> ResourceKey {
        let mut index = self.index.borrow_mut();

        if let Some(key) = lid.and_then(|lid| index.lids.get(lid).cloned()) {
            assert!(
                key.resource_type() == resource_type,
                "The lid '{}' belongs to {key}, not to type '{resource_type}'",
                key.lid()
            );
            if let Some(id) = id {
                index.assign_id(&key, id);
            }
            return key;
        }

        if let Some(key) = id.and_then(|id| index.by_type.get(resource_type).and_then(|by_id| by_id.get(id))) {
            return key.clone();
        }

        let lid = lid.map_or_else(|| index.generate_lid(resource_type, id), String::from);
        let client_id = index.next_client;
        index.next_client += 1;

        let key = ResourceKey::new(resource_type, id, lid, client_id);
        index.lids.insert(key.lid().to_string(), key.clone());
        if let Some(id) = id {
            index
                .by_type
                .entry(resource_type.to_string())
                .or_default()
                .insert(id.to_string(), key.clone());
        }

        trace!("issued {key}");
        key
    }

    /// Issues a key for a resource created on the client. It never matches an existing one.
    pub fn create_for_new(&self, resource_type: &str) -> ResourceKey {
        self.get_or_create(resource_type, None, None)
    }

    pub fn peek(&self, resource_type: &str, id: &str) -> Option<ResourceKey> {
        self.index
            .borrow()
            .by_type
            .get(resource_type)
            .and_then(|by_id| by_id.get(id))
            .cloned()
    }

    pub fn peek_lid(&self, lid: &str) -> Option<ResourceKey> {
        self.index.borrow().lids.get(lid).cloned()
    }

    /// Promotes a key to a persisted id.
    ///
    /// # Panics
    ///
    /// If the key already has a different id, or if another key already owns `(type, id)`.
    pub fn update_id(&self, key: &ResourceKey, id: &str) {
        self.index.borrow_mut().assign_id(key, id);
    }

    /// Detaches the key from the identity maps. A later lookup of the same coordinates issues a fresh token.
    pub fn forget(&self, key: &ResourceKey) -> bool {
        let mut index = self.index.borrow_mut();
        if !index.lids.get(key.lid()).is_some_and(|k| k == key) {
            return false;
        }
        index.lids.remove(key.lid());
        if let Some(id) = key.id() {
            if let Some(by_id) = index.by_type.get_mut(key.resource_type()) {
                by_id.remove(&id);
            }
        }
        trace!("forgot {key}");
        true
    }

    /// A key is stable while it is the one the cache hands out for its `lid`.
    pub fn is_stable(&self, key: &ResourceKey) -> bool {
        self.index.borrow().lids.get(key.lid()).is_some_and(|k| k == key)
    }

    pub fn document(&self, lid: &str) -> DocumentKey {
        self.index
            .borrow_mut()
            .documents
            .entry(lid.to_string())
            .or_insert_with(|| DocumentKey(Rc::new(lid.to_string())))
            .clone()
    }

    pub fn peek_document(&self, lid: &str) -> Option<DocumentKey> {
        self.index.borrow().documents.get(lid).cloned()
    }

    pub fn is_stable_document(&self, key: &DocumentKey) -> bool {
        self.index.borrow().documents.get(key.lid()).is_some_and(|k| k == key)
    }

    pub fn len(&self) -> usize {
        self.index.borrow().lids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut index = self.index.borrow_mut();
        index.lids.clear();
        index.by_type.clear();
        index.documents.clear();
    }
}
