//! In-memory storage backend.
//!
//! Keeps three layers of attributes per resource: what the server last confirmed, what is being committed, and local
//! edits. Reads see the topmost layer that has the field.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;

use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::instrument;

use crate::capabilities::CacheCapabilities;
use crate::document::ApiError;
use crate::document::CachedDocument;
use crate::document::DocumentData;
use crate::document::JsonApiDocument;
use crate::document::Linkage;
use crate::document::PrimaryData;
use crate::document::RelationshipObject;
use crate::document::RelationshipOperation;
use crate::document::RelationshipState;
use crate::document::RelationshipValue;
use crate::document::ResourceIdentifierObject;
use crate::document::ResourceObject;
use crate::error::Result;
use crate::error::StoreError;
use crate::identifier::DocumentKey;
use crate::identifier::ResourceKey;
use crate::traits::Cache;
use crate::types::Identifier;
use crate::types::Operation;

type Event = (Identifier, Operation, Option<String>);

// Relationship payload resolved to keys. `data` is `None` when the payload carried no linkage.
struct IncomingRelationship {
    data:  Option<RelationshipValue>,
    meta:  Option<Value>,
    links: Option<Value>,
}

struct Incoming {
    attributes:    Map<String, Value>,
    relationships: Vec<(String, IncomingRelationship)>,
    meta:          Option<Value>,
}

#[derive(Default)]
struct CachedResource {
    loaded:                bool,
    remote_attrs:          Map<String, Value>,
    in_flight_attrs:       Map<String, Value>,
    local_attrs:           Map<String, Value>,
    relationships:         BTreeMap<String, RelationshipState>,
    meta:                  Option<Value>,
    is_new:                bool,
    is_deleted:            bool,
    is_deletion_committed: bool,
    in_flight:             bool,
    errors:                Vec<ApiError>,
}

impl CachedResource {
    fn attr(&self, field: &str) -> Option<&Value> {
        self.local_attrs
            .get(field)
            .or_else(|| self.in_flight_attrs.get(field))
            .or_else(|| self.remote_attrs.get(field))
    }

    // Merges server data. Returns the names of the fields that changed.
    fn merge(&mut self, key: &ResourceKey, incoming: Incoming, events: &mut Vec<Event>) -> Vec<String> {
        let added = !self.loaded;
        self.loaded = true;

        let mut changed_attrs = Vec::new();
        for (name, value) in incoming.attributes {
            if self.remote_attrs.get(&name) != Some(&value) {
                changed_attrs.push(name.clone());
                self.remote_attrs.insert(name, value);
            }
        }

        let mut changed_relationships = Vec::new();
        for (name, incoming) in incoming.relationships {
            let previous = self.relationships.get(&name);
            let next = RelationshipState {
                data:  incoming.data.or_else(|| previous.and_then(|p| p.data.clone())),
                meta:  incoming.meta.or_else(|| previous.and_then(|p| p.meta.clone())),
                links: incoming.links.or_else(|| previous.and_then(|p| p.links.clone())),
            };
            if previous != Some(&next) {
                changed_relationships.push(name.clone());
                self.relationships.insert(name, next);
            }
        }

        if incoming.meta.is_some() {
            self.meta = incoming.meta;
        }

        if added {
            events.push((key.into(), Operation::Added, None));
        }
        else {
            for name in &changed_attrs {
                events.push((key.into(), Operation::Attributes, Some(name.clone())));
            }
            for name in &changed_relationships {
                events.push((key.into(), Operation::Relationships, Some(name.clone())));
            }
        }

        changed_attrs.extend(changed_relationships);
        changed_attrs
    }
}

#[derive(Default)]
struct MemoryState {
    resources:   HashMap<ResourceKey, CachedResource>,
    documents:   HashMap<DocumentKey, CachedDocument>,
    invalidated: HashSet<DocumentKey>,
}

impl MemoryState {
    fn loaded_mut(&mut self, key: &ResourceKey) -> Result<&mut CachedResource> {
        self.resources
            .get_mut(key)
            .filter(|entry| entry.loaded)
            .ok_or_else(|| StoreError::MissingResource(key.to_string()))
    }

    fn loaded(&self, key: &ResourceKey) -> Result<&CachedResource> {
        self.resources
            .get(key)
            .filter(|entry| entry.loaded)
            .ok_or_else(|| StoreError::MissingResource(key.to_string()))
    }
}

/// A complete [`Cache`] keeping everything in process memory.
pub struct MemoryCache {
    capabilities: Rc<CacheCapabilities>,
    state:        RefCell<MemoryState>,
}

impl MemoryCache {
    pub fn new(capabilities: Rc<CacheCapabilities>) -> Self {
        Self {
            capabilities,
            state: RefCell::new(MemoryState::default()),
        }
    }

    pub fn capabilities(&self) -> &Rc<CacheCapabilities> {
        &self.capabilities
    }

    /// Number of resources with data.
    pub fn resource_count(&self) -> usize {
        self.state.borrow().resources.values().filter(|r| r.loaded).count()
    }

    pub fn is_invalidated(&self, request: &DocumentKey) -> bool {
        self.state.borrow().invalidated.contains(request)
    }

    fn emit(&self, events: Vec<Event>) {
        for (target, operation, sub_key) in events {
            self.capabilities.notify_change(target, operation, sub_key.as_deref());
        }
    }

    fn resolve(&self, resource_type: &str, id: Option<&str>, lid: Option<&str>) -> Result<ResourceKey> {
        if id.is_none() && lid.is_none() {
            return Err(StoreError::InvalidDocument(format!(
                "a '{resource_type}' resource has neither id nor lid"
            )));
        }
        Ok(self.capabilities.identifier_for(resource_type, id, lid))
    }

    fn resolve_linkage(&self, rio: &ResourceIdentifierObject) -> Result<ResourceKey> {
        self.resolve(&rio.resource_type, rio.id.as_deref(), rio.lid.as_deref())
    }

    fn normalize_relationship(&self, relationship: RelationshipObject) -> Result<IncomingRelationship> {
        let data = if relationship.has_data || relationship.data.is_some() {
            Some(match &relationship.data {
                None => RelationshipValue::One(None),
                Some(Linkage::One(rio)) => RelationshipValue::One(Some(self.resolve_linkage(rio)?)),
                Some(Linkage::Many(list)) => RelationshipValue::Many(
                    list.iter()
                        .map(|rio| self.resolve_linkage(rio))
                        .collect::<Result<Vec<_>>>()?,
                ),
            })
        }
        else {
            None
        };

        Ok(IncomingRelationship {
            data,
            meta: relationship.meta,
            links: relationship.links,
        })
    }

    fn normalize(&self, resource: ResourceObject) -> Result<Incoming> {
        let relationships = resource
            .relationships
            .into_iter()
            .map(|(name, relationship)| Ok((name, self.normalize_relationship(relationship)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Incoming {
            attributes: resource.attributes,
            relationships,
            meta: resource.meta,
        })
    }

    fn ingest(&self, key: &ResourceKey, resource: ResourceObject, events: &mut Vec<Event>) -> Result<Vec<String>> {
        let incoming = self.normalize(resource)?;
        let mut state = self.state.borrow_mut();
        Ok(state
            .resources
            .entry(key.clone())
            .or_default()
            .merge(key, incoming, events))
    }

    fn ingest_resource(&self, resource: ResourceObject, events: &mut Vec<Event>) -> Result<ResourceKey> {
        let key = self.resolve(&resource.resource_type, resource.id.as_deref(), resource.lid.as_deref())?;
        self.ingest(&key, resource, events)?;
        Ok(key)
    }

    fn put_inner(
        &self,
        document: JsonApiDocument,
        request: Option<&DocumentKey>,
        events: &mut Vec<Event>,
    ) -> Result<CachedDocument> {
        let JsonApiDocument {
            data,
            included,
            meta,
            links,
        } = document;

        for resource in included {
            self.ingest_resource(resource, events)?;
        }

        let data = match data {
            None => None,
            Some(PrimaryData::One(resource)) => Some(DocumentData::One(Some(self.ingest_resource(resource, events)?))),
            Some(PrimaryData::Many(resources)) => Some(DocumentData::Many(
                resources
                    .into_iter()
                    .map(|resource| self.ingest_resource(resource, events))
                    .collect::<Result<Vec<_>>>()?,
            )),
        };

        let cached = CachedDocument { data, meta, links };

        if let Some(request) = request {
            let mut state = self.state.borrow_mut();
            state.invalidated.remove(request);
            let operation = if state.documents.insert(request.clone(), cached.clone()).is_some() {
                Operation::Updated
            }
            else {
                Operation::Added
            };
            events.push((request.into(), operation, None));
        }

        Ok(cached)
    }
}

impl Cache for MemoryCache {
    #[instrument(level = "trace", skip(self, document))]
    fn put(&self, document: JsonApiDocument, request: Option<&DocumentKey>) -> Result<CachedDocument> {
        let mut events = Vec::new();
        let result = self.put_inner(document, request, &mut events);
        // Whatever got ingested before a failure is reported all the same.
        self.emit(events);
        result
    }

    fn upsert(&self, key: &ResourceKey, data: ResourceObject, calculate_changes: bool) -> Result<Option<Vec<String>>> {
        let mut events = Vec::new();
        let changed = self.ingest(key, data, &mut events)?;
        self.emit(events);
        Ok(calculate_changes.then_some(changed))
    }

    fn peek(&self, key: &ResourceKey) -> Option<ResourceObject> {
        let state = self.state.borrow();
        let entry = state.loaded(key).ok()?;

        let mut attributes = entry.remote_attrs.clone();
        attributes.extend(entry.in_flight_attrs.clone());
        attributes.extend(entry.local_attrs.clone());

        let linkage = |key: &ResourceKey| ResourceIdentifierObject {
            resource_type: key.resource_type().to_string(),
            id:            key.id(),
            lid:           Some(key.lid().to_string()),
        };
        let relationships = entry
            .relationships
            .iter()
            .map(|(name, relationship)| {
                let data = match &relationship.data {
                    Some(RelationshipValue::One(Some(key))) => Some(Linkage::One(linkage(key))),
                    Some(RelationshipValue::Many(keys)) => Some(Linkage::Many(keys.iter().map(linkage).collect())),
                    _ => None,
                };
                (
                    name.clone(),
                    RelationshipObject {
                        data,
                        meta: relationship.meta.clone(),
                        links: relationship.links.clone(),
                        has_data: relationship.data.is_some(),
                    },
                )
            })
            .collect();

        Some(ResourceObject {
            resource_type: key.resource_type().to_string(),
            id: key.id(),
            lid: Some(key.lid().to_string()),
            attributes,
            relationships,
            meta: entry.meta.clone(),
        })
    }

    fn peek_request(&self, request: &DocumentKey) -> Option<CachedDocument> {
        self.state.borrow().documents.get(request).cloned()
    }

    fn get_attr(&self, key: &ResourceKey, field: &str) -> Result<Option<Value>> {
        Ok(self.state.borrow().loaded(key)?.attr(field).cloned())
    }

    fn set_attr(&self, key: &ResourceKey, field: &str, value: Value) -> Result<()> {
        let changed = {
            let mut state = self.state.borrow_mut();
            let entry = state.loaded_mut(key)?;
            let current = entry.attr(field).cloned();

            let reverts = entry
                .in_flight_attrs
                .get(field)
                .or_else(|| entry.remote_attrs.get(field))
                == Some(&value);
            if reverts {
                entry.local_attrs.remove(field);
            }
            else {
                entry.local_attrs.insert(field.to_string(), value);
            }

            entry.attr(field) != current.as_ref()
        };

        if changed {
            self.capabilities.notify_change(key, Operation::Attributes, Some(field));
        }
        Ok(())
    }

    fn get_relationship(&self, key: &ResourceKey, field: &str) -> Result<Option<RelationshipState>> {
        Ok(self.state.borrow().loaded(key)?.relationships.get(field).cloned())
    }

    fn client_did_create(&self, key: &ResourceKey, attributes: Map<String, Value>) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let entry = state.resources.entry(key.clone()).or_default();
            entry.loaded = true;
            entry.is_new = true;
            entry.local_attrs = attributes;
        }
        debug!("{key} created locally");
        self.capabilities.notify_change(key, Operation::Added, None);
        Ok(())
    }

    fn will_commit(&self, key: &ResourceKey) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let entry = state.loaded_mut(key)?;
            entry.in_flight = true;
            let local = std::mem::take(&mut entry.local_attrs);
            entry.in_flight_attrs.extend(local);
        }
        self.capabilities.notify_change(key, Operation::State, None);
        Ok(())
    }

    #[instrument(level = "trace", skip(self, data))]
    fn did_commit(&self, key: &ResourceKey, data: Option<ResourceObject>) -> Result<()> {
        self.state.borrow().loaded(key)?;
        let id = data.as_ref().and_then(|d| d.id.clone());
        let incoming = data.map(|data| self.normalize(data)).transpose()?;
        if let Some(id) = id {
            self.capabilities.set_record_id(key, &id);
        }

        let mut events: Vec<Event> = vec![(key.into(), Operation::State, None)];
        {
            let mut state = self.state.borrow_mut();
            let entry = state.loaded_mut(key)?;
            entry.is_new = false;
            entry.in_flight = false;
            entry.errors.clear();
            let committed = std::mem::take(&mut entry.in_flight_attrs);
            entry.remote_attrs.extend(committed);
            if entry.is_deleted {
                entry.is_deletion_committed = true;
            }
            if let Some(incoming) = incoming {
                entry.merge(key, incoming, &mut events);
            }
        }
        self.emit(events);
        Ok(())
    }

    fn commit_was_rejected(&self, key: &ResourceKey, errors: Vec<ApiError>) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let entry = state.loaded_mut(key)?;
            entry.in_flight = false;
            // Edits made while the commit was in flight take precedence.
            for (name, value) in std::mem::take(&mut entry.in_flight_attrs) {
                entry.local_attrs.entry(name).or_insert(value);
            }
            entry.errors = errors;
        }
        self.emit(vec![
            (key.into(), Operation::State, None),
            (key.into(), Operation::Errors, None),
        ]);
        Ok(())
    }

    fn unload_record(&self, key: &ResourceKey) -> Result<()> {
        let had_data = {
            let mut state = self.state.borrow_mut();
            let removed = state.resources.remove(key);
            for document in state.documents.values_mut() {
                match &mut document.data {
                    Some(DocumentData::Many(keys)) => keys.retain(|k| k != key),
                    Some(DocumentData::One(one)) if one.as_ref() == Some(key) => *one = None,
                    _ => (),
                }
            }
            removed.is_some_and(|r| r.loaded)
        };

        debug!("unloading {key}");
        if had_data {
            self.capabilities.notify_change(key, Operation::Removed, None);
        }
        self.capabilities.disconnect_record(key);
        Ok(())
    }

    fn set_is_deleted(&self, key: &ResourceKey, is_deleted: bool) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let entry = state.loaded_mut(key)?;
            entry.is_deleted = is_deleted;
            if !is_deleted {
                entry.is_deletion_committed = false;
            }
        }
        self.capabilities.notify_change(key, Operation::State, None);
        Ok(())
    }

    fn is_new(&self, key: &ResourceKey) -> bool {
        self.state.borrow().resources.get(key).is_some_and(|r| r.is_new)
    }

    fn is_deleted(&self, key: &ResourceKey) -> bool {
        self.state.borrow().resources.get(key).is_some_and(|r| r.is_deleted)
    }

    fn is_deletion_committed(&self, key: &ResourceKey) -> bool {
        self.state
            .borrow()
            .resources
            .get(key)
            .is_some_and(|r| r.is_deletion_committed)
    }

    fn is_empty(&self, key: &ResourceKey) -> bool {
        !self.state.borrow().resources.get(key).is_some_and(|r| r.loaded)
    }

    fn mutate_relationship(&self, operation: RelationshipOperation) -> Result<()> {
        let record = operation.record().clone();
        let field = operation.field().to_string();
        {
            let mut state = self.state.borrow_mut();
            let entry = state.loaded_mut(&record)?;
            let relationship = entry
                .relationships
                .entry(field.clone())
                .or_insert_with(|| RelationshipState {
                    data:  None,
                    meta:  None,
                    links: None,
                });

            match operation {
                RelationshipOperation::Replace { value, .. } => relationship.data = Some(value),
                RelationshipOperation::Add { value, index, .. } => {
                    if relationship.data.is_none() {
                        relationship.data = Some(RelationshipValue::Many(Vec::new()));
                    }
                    let Some(RelationshipValue::Many(list)) = &mut relationship.data
                    else {
                        return Err(StoreError::InvalidOperation(format!(
                            "cannot add to '{field}' of {record}: it is a to-one relationship"
                        )));
                    };
                    let mut at = index.unwrap_or(list.len()).min(list.len());
                    for key in value {
                        if !list.contains(&key) {
                            list.insert(at, key);
                            at += 1;
                        }
                    }
                }
                RelationshipOperation::Remove { value, .. } => match &mut relationship.data {
                    Some(RelationshipValue::Many(list)) => list.retain(|k| !value.contains(k)),
                    Some(RelationshipValue::One(one)) => {
                        if one.as_ref().is_some_and(|k| value.contains(k)) {
                            *one = None;
                        }
                    }
                    None => (),
                },
            }
        }

        self.capabilities
            .notify_change(&record, Operation::Relationships, Some(&field));
        Ok(())
    }

    fn changed_attributes(&self, key: &ResourceKey) -> Result<Map<String, Value>> {
        let state = self.state.borrow();
        let entry = state.loaded(key)?;
        let mut changed = entry.in_flight_attrs.clone();
        changed.extend(entry.local_attrs.clone());
        Ok(changed)
    }

    fn rollback_attributes(&self, key: &ResourceKey) -> Result<Vec<String>> {
        let reverted: Vec<String> = {
            let mut state = self.state.borrow_mut();
            let entry = state.loaded_mut(key)?;
            entry.errors.clear();
            std::mem::take(&mut entry.local_attrs).into_iter().map(|(name, _)| name).collect()
        };
        for name in &reverted {
            self.capabilities.notify_change(key, Operation::Attributes, Some(name));
        }
        Ok(reverted)
    }

    fn errors(&self, key: &ResourceKey) -> Result<Vec<ApiError>> {
        Ok(self.state.borrow().loaded(key)?.errors.clone())
    }

    fn invalidate_request(&self, request: &DocumentKey) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if !state.documents.contains_key(request) {
                return Err(StoreError::UnknownDocument(request.lid().to_string()));
            }
            state.invalidated.insert(request.clone());
        }
        self.capabilities.notify_change(request, Operation::Invalidated, None);
        Ok(())
    }
}
