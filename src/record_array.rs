//! Ordered, deduplicated lists of resource keys kept up to date by the
//! [`RecordArrayManager`](crate::record_array_manager::RecordArrayManager).
//!
//! A collection doesn't apply changes as they arrive. The manager records them in the collection's pending changeset
//! and marks it dirty; the next read brings the sequence up to date.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::hash::Hasher;
use std::rc::Rc;
use std::rc::Weak;

use indexmap::IndexMap;
use serde_json::Value;

use crate::identifier::DocumentKey;
use crate::identifier::ResourceKey;
use crate::record_array_manager::RecordArrayManager;
use crate::types::ChangeAction;

/// Appends are done in slices of at most this many keys.
pub const SLICE_BATCH_SIZE: usize = 4761;

pub(crate) type ChangeSet = IndexMap<ResourceKey, ChangeAction>;

/// Appends `source` to `target` in slices of [`SLICE_BATCH_SIZE`].
pub fn fast_push<T>(target: &mut Vec<T>, source: Vec<T>) {
    fast_push_batched(target, source, SLICE_BATCH_SIZE);
}

pub(crate) fn fast_push_batched<T>(target: &mut Vec<T>, source: Vec<T>, batch: usize) {
    target.reserve(source.len());
    let mut source = source.into_iter().peekable();
    while source.peek().is_some() {
        target.extend(source.by_ref().take(batch));
    }
}

/// Records `action` for `key`. An opposite pending action cancels out; the key is then no longer pending at all.
/// Returns `false` in that case.
pub(crate) fn record_change(changes: &mut ChangeSet, key: &ResourceKey, action: ChangeAction) -> bool {
    match changes.get(key) {
        Some(pending) if *pending != action => {
            changes.shift_remove(key);
            false
        }
        _ => {
            changes.insert(key.clone(), action);
            true
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionKind {
    /// All loaded resources of a type.
    Live { resource_type: String },
    /// Result of a query, maintained by the caller.
    Query {
        resource_type: String,
        query:         Option<Value>,
    },
    /// Caller-supplied list of keys.
    Source,
    /// Mirrors the primary data of a cached request document.
    Request { document: DocumentKey },
}

pub(crate) struct CollectionData {
    pub(crate) id:       u64,
    pub(crate) kind:     CollectionKind,
    pub(crate) source:   RefCell<Vec<ResourceKey>>,
    pub(crate) members:  RefCell<HashSet<ResourceKey>>,
    pub(crate) pending:  RefCell<ChangeSet>,
    // Keys whose removal and re-addition are routed to this collection. Not necessarily members.
    pub(crate) associated: RefCell<HashSet<ResourceKey>>,

    pub(crate) version:                Cell<u64>,
    pub(crate) should_reset:           Cell<bool>,
    pub(crate) should_sync_from_cache: Cell<bool>,

    pub(crate) meta:      RefCell<Option<Value>>,
    pub(crate) links:     RefCell<Option<Value>>,
    pub(crate) is_loaded: Cell<bool>,
    pub(crate) destroyed: Cell<bool>,

    pub(crate) manager: Weak<RecordArrayManager>,
}

/// Shared handle to a collection. Clones refer to the same collection.
#[derive(Clone)]
pub struct Collection(pub(crate) Rc<CollectionData>);

impl Collection {
    pub(crate) fn new(
        id: u64,
        kind: CollectionKind,
        identifiers: Vec<ResourceKey>,
        manager: Weak<RecordArrayManager>,
    ) -> Self {
        let mut source = Vec::with_capacity(identifiers.len());
        let mut members = HashSet::with_capacity(identifiers.len());
        for key in identifiers {
            if members.insert(key.clone()) {
                source.push(key);
            }
        }

        Self(Rc::new(CollectionData {
            id,
            kind,
            source: RefCell::new(source),
            members: RefCell::new(members),
            pending: RefCell::new(ChangeSet::new()),
            associated: RefCell::new(HashSet::new()),
            version: Cell::new(0),
            should_reset: Cell::new(false),
            should_sync_from_cache: Cell::new(false),
            meta: RefCell::new(None),
            links: RefCell::new(None),
            is_loaded: Cell::new(false),
            destroyed: Cell::new(false),
            manager,
        }))
    }

    pub fn kind(&self) -> &CollectionKind {
        &self.0.kind
    }

    pub fn resource_type(&self) -> Option<&str> {
        match &self.0.kind {
            CollectionKind::Live { resource_type } | CollectionKind::Query { resource_type, .. } => {
                Some(resource_type)
            }
            _ => None,
        }
    }

    pub fn document(&self) -> Option<&DocumentKey> {
        match &self.0.kind {
            CollectionKind::Request { document } => Some(document),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.0.kind, CollectionKind::Live { .. })
    }

    /// Increases whenever the collection is marked dirty or repopulated. Reading it doesn't bring the collection up
    /// to date.
    pub fn version(&self) -> u64 {
        self.0.version.get()
    }

    /// Whether there are changes not yet applied to the sequence.
    pub fn is_dirty(&self) -> bool {
        self.0.should_reset.get()
    }

    pub fn len(&self) -> usize {
        self.sync();
        self.0.source.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<ResourceKey> {
        self.sync();
        self.0.source.borrow().get(index).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.sync();
        self.0.members.borrow().contains(key)
    }

    /// A snapshot of the current sequence.
    pub fn identifiers(&self) -> Vec<ResourceKey> {
        self.sync();
        self.0.source.borrow().clone()
    }

    /// Runs `f` over the current sequence without copying it. `f` must not read other collections.
    pub fn with_identifiers<R>(&self, f: impl FnOnce(&[ResourceKey]) -> R) -> R {
        self.sync();
        f(&self.0.source.borrow())
    }

    pub fn meta(&self) -> Option<Value> {
        self.sync();
        self.0.meta.borrow().clone()
    }

    pub fn links(&self) -> Option<Value> {
        self.sync();
        self.0.links.borrow().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.sync();
        self.0.is_loaded.get()
    }

    /// Changes recorded since the last read, in the order they were first recorded.
    pub fn pending_changes(&self) -> Vec<(ResourceKey, ChangeAction)> {
        self.0
            .pending
            .borrow()
            .iter()
            .map(|(key, action)| (key.clone(), *action))
            .collect()
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.get()
    }

    /// Detaches the collection from its manager and empties it.
    pub fn destroy(&self) {
        if self.0.destroyed.get() {
            return;
        }
        match self.0.manager.upgrade() {
            Some(manager) => manager.release(self),
            None => self.teardown(),
        }
    }

    fn sync(&self) {
        if !self.0.should_reset.get() || self.0.destroyed.get() {
            return;
        }
        if let Some(manager) = self.0.manager.upgrade() {
            manager.sync_array(self);
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.0.should_reset.set(true);
        self.bump();
    }

    pub(crate) fn bump(&self) {
        self.0.version.set(self.0.version.get() + 1);
    }

    pub(crate) fn raw_len(&self) -> usize {
        self.0.source.borrow().len()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.0.pending.borrow().is_empty()
    }

    pub(crate) fn teardown(&self) {
        self.0.destroyed.set(true);
        self.0.should_reset.set(false);
        self.0.should_sync_from_cache.set(false);
        self.0.source.borrow_mut().clear();
        self.0.members.borrow_mut().clear();
        self.0.pending.borrow_mut().clear();
        self.0.associated.borrow_mut().clear();
        self.bump();
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Collection {}

impl Hash for Collection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("len", &self.0.source.borrow().len())
            .field("dirty", &self.0.should_reset.get())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identifier::IdentifierCache;

    #[test]
    fn fast_push_large() {
        let mut target = vec![0usize; 3];
        fast_push(&mut target, (0..10_500).collect());
        assert_eq!(target.len(), 10_503);
        assert_eq!(target[3], 0);
        assert_eq!(target[3 + 4761], 4761);
        assert_eq!(target.last(), Some(&10_499));

        let mut small = Vec::new();
        fast_push_batched(&mut small, vec![1, 2, 3, 4, 5], 2);
        assert_eq!(small, vec![1, 2, 3, 4, 5]);
        fast_push(&mut small, Vec::new());
        assert_eq!(small.len(), 5);
    }

    #[test]
    fn changes_cancel_out() {
        let identifiers = IdentifierCache::new();
        let a = identifiers.get_or_create("widget", Some("1"), None);
        let b = identifiers.get_or_create("widget", Some("2"), None);
        let mut changes = ChangeSet::new();

        assert!(record_change(&mut changes, &a, ChangeAction::Add));
        assert!(record_change(&mut changes, &b, ChangeAction::Del));
        assert!(record_change(&mut changes, &a, ChangeAction::Add));
        assert_eq!(changes.len(), 2);

        assert!(!record_change(&mut changes, &a, ChangeAction::Del));
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec![&b]);

        // After cancelling, the key starts over at the end of the order.
        assert!(record_change(&mut changes, &a, ChangeAction::Del));
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec![&b, &a]);
    }

    #[test]
    fn construction_dedups() {
        let identifiers = IdentifierCache::new();
        let a = identifiers.get_or_create("widget", Some("1"), None);
        let b = identifiers.get_or_create("widget", Some("2"), None);
        let collection = Collection::new(0, CollectionKind::Source, vec![a.clone(), b.clone(), a.clone()], Weak::new());

        assert_eq!(collection.identifiers(), vec![a.clone(), b]);
        assert!(collection.contains(&a));
        assert_eq!(collection.resource_type(), None);

        collection.destroy();
        assert!(collection.is_destroyed());
        assert!(collection.is_empty());
    }
}
