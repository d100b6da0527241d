use serde_json::Map;
use serde_json::Value;

use crate::document::ApiError;
use crate::document::CachedDocument;
use crate::document::JsonApiDocument;
use crate::document::RelationshipOperation;
use crate::document::RelationshipState;
use crate::document::ResourceObject;
use crate::error::Result;
use crate::error::StoreError;
use crate::identifier::DocumentKey;
use crate::identifier::ResourceKey;

/// Storage backend contract.
///
/// A backend is built by the store with a [`CacheCapabilities`](crate::capabilities::CacheCapabilities) handle and
/// reports every change through it. The store never looks at how a backend represents its data.
///
/// Methods take `&self`: a backend keeps its state behind interior mutability and must release any borrow of it
/// before reporting a change, because subscribers may read back from the backend while the notification is delivered.
pub trait Cache {
    /// Ingests a document. When `request` is given the normalized result is also stored as that request's document
    /// and the document is notified as `added` or `updated`.
    fn put(&self, document: JsonApiDocument, request: Option<&DocumentKey>) -> Result<CachedDocument>;

    /// Merges a single resource. Returns the names of changed fields when `calculate_changes` is set.
    fn upsert(&self, key: &ResourceKey, data: ResourceObject, calculate_changes: bool) -> Result<Option<Vec<String>>>;

    /// Current state of the resource in JSON:API form, local changes included.
    fn peek(&self, key: &ResourceKey) -> Option<ResourceObject>;

    fn peek_request(&self, request: &DocumentKey) -> Option<CachedDocument>;

    fn get_attr(&self, key: &ResourceKey, field: &str) -> Result<Option<Value>>;
    fn set_attr(&self, key: &ResourceKey, field: &str, value: Value) -> Result<()>;
    fn get_relationship(&self, key: &ResourceKey, field: &str) -> Result<Option<RelationshipState>>;

    // Lifecycle.
    fn client_did_create(&self, key: &ResourceKey, attributes: Map<String, Value>) -> Result<()>;
    fn will_commit(&self, key: &ResourceKey) -> Result<()>;
    /// `data` is the server's view of the resource, if it returned one. It may carry the newly assigned id.
    fn did_commit(&self, key: &ResourceKey, data: Option<ResourceObject>) -> Result<()>;
    fn commit_was_rejected(&self, key: &ResourceKey, errors: Vec<ApiError>) -> Result<()>;
    fn unload_record(&self, key: &ResourceKey) -> Result<()>;
    fn set_is_deleted(&self, key: &ResourceKey, is_deleted: bool) -> Result<()>;

    // State predicates.
    fn is_new(&self, key: &ResourceKey) -> bool;
    fn is_deleted(&self, key: &ResourceKey) -> bool;
    fn is_deletion_committed(&self, key: &ResourceKey) -> bool;
    fn is_empty(&self, key: &ResourceKey) -> bool;

    // The following capabilities are optional.

    fn mutate_relationship(&self, _operation: RelationshipOperation) -> Result<()> {
        Err(StoreError::not_implemented("mutate_relationship"))
    }

    fn changed_attributes(&self, _key: &ResourceKey) -> Result<Map<String, Value>> {
        Err(StoreError::not_implemented("changed_attributes"))
    }

    /// Drops local attribute changes, returning the names of the reverted fields.
    fn rollback_attributes(&self, _key: &ResourceKey) -> Result<Vec<String>> {
        Err(StoreError::not_implemented("rollback_attributes"))
    }

    fn errors(&self, _key: &ResourceKey) -> Result<Vec<ApiError>> {
        Err(StoreError::not_implemented("errors"))
    }

    fn invalidate_request(&self, _request: &DocumentKey) -> Result<()> {
        Err(StoreError::not_implemented("invalidate_request"))
    }
}

/// The part of schema information the store core needs.
pub trait Schema {
    /// Whether resources of this type stay out of live collections while they are new, i.e. until their creation is
    /// committed.
    fn hides_new_resources(&self, _resource_type: &str) -> bool {
        false
    }
}
