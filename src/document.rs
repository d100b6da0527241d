//! Payload shapes exchanged with a storage backend.
//!
//! Incoming data follows the JSON:API layout and is deserialized with serde. What the backend hands back is already
//! normalized: resources are referred to by [`ResourceKey`] only.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::identifier::ResourceKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceIdentifierObject {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id:            Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid:           Option<String>,
}

impl ResourceIdentifierObject {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id:            Some(id.into()),
            lid:           None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<ResourceIdentifierObject>),
    One(ResourceIdentifierObject),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRelationshipObject")]
pub struct RelationshipObject {
    /// `None` stands for an empty to-one relationship. A relationship without linkage at all (links or meta only) is
    /// also represented this way, see `has_data`.
    #[serde(default)]
    pub data:     Option<Linkage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta:     Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links:    Option<Value>,
    /// Whether the payload carried a `data` member, `null` included.
    #[serde(skip)]
    pub has_data: bool,
}

// `data: null` and a missing `data` must stay distinguishable.
#[derive(Deserialize)]
struct RawRelationshipObject {
    #[serde(default, deserialize_with = "present")]
    data:  Option<Option<Linkage>>,
    #[serde(default)]
    meta:  Option<Value>,
    #[serde(default)]
    links: Option<Value>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl From<RawRelationshipObject> for RelationshipObject {
    fn from(raw: RawRelationshipObject) -> Self {
        Self {
            has_data: raw.data.is_some(),
            data:     raw.data.flatten(),
            meta:     raw.meta,
            links:    raw.links,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id:            Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid:           Option<String>,
    #[serde(default)]
    pub attributes:    Map<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta:          Option<Value>,
}

impl ResourceObject {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id:            Some(id.into()),
            lid:           None,
            attributes:    Map::new(),
            relationships: BTreeMap::new(),
            meta:          None,
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn relationship(mut self, name: impl Into<String>, data: Linkage) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipObject {
                data:     Some(data),
                has_data: true,
                ..Default::default()
            },
        );
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<ResourceObject>),
    One(ResourceObject),
}

/// A JSON:API top-level document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonApiDocument {
    #[serde(default)]
    pub data:     Option<PrimaryData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<ResourceObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta:     Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links:    Option<Value>,
}

impl JsonApiDocument {
    pub fn one(resource: ResourceObject) -> Self {
        Self {
            data: Some(PrimaryData::One(resource)),
            ..Default::default()
        }
    }

    pub fn many(resources: Vec<ResourceObject>) -> Self {
        Self {
            data: Some(PrimaryData::Many(resources)),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: Value) -> crate::error::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Normalized relationship linkage.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationshipValue {
    One(Option<ResourceKey>),
    Many(Vec<ResourceKey>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipState {
    pub data:  Option<RelationshipValue>,
    pub meta:  Option<Value>,
    pub links: Option<Value>,
}

/// Local edit of a relationship.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationshipOperation {
    Replace {
        record: ResourceKey,
        field:  String,
        value:  RelationshipValue,
    },
    Add {
        record: ResourceKey,
        field:  String,
        value:  Vec<ResourceKey>,
        index:  Option<usize>,
    },
    Remove {
        record: ResourceKey,
        field:  String,
        value:  Vec<ResourceKey>,
    },
}

impl RelationshipOperation {
    pub fn record(&self) -> &ResourceKey {
        match self {
            Self::Replace { record, .. } | Self::Add { record, .. } | Self::Remove { record, .. } => record,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::Replace { field, .. } | Self::Add { field, .. } | Self::Remove { field, .. } => field,
        }
    }
}

/// Primary data of a cached document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentData {
    One(Option<ResourceKey>),
    Many(Vec<ResourceKey>),
}

/// What a backend returns from [`Cache::put`](crate::traits::Cache::put) and keeps for request documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedDocument {
    pub data:  Option<DocumentData>,
    pub meta:  Option<Value>,
    pub links: Option<Value>,
}

impl CachedDocument {
    /// Primary resources as a flat list, whatever the cardinality.
    pub fn keys(&self) -> Vec<ResourceKey> {
        match &self.data {
            Some(DocumentData::Many(keys)) => keys.clone(),
            Some(DocumentData::One(Some(key))) => vec![key.clone()],
            _ => Vec::new(),
        }
    }
}

/// A validation or server error attached to a resource by a rejected commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title:   Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail:  Option<String>,
    /// JSON pointer into the resource, e.g. `/data/attributes/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_linkage_presence() {
        let doc = JsonApiDocument::from_value(json!({
            "data": {
                "type": "widget",
                "id": "1",
                "attributes": { "name": "Sprocket" },
                "relationships": {
                    "owner": { "data": { "type": "user", "id": "3" } },
                    "parts": { "data": [] },
                    "maker": { "links": { "related": "/makers/1" } },
                    "box": { "data": null }
                }
            },
            "included": [{ "type": "user", "id": "3" }]
        }))
        .unwrap();

        let Some(PrimaryData::One(widget)) = &doc.data
        else {
            panic!("expected a single resource, got {:?}", doc.data)
        };
        assert_eq!(widget.attributes["name"], json!("Sprocket"));
        assert!(widget.relationships["owner"].has_data);
        assert!(widget.relationships["box"].has_data);
        assert_eq!(widget.relationships["box"].data, None);
        assert_eq!(widget.relationships["parts"].data, Some(Linkage::Many(vec![])));
        assert!(!widget.relationships["maker"].has_data);
        assert_eq!(doc.included.len(), 1);
    }

    #[test]
    fn linkage_presence_in_collections() {
        let doc = JsonApiDocument::from_json(
            r#"{
                "data": [
                    { "type": "widget", "id": "1", "relationships": { "owner": { "data": null } } },
                    { "type": "widget", "id": "2", "relationships": { "owner": { "meta": { "count": 0 } } } }
                ]
            }"#,
        )
        .unwrap();

        let Some(PrimaryData::Many(widgets)) = &doc.data
        else {
            panic!("expected a resource list, got {:?}", doc.data)
        };
        assert!(widgets[0].relationships["owner"].has_data);
        assert!(!widgets[1].relationships["owner"].has_data);
        assert_eq!(widgets[1].relationships["owner"].meta, Some(json!({ "count": 0 })));
    }

    #[test]
    fn bad_json() {
        assert!(JsonApiDocument::from_json("{ not json").is_err());
        assert!(JsonApiDocument::from_json(r#"{ "data": { "id": "1" } }"#).is_err());
    }
}
