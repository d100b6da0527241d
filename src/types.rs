use std::fmt::Display;

use strum::AsRefStr;
use strum::EnumString;

use crate::identifier::DocumentKey;
use crate::identifier::ResourceKey;

/// Kind of change a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Added,
    Removed,
    Updated,
    State,
    Attributes,
    Relationships,
    Identity,
    Errors,
    Meta,
    Invalidated,
}

impl Operation {
    /// Operations that are also broadcast on the wildcard channel of the target's kind.
    #[inline]
    pub fn is_channel_operation(self, target: &Identifier) -> bool {
        match target {
            Identifier::Resource(_) => matches!(self, Self::Added | Self::Removed | Self::Updated | Self::State),
            Identifier::Document(_) => {
                matches!(self, Self::Added | Self::Removed | Self::Updated | Self::Invalidated)
            }
        }
    }

    /// Field-scoped operations may name the changed field.
    #[inline]
    pub fn allows_sub_key(self) -> bool {
        matches!(
            self,
            Self::Attributes | Self::Relationships | Self::Identity | Self::Errors | Self::Meta
        )
    }
}

/// Target of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Resource(ResourceKey),
    Document(DocumentKey),
}

impl Identifier {
    pub fn as_resource(&self) -> Option<&ResourceKey> {
        match self {
            Self::Resource(key) => Some(key),
            Self::Document(_) => None,
        }
    }

    pub fn as_document(&self) -> Option<&DocumentKey> {
        match self {
            Self::Document(key) => Some(key),
            Self::Resource(_) => None,
        }
    }
}

impl From<ResourceKey> for Identifier {
    fn from(key: ResourceKey) -> Self {
        Self::Resource(key)
    }
}

impl From<&ResourceKey> for Identifier {
    fn from(key: &ResourceKey) -> Self {
        Self::Resource(key.clone())
    }
}

impl From<DocumentKey> for Identifier {
    fn from(key: DocumentKey) -> Self {
        Self::Document(key)
    }
}

impl From<&DocumentKey> for Identifier {
    fn from(key: &DocumentKey) -> Self {
        Self::Document(key.clone())
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resource(key) => Display::fmt(key, f),
            Self::Document(key) => Display::fmt(key, f),
        }
    }
}

/// What a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTarget {
    Key(Identifier),
    /// Every resource-scoped channel operation, whatever the key.
    AnyResource,
    /// Every document-scoped channel operation, whatever the key.
    AnyDocument,
}

impl From<Identifier> for SubscriptionTarget {
    fn from(identifier: Identifier) -> Self {
        Self::Key(identifier)
    }
}

impl From<&ResourceKey> for SubscriptionTarget {
    fn from(key: &ResourceKey) -> Self {
        Self::Key(key.into())
    }
}

impl From<&DocumentKey> for SubscriptionTarget {
    fn from(key: &DocumentKey) -> Self {
        Self::Key(key.into())
    }
}

/// Net pending change of one key in a collection changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Del,
}
