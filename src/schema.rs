use std::collections::HashSet;

use crate::traits::Schema;

/// Schema with no special cases.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSchema;

impl Schema for DefaultSchema {}

/// Per-type schema settings.
#[derive(Debug, Default, Clone)]
pub struct SchemaService {
    hidden_new: HashSet<String>,
}

impl SchemaService {
    pub fn new() -> Self {
        Self::default()
    }

    /// New resources of `resource_type` only show up in live collections once committed.
    pub fn hide_new(mut self, resource_type: impl Into<String>) -> Self {
        self.hidden_new.insert(resource_type.into());
        self
    }
}

impl Schema for SchemaService {
    fn hides_new_resources(&self, resource_type: &str) -> bool {
        self.hidden_new.contains(resource_type)
    }
}
