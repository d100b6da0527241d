use thiserror::Error;

/// Recoverable errors surfaced by the store and by storage backends.
///
/// Contract violations by callers (unstable identifiers, double unsubscribe, conflicting ids and alike) are not
/// represented here. Those are bugs in the calling code and panic immediately.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend doesn't support the requested capability.
    #[error("{method} is not implemented by this cache")]
    NotImplemented { method: &'static str },

    #[error("no cached data for {0}")]
    MissingResource(String),

    #[error("no cached request document for '{0}'")]
    UnknownDocument(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A record handle outlived its store.
    #[error("the store of {0} is gone")]
    Detached(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A builder was left incomplete.
    #[error(transparent)]
    Setup(#[from] fieldx::error::FieldXError),
}

impl StoreError {
    pub fn not_implemented(method: &'static str) -> Self {
        Self::NotImplemented { method }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
