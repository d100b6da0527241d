//! # live-store
//!
//! Normalized client-side resource cache with buffered change notifications and live collections.
//!
//! # The Basics
//!
//! The crate is designed for applications that keep a local copy of server-side resources and render views derived
//! from it:
//!
//! - Every resource gets exactly one identity token, a [`ResourceKey`], no matter how many documents mention it. A
//!   locally created resource keeps its token when the server assigns its id.
//! - Data lives in a pluggable storage backend implementing the [`Cache`] trait. [`MemoryCache`] is a complete
//!   in-memory one.
//! - Every change the backend makes is reported through its [`CacheCapabilities`] handle and ends up in the
//!   [`NotificationManager`](notification::NotificationManager). Notifications are buffered and delivered in passes;
//!   within a [`Store::join`] batch nothing is delivered until the batch completes.
//! - Live collections of all resources of a type, query results and request-keyed collections are maintained by the
//!   [`RecordArrayManager`](record_array_manager::RecordArrayManager). They collect changes as pending changesets and
//!   apply them lazily, on the next read.
//!
//! The crate is single-threaded: the store and everything it hands out are `!Send`. Asynchronous flushing is available
//! through [`TokioScheduler`](scheduler::TokioScheduler) within a `tokio::task::LocalSet`.
//!
//! # Example
//!
//! ```
//! use live_store::prelude::*;
//!
//! let store = Store::new(MemoryCache::new);
//! let widgets = store.live_array_for("widget");
//!
//! store
//!     .push(JsonApiDocument::one(ResourceObject::new("widget", "1").attr("name", "Sprocket")))
//!     .unwrap();
//!
//! let key = store.identifier_for("widget", "1");
//! assert_eq!(widgets.identifiers(), vec![key.clone()]);
//!
//! store.unload_record(&key).unwrap();
//! assert!(widgets.is_empty());
//! ```
//!
//! # Contract Violations
//!
//! Misuse that can only be a bug in the calling code panics right away: notifying for a forgotten identifier,
//! unsubscribing twice, assigning an id that is already in use, reading a request collection whose document isn't
//! cached. Recoverable conditions, including backend capabilities that aren't implemented, are reported as
//! [`StoreError`].

pub mod capabilities;
pub mod config;
pub mod document;
pub mod error;
pub mod identifier;
pub mod memory;
pub mod notification;
pub mod record;
pub mod record_array;
pub mod record_array_manager;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use capabilities::CacheCapabilities;
#[doc(inline)]
pub use error::StoreError;
#[doc(inline)]
pub use identifier::DocumentKey;
#[doc(inline)]
pub use identifier::ResourceKey;
#[doc(inline)]
pub use memory::MemoryCache;
#[doc(inline)]
pub use record_array::Collection;
#[doc(inline)]
pub use store::Store;
#[doc(inline)]
pub use traits::Cache;

pub mod prelude {
    pub use crate::capabilities::CacheCapabilities;
    pub use crate::config::StoreConfig;
    pub use crate::document::JsonApiDocument;
    pub use crate::document::ResourceObject;
    pub use crate::error::StoreError;
    pub use crate::identifier::DocumentKey;
    pub use crate::identifier::ResourceKey;
    pub use crate::memory::MemoryCache;
    pub use crate::record_array::Collection;
    pub use crate::record_array_manager::CollectionConfig;
    pub use crate::schema::SchemaService;
    pub use crate::store::Store;
    pub use crate::traits::Cache;
    pub use crate::traits::Schema;
    pub use crate::types::Operation;
    pub use crate::types::SubscriptionTarget;
}
