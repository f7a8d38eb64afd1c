//! Caching boundary and the typed object cache built on it

mod cache;
mod typed;

pub use cache::{Cache, InMemoryCache};
pub use typed::{CacheableObject, TypedObjectCache};
