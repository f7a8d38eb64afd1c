use super::cache::Cache;
use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A value that knows its own cache key and lifetime
pub trait CacheableObject: Serialize + DeserializeOwned + Send + Sync {
    fn cache_key(&self) -> String;
    fn ttl(&self) -> Option<Duration>;
}

/// JSON-encoded objects stored in a shared [`Cache`] under a namespace
pub struct TypedObjectCache<T> {
    cache: Arc<dyn Cache>,
    namespace: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedObjectCache<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            namespace: self.namespace,
            _marker: PhantomData,
        }
    }
}

impl<T: CacheableObject> TypedObjectCache<T> {
    pub fn new(cache: Arc<dyn Cache>, namespace: &'static str) -> Self {
        Self {
            cache,
            namespace,
            _marker: PhantomData,
        }
    }

    /// Undecodable entries are treated as misses and removed
    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.cache.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(cache_namespace = self.namespace, key = %key, error = %e, "dropping undecodable cache entry");
                self.cache.delete(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn store(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.cache.set(&value.cache_key(), bytes, value.ttl()).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.cache.delete(key).await
    }
}
