//! Result cache shared by every task graph on a runtime context.
//!
//! Lookup and insert happen in one atomic step: when several workers ask
//! for the same key at once, exactly one of them runs its init future and
//! the others wait for and reuse its value. Failed inits are not cached.

use moka::future::Cache;
use scriptorium_core::CacheKey;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// How a value was obtained from [`ResultCache::get_or_try_insert`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// This caller ran the init future and inserted its value.
    Computed(Value),

    /// The value was already cached, or computed by a concurrent caller.
    Cached(Value),
}

impl Lookup {
    pub fn value(&self) -> &Value {
        match self {
            Self::Computed(v) | Self::Cached(v) => v,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Computed(v) | Self::Cached(v) => v,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

/// Task result cache using moka.
#[derive(Clone)]
pub struct ResultCache {
    cache: Cache<CacheKey, Value>,
}

impl ResultCache {
    /// Create a new cache holding at most `max_entries` results.
    ///
    /// An evicted key is computed again on its next lookup, so at-most-once
    /// only holds while the working set fits.
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_entries).build(),
        }
    }

    /// Return the cached value for `key`, or run `init` and cache its result.
    ///
    /// `init` runs at most once per key across concurrent callers. If it
    /// fails, nothing is cached and the error is shared with every caller
    /// that was waiting on it.
    pub async fn get_or_try_insert<F, E>(&self, key: CacheKey, init: F) -> Result<Lookup, Arc<E>>
    where
        F: Future<Output = Result<Value, E>>,
        E: Send + Sync + 'static,
    {
        let entry = self.cache.entry(key).or_try_insert_with(init).await?;
        let fresh = entry.is_fresh();
        let value = entry.into_value();
        Ok(if fresh {
            Lookup::Computed(value)
        } else {
            Lookup::Cached(value)
        })
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn key(name: &str) -> CacheKey {
        CacheKey::compute(name, &json!(null), &BTreeMap::new())
    }

    #[tokio::test]
    async fn test_second_lookup_is_cached() {
        let cache = ResultCache::default();

        let first = cache
            .get_or_try_insert(key("t"), async { Ok::<_, String>(json!("v")) })
            .await
            .unwrap();
        let second = cache
            .get_or_try_insert(key("t"), async { Ok::<_, String>(json!("other")) })
            .await
            .unwrap();

        assert!(!first.is_cached());
        assert!(second.is_cached());
        assert_eq!(second.into_value(), json!("v"));
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = ResultCache::default();

        let err = cache
            .get_or_try_insert(key("t"), async { Err::<Value, _>("boom".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(*err, "boom");

        let retry = cache
            .get_or_try_insert(key("t"), async { Ok::<_, String>(json!(2)) })
            .await
            .unwrap();
        assert_eq!(retry, Lookup::Computed(json!(2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_run_init_once() {
        let cache = ResultCache::default();
        let runs = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    cache
                        .get_or_try_insert(key("shared"), async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, String>(json!("done"))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut computed = 0;
        for handle in handles {
            if !handle.await.unwrap().is_cached() {
                computed += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(computed, 1);
    }
}
