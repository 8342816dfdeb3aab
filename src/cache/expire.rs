//! On-demand expiration.

use tracing::{debug, info};

use super::store::CacheStore;

/// Deletes cached responses so the next request renders them again.
///
/// Built with [`Expirer::inactive`] when caching is off; every call is then a
/// no-op.
#[derive(Clone, Default)]
pub struct Expirer {
    store: Option<CacheStore>,
}

impl Expirer {
    pub fn new(store: CacheStore) -> Self {
        Self { store: Some(store) }
    }

    pub fn inactive() -> Self {
        Self { store: None }
    }

    pub fn is_active(&self) -> bool {
        self.store.is_some()
    }

    pub async fn expire(&self, key: &str) {
        match &self.store {
            Some(store) => {
                store.delete(key).await;
                info!(key, "expired cached response");
            }
            None => debug!(key, "cache inactive; nothing to expire"),
        }
    }

    pub async fn expire_all(&self) {
        match &self.store {
            Some(store) => store.clear().await,
            None => debug!("cache inactive; nothing to expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::codec::CacheEntry;
    use crate::cache::config::CacheConfig;

    fn entry() -> CacheEntry {
        CacheEntry {
            body: Bytes::from_static(b"page"),
            headers: Vec::new(),
            status: 200,
            cached_at_ms: 0,
            s_maxage: 60,
            swr: 0,
        }
    }

    #[tokio::test]
    async fn inactive_expirer_is_a_no_op() {
        let expirer = Expirer::inactive();
        assert!(!expirer.is_active());
        expirer.expire("/anything").await;
        expirer.expire_all().await;
    }

    #[tokio::test]
    async fn expire_removes_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(CacheConfig {
            root_dir: dir.path().to_path_buf(),
            ..CacheConfig::default()
        })
        .await
        .unwrap();
        store.set("/a", entry());
        store.set("/b", entry());

        let expirer = Expirer::new(store.clone());
        expirer.expire("/a").await;

        assert!(!store.contains("/a"));
        assert!(store.contains("/b"));

        expirer.expire_all().await;
        assert!(!store.contains("/b"));
    }
}
