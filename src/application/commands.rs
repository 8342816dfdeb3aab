//! Maintenance operations on a cache directory.

use std::path::PathBuf;

use tracing::{info, instrument};

use crate::{
    cache::{CacheConfig, CacheStore, Expirer, StoreStats, VacuumReport, vacuum},
    config::CacheSettings,
};

use super::error::AppError;

#[derive(Debug, Clone)]
pub struct InspectReport {
    pub root_dir: PathBuf,
    pub generation: String,
    pub stats: StoreStats,
    /// Populated only when keys were requested.
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpireTarget {
    Key(String),
    All,
}

impl ExpireTarget {
    pub fn from_args(key: Option<String>, all: bool) -> Result<Self, AppError> {
        match (key, all) {
            (Some(key), false) => Ok(Self::Key(key)),
            (None, true) => Ok(Self::All),
            _ => Err(AppError::validation("exactly one of --key or --all is required")),
        }
    }
}

/// Number of entries removed by an expire command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpireReport {
    pub removed: usize,
}

/// Opens the store without pre-filling or vacuuming. Commands only touch the
/// disk tier of the generation they name; removing other generations is left
/// to [`vacuum_generations`].
async fn open_store(settings: &CacheSettings) -> Result<CacheStore, AppError> {
    let config = CacheConfig {
        prefill: false,
        vacuum_on_open: false,
        ..CacheConfig::from(settings)
    };
    Ok(CacheStore::open(config).await?)
}

#[instrument(skip(settings), fields(generation = %settings.generation))]
pub async fn inspect(
    settings: &CacheSettings,
    list_keys: bool,
) -> Result<InspectReport, AppError> {
    let store = open_store(settings).await?;
    let keys = if list_keys {
        store.disk_keys()
    } else {
        Vec::new()
    };

    Ok(InspectReport {
        root_dir: settings.root_dir.clone(),
        generation: settings.generation.clone(),
        stats: store.stats(),
        keys,
    })
}

#[instrument(skip(settings), fields(generation = %settings.generation))]
pub async fn vacuum_generations(settings: &CacheSettings) -> Result<VacuumReport, AppError> {
    Ok(vacuum(&settings.root_dir, &settings.generation).await?)
}

#[instrument(skip(settings), fields(generation = %settings.generation))]
pub async fn expire(
    settings: &CacheSettings,
    target: ExpireTarget,
) -> Result<ExpireReport, AppError> {
    let store = open_store(settings).await?;
    let expirer = Expirer::new(store.clone());

    let removed = match target {
        ExpireTarget::Key(key) => {
            let present = store.contains(&key);
            expirer.expire(&key).await;
            usize::from(present)
        }
        ExpireTarget::All => {
            let count = store.disk_keys().len();
            expirer.expire_all().await;
            count
        }
    };

    store.save().await;
    info!(removed, "expire command finished");
    Ok(ExpireReport { removed })
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::path::Path;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::cache::{CacheEntry, GenerationManifest, StoreError};

    fn settings(root: &Path, generation: &str) -> CacheSettings {
        CacheSettings {
            root_dir: root.to_path_buf(),
            generation: generation.to_string(),
            max_bytes: NonZeroUsize::new(1_000_000).unwrap(),
            index_flush_debounce: Duration::from_millis(10),
            prefill: false,
            prefill_concurrency: NonZeroUsize::new(4).unwrap(),
            image_route: None,
            image_swr_secs: 0,
        }
    }

    /// Writes entries the way a serving process would, vacuum included.
    async fn seed(settings: &CacheSettings, keys: &[&str]) {
        let store = CacheStore::open(CacheConfig::from(settings)).await.unwrap();
        for key in keys {
            store.set(
                key,
                CacheEntry {
                    body: Bytes::from_static(b"body"),
                    headers: Vec::new(),
                    status: 200,
                    cached_at_ms: 0,
                    s_maxage: 60,
                    swr: 0,
                },
            );
        }
        store.save().await;
    }

    #[tokio::test]
    async fn inspect_lists_disk_keys() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "g1");
        seed(&settings, &["/b", "/a"]).await;

        let report = inspect(&settings, true).await.unwrap();
        assert_eq!(report.stats.disk_entries, 2);
        assert_eq!(report.stats.memory_entries, 0);
        assert_eq!(report.keys, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn expire_key_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "g1");
        seed(&settings, &["/a", "/b"]).await;

        let report = expire(&settings, ExpireTarget::Key("/a".into())).await.unwrap();
        assert_eq!(report.removed, 1);
        let report = expire(&settings, ExpireTarget::Key("/a".into())).await.unwrap();
        assert_eq!(report.removed, 0);

        let remaining = inspect(&settings, true).await.unwrap();
        assert_eq!(remaining.keys, vec!["/b"]);
    }

    #[tokio::test]
    async fn expire_all_empties_generation() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "g1");
        seed(&settings, &["/a", "/b", "/c"]).await;

        let report = expire(&settings, ExpireTarget::All).await.unwrap();
        assert_eq!(report.removed, 3);
        assert_eq!(inspect(&settings, false).await.unwrap().stats.disk_entries, 0);
    }

    #[tokio::test]
    async fn vacuum_drops_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        seed(&settings(dir.path(), "old"), &["/a"]).await;

        let report = vacuum_generations(&settings(dir.path(), "new")).await.unwrap();
        assert_eq!(report.removed, vec!["old"]);
        assert!(!dir.path().join("old").exists());
    }

    #[tokio::test]
    async fn inspect_and_expire_leave_other_generations_alone() {
        let dir = tempfile::tempdir().unwrap();
        seed(&settings(dir.path(), "live"), &["/a"]).await;
        let other = settings(dir.path(), "old");

        inspect(&other, true).await.unwrap();
        expire(&other, ExpireTarget::All).await.unwrap();

        assert!(dir.path().join("live").exists());
        let manifest = GenerationManifest::load(dir.path()).await.unwrap();
        assert_eq!(manifest.generations, vec!["live"]);
        let live = inspect(&settings(dir.path(), "live"), true).await.unwrap();
        assert_eq!(live.keys, vec!["/a"]);
    }

    #[tokio::test]
    async fn commands_reject_unsafe_generations() {
        let dir = tempfile::tempdir().unwrap();
        let err = inspect(&settings(dir.path(), ".."), false).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Store(StoreError::InvalidGeneration(_))
        ));
    }

    #[test]
    fn expire_target_needs_exactly_one_choice() {
        assert_eq!(
            ExpireTarget::from_args(Some("/a".into()), false).unwrap(),
            ExpireTarget::Key("/a".into())
        );
        assert_eq!(ExpireTarget::from_args(None, true).unwrap(), ExpireTarget::All);
        assert!(ExpireTarget::from_args(None, false).is_err());
        assert!(ExpireTarget::from_args(Some("/a".into()), true).is_err());
    }
}
