//! Generation vacuum.
//!
//! Each build generation writes its entries under `<root>/<generation>/`.
//! A small manifest at `<root>/generations.json` records which generations
//! this cache has created, and the vacuum removes every recorded generation
//! except the current one. Directories the manifest never recorded are left
//! alone.

use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::store::StoreError;

/// Name of the manifest file within the cache root.
pub const MANIFEST_FILE: &str = "generations.json";

/// Generations previously written under a cache root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationManifest {
    pub generations: Vec<String>,
}

impl GenerationManifest {
    /// Loads the manifest, returning `None` if it is missing or unparseable.
    pub async fn load(root: &Path) -> Option<Self> {
        let raw = tokio::fs::read(root.join(MANIFEST_FILE)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub async fn save(&self, root: &Path) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| StoreError::io(root, source))?;
        let path = root.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(self).map_err(StoreError::Serialize)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|source| StoreError::io(&path, source))
    }
}

/// What a vacuum pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// True when `generation` names exactly one directory directly below the root.
pub fn is_safe_generation(generation: &str) -> bool {
    !generation.is_empty()
        && generation != "."
        && generation != ".."
        && !generation.contains(['/', '\\', '\0'])
}

/// Deletes the directories of all recorded generations other than `current`,
/// then records `current` as the only known generation.
pub async fn vacuum(root: &Path, current: &str) -> Result<VacuumReport, StoreError> {
    if !is_safe_generation(current) {
        return Err(StoreError::InvalidGeneration(current.to_string()));
    }

    let manifest = match GenerationManifest::load(root).await {
        Some(manifest) => manifest,
        None => {
            debug!(root = %root.display(), "no readable generation manifest; nothing to vacuum");
            GenerationManifest::default()
        }
    };

    let mut report = VacuumReport::default();
    for generation in manifest.generations {
        if generation == current || !is_safe_generation(&generation) {
            continue;
        }

        let dir = root.join(&generation);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => report.removed.push(generation),
            Err(err) if err.kind() == ErrorKind::NotFound => report.removed.push(generation),
            Err(err) => {
                warn!(
                    generation = %generation,
                    dir = %dir.display(),
                    error = %err,
                    "failed to remove old cache generation"
                );
                report.failed.push(generation);
            }
        }
    }

    GenerationManifest {
        generations: vec![current.to_string()],
    }
    .save(root)
    .await?;

    if !report.removed.is_empty() {
        info!(
            current,
            removed = ?report.removed,
            "vacuumed old cache generations"
        );
    }

    Ok(report)
}
