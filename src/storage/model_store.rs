// src/storage/model_store.rs
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ResolutionError, Result};
use crate::matching::gazetteer::GazetteerSettings;
use crate::models::{ModelStats, TenantPairKey};

const SETTINGS_EXTENSION: &str = "settings";
const BLOB_FORMAT: &str = "gazetteer-settings";
const BLOB_VERSION: u32 = 1;

/// A trained matcher bound to one tenant pair.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub key: TenantPairKey,
    pub settings: GazetteerSettings,
    pub trained_at: DateTime<Utc>,
    /// Process-local counter; bumps every time a model enters the cache.
    pub generation: u64,
}

// First line of a settings blob. The settings bytes follow the newline.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobHeader {
    format: String,
    version: u32,
    source_tenant: String,
    target_tenant: String,
    trained_at: DateTime<Utc>,
    length: usize,
    sha256: String,
}

fn encode_blob(key: &TenantPairKey, trained_at: DateTime<Utc>, settings: &[u8]) -> Result<Vec<u8>> {
    let header = BlobHeader {
        format: BLOB_FORMAT.to_string(),
        version: BLOB_VERSION,
        source_tenant: key.source().to_string(),
        target_tenant: key.target().to_string(),
        trained_at,
        length: settings.len(),
        sha256: hex::encode(Sha256::digest(settings)),
    };
    let mut blob = serde_json::to_vec(&header)?;
    blob.push(b'\n');
    blob.extend_from_slice(settings);
    Ok(blob)
}

fn decode_blob(key: &TenantPairKey, blob: &[u8]) -> anyhow::Result<(DateTime<Utc>, GazetteerSettings)> {
    let split = blob
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| anyhow!("settings blob has no header line"))?;
    let header: BlobHeader =
        serde_json::from_slice(&blob[..split]).context("Failed to parse settings blob header")?;
    let body = &blob[split + 1..];

    if header.format != BLOB_FORMAT || header.version != BLOB_VERSION {
        return Err(anyhow!(
            "unsupported blob format {} v{}",
            header.format,
            header.version
        ));
    }
    if header.source_tenant != key.source() || header.target_tenant != key.target() {
        return Err(anyhow!(
            "blob belongs to {} -> {}",
            header.source_tenant,
            header.target_tenant
        ));
    }
    if body.len() != header.length {
        return Err(anyhow!(
            "truncated settings: expected {} bytes, found {}",
            header.length,
            body.len()
        ));
    }
    if hex::encode(Sha256::digest(body)) != header.sha256 {
        return Err(anyhow!("settings checksum mismatch"));
    }

    let settings = GazetteerSettings::from_bytes(body)
        .map_err(|e| anyhow!("Failed to deserialize gazetteer settings: {}", e))?;
    Ok((header.trained_at, settings))
}

/// Persists one settings blob per tenant pair and caches loaded models for
/// the life of the process. A single process owns the cache; no other
/// process may write into the same model directory.
pub struct ModelStore {
    model_dir: PathBuf,
    cache: RwLock<HashMap<TenantPairKey, Arc<TrainedModel>>>,
    generation: AtomicU64,
}

impl ModelStore {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn settings_path(&self, key: &TenantPairKey) -> PathBuf {
        self.model_dir
            .join(format!("{}.{}", key.as_str(), SETTINGS_EXTENSION))
    }

    fn cached(&self, key: &TenantPairKey) -> Option<Arc<TrainedModel>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn is_cached(&self, key: &TenantPairKey) -> bool {
        self.cached(key).is_some()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Cached model, else the persisted blob. `Ok(None)` when no model exists.
    pub async fn try_load(&self, key: &TenantPairKey) -> Result<Option<Arc<TrainedModel>>> {
        if let Some(model) = self.cached(key) {
            return Ok(Some(model));
        }

        let path = self.settings_path(key);
        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ResolutionError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let (trained_at, settings) = decode_blob(key, &blob)
            .with_context(|| format!("Invalid settings blob {}", path.display()))?;

        let model = Arc::new(TrainedModel {
            key: key.clone(),
            settings,
            trained_at,
            generation: self.next_generation(),
        });

        // A save that finished while we were reading wins over what we read.
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.entry(key.clone()).or_insert_with(|| model.clone());
        info!("Loaded gazetteer model for {} from {}", key, path.display());
        Ok(Some(entry.clone()))
    }

    /// Fail-soft load: any storage problem is logged and reported as "no model".
    pub async fn load(&self, key: &TenantPairKey) -> Option<Arc<TrainedModel>> {
        match self.try_load(key).await {
            Ok(model) => model,
            Err(e) => {
                warn!("Could not load model for {}: {}. Using fallback matching.", key, e);
                None
            }
        }
    }

    /// Writes the blob to a temporary file, renames it into place, then
    /// replaces the cache entry. Readers never see a partial blob.
    pub async fn save(
        &self,
        key: &TenantPairKey,
        settings: GazetteerSettings,
    ) -> Result<Arc<TrainedModel>> {
        let trained_at = Utc::now();
        let blob = encode_blob(key, trained_at, &settings.to_bytes()?)?;

        tokio::fs::create_dir_all(&self.model_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.model_dir.display()))?;

        let final_path = self.settings_path(key);
        let tmp_path = self.model_dir.join(format!(
            ".{}.{}.tmp",
            key.as_str(),
            Uuid::new_v4().simple()
        ));

        if let Err(e) = write_synced(&tmp_path, &blob).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ResolutionError::Storage(format!(
                "Failed to move settings into {}: {}",
                final_path.display(),
                e
            )));
        }

        let model = Arc::new(TrainedModel {
            key: key.clone(),
            settings,
            trained_at,
            generation: self.next_generation(),
        });
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), model.clone());

        info!(
            "💾 Saved gazetteer model for {} ({} bytes, generation {})",
            key,
            blob.len(),
            model.generation
        );
        Ok(model)
    }

    /// Drops the cached model and reads the persisted one again.
    pub async fn reload(&self, key: &TenantPairKey) -> Option<Arc<TrainedModel>> {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.load(key).await
    }

    pub async fn stats(&self, key: &TenantPairKey) -> ModelStats {
        let cached = self.is_cached(key);
        match tokio::fs::metadata(self.settings_path(key)).await {
            Ok(meta) => ModelStats {
                exists: true,
                file_size: Some(meta.len()),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                cached,
            },
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    debug!("Model metadata unavailable for {}: {}", key, e);
                }
                ModelStats {
                    exists: false,
                    file_size: None,
                    last_modified: None,
                    cached,
                }
            }
        }
    }

    /// Tenant pairs with a persisted model.
    pub async fn list_keys(&self) -> Result<Vec<TenantPairKey>> {
        let mut keys = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.model_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(&format!(".{}", SETTINGS_EXTENSION)) {
                match TenantPairKey::parse(stem) {
                    Ok(key) => keys.push(key),
                    Err(e) => debug!("Skipping unrecognized model file {}: {}", name, e),
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::gazetteer::{Gazetteer, GazetteerTrainer};
    use crate::models::{single_field_record, LabeledPairs};

    fn key() -> TenantPairKey {
        TenantPairKey::new("A", "B").unwrap()
    }

    fn trained_settings() -> GazetteerSettings {
        let mut pairs = LabeledPairs::default();
        pairs.matches.push((
            single_field_record("product", "WPC 80"),
            single_field_record("product", "Whey Protein Concentrate 80%"),
        ));
        pairs.distinct.push((
            single_field_record("product", "WPC 80"),
            single_field_record("product", "Skimmed Milk Powder"),
        ));
        GazetteerTrainer::new(1).train(&pairs).unwrap()
    }

    #[tokio::test]
    async fn test_load_without_model_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        assert!(store.load(&key()).await.is_none());
        let stats = store.stats(&key()).await;
        assert!(!stats.exists);
        assert!(!stats.cached);
    }

    #[tokio::test]
    async fn test_save_then_reload_round_trips_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let saved = store.save(&key(), trained_settings()).await.unwrap();
        assert!(store.is_cached(&key()));

        let fresh_store = ModelStore::new(dir.path());
        let loaded = fresh_store.load(&key()).await.unwrap();
        assert_eq!(
            loaded.settings.to_bytes().unwrap(),
            saved.settings.to_bytes().unwrap()
        );

        let index = vec![
            single_field_record("product", "Whey Protein Concentrate 80%"),
            single_field_record("product", "Skimmed Milk Powder"),
        ];
        let query = single_field_record("product", "wpc80");
        let mut before = Gazetteer::new(saved.settings.clone());
        let mut after = Gazetteer::new(loaded.settings.clone());
        before.index(index.clone());
        after.index(index);
        assert_eq!(
            before.search(&query, 0.0).unwrap(),
            after.search(&query, 0.0).unwrap()
        );

        let stats = fresh_store.stats(&key()).await;
        assert!(stats.exists && stats.cached);
        assert!(stats.file_size.unwrap() > 0);
        assert!(stats.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_blob_fails_soft() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        store.save(&key(), trained_settings()).await.unwrap();

        let path = store.settings_path(&key());
        let mut blob = std::fs::read(&path).unwrap();
        let last = blob.len() - 2;
        blob[last] ^= 0x01;
        std::fs::write(&path, &blob).unwrap();

        let fresh_store = ModelStore::new(dir.path());
        assert!(fresh_store.try_load(&key()).await.is_err());
        assert!(fresh_store.load(&key()).await.is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_cache_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let first = store.save(&key(), trained_settings()).await.unwrap();
        let second = store.save(&key(), trained_settings()).await.unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(store.load(&key()).await.unwrap().generation, second.generation);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["A__B.settings".to_string()]);
        assert_eq!(store.list_keys().await.unwrap(), vec![key()]);

        let reloaded = store.reload(&key()).await.unwrap();
        assert!(reloaded.generation > second.generation);
    }
}
