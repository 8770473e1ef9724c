// src/storage/feedback_ledger.rs
//! Append-only feedback logs, one JSON line per correction, one log per
//! tenant pair.
//!
//! Retraining checks a log out by renaming it to a pending snapshot, so
//! corrections that arrive while a model is being fitted land in a fresh
//! active log. A successful cycle renames the snapshot into `archive/`;
//! a failed one leaves it where it is and it is folded into the next
//! checkout. Every move is a single rename, so an entry is never dropped
//! and a crash never leaves it in two places a reader counts twice.

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{ResolutionError, Result};
use crate::models::{FeedbackEntry, TenantPairKey};

const ACTIVE_SUFFIX: &str = "_feedback.jsonl";
const PENDING_SUFFIX: &str = "_feedback.pending.jsonl";
const ARCHIVE_DIR: &str = "archive";

pub struct FeedbackLedger {
    data_dir: PathBuf,
    // Serializes file operations per tenant pair within this process.
    locks: Mutex<HashMap<TenantPairKey, Arc<AsyncMutex<()>>>>,
}

impl FeedbackLedger {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn active_path(&self, key: &TenantPairKey) -> PathBuf {
        self.data_dir.join(format!("{}{}", key.as_str(), ACTIVE_SUFFIX))
    }

    pub fn pending_path(&self, key: &TenantPairKey) -> PathBuf {
        self.data_dir.join(format!("{}{}", key.as_str(), PENDING_SUFFIX))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join(ARCHIVE_DIR)
    }

    fn lock_for(&self, key: &TenantPairKey) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Appends one entry as a single write of one complete line.
    pub async fn append(&self, entry: &FeedbackEntry) -> Result<()> {
        let key = entry.tenant_pair()?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.data_dir.display()))?;
        let path = self.active_path(&key);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open feedback log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.flush().await?;

        debug!(
            "Feedback appended for {}: {}:{} = {}",
            key, entry.source_field, entry.source_value, entry.corrected_value
        );
        Ok(())
    }

    /// Entries not yet incorporated into a trained model, read fresh from disk.
    pub async fn count(&self, key: &TenantPairKey) -> Result<usize> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let pending = count_lines(&self.pending_path(key)).await?;
        let active = count_lines(&self.active_path(key)).await?;
        Ok(pending + active)
    }

    /// All unincorporated entries in append order (checked-out snapshot first).
    pub async fn entries(&self, key: &TenantPairKey) -> Result<Vec<FeedbackEntry>> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let mut entries = read_entries(&self.pending_path(key)).await?;
        entries.extend(read_entries(&self.active_path(key)).await?);
        Ok(entries)
    }

    pub async fn last_updated(&self, key: &TenantPairKey) -> Option<DateTime<Utc>> {
        let mut latest = None;
        for path in [self.pending_path(key), self.active_path(key)] {
            if let Ok(modified) = tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                let modified = DateTime::<Utc>::from(modified);
                if latest.map_or(true, |l| modified > l) {
                    latest = Some(modified);
                }
            }
        }
        latest
    }

    /// Moves the active log into the pending snapshot and returns everything
    /// the snapshot holds. New appends start a fresh active log.
    pub async fn checkout(&self, key: &TenantPairKey) -> Result<Vec<FeedbackEntry>> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let active = self.active_path(key);
        let pending = self.pending_path(key);
        if exists(&active).await? {
            if exists(&pending).await? {
                // Left over from a failed cycle: fold the newer entries in behind it.
                self.fold_into_pending(key, &active, &pending).await?;
            } else {
                tokio::fs::rename(&active, &pending)
                    .await
                    .with_context(|| format!("Failed to check out {}", active.display()))?;
            }
        }
        read_entries(&pending).await
    }

    // The merged snapshot replaces pending in one rename. If a crash lands
    // between that rename and removing the active log, pending already ends
    // with the active content and the next fold only removes it.
    async fn fold_into_pending(
        &self,
        key: &TenantPairKey,
        active: &Path,
        pending: &Path,
    ) -> Result<()> {
        let newer = tokio::fs::read(active).await?;
        let mut merged = tokio::fs::read(pending).await?;
        if merged.ends_with(&newer) {
            debug!("Feedback for {} already folded into {}", key, pending.display());
        } else {
            if !merged.is_empty() && !merged.ends_with(b"\n") {
                merged.push(b'\n');
            }
            merged.extend_from_slice(&newer);
            let tmp = self
                .data_dir
                .join(format!(".{}.{}.tmp", key.as_str(), uuid::Uuid::new_v4()));
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(&merged).await?;
            file.sync_all().await?;
            drop(file);
            if let Err(e) = tokio::fs::rename(&tmp, pending).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(ResolutionError::Storage(format!(
                    "Failed to replace {}: {}",
                    pending.display(),
                    e
                )));
            }
        }
        tokio::fs::remove_file(active).await?;
        Ok(())
    }

    /// Retires incorporated feedback: the pending snapshot if one is checked
    /// out, otherwise the active log. Returns the archive path, if anything
    /// was moved.
    pub async fn archive(&self, key: &TenantPairKey) -> Result<Option<PathBuf>> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let source = if exists(&self.pending_path(key)).await? {
            self.pending_path(key)
        } else if exists(&self.active_path(key)).await? {
            self.active_path(key)
        } else {
            return Ok(None);
        };

        let archive_dir = self.archive_dir();
        tokio::fs::create_dir_all(&archive_dir)
            .await
            .with_context(|| format!("Failed to create {}", archive_dir.display()))?;
        let destination = archive_dir.join(format!(
            "{}_feedback_{}.jsonl",
            key.as_str(),
            Utc::now().format("%Y%m%dT%H%M%S%.6f")
        ));
        tokio::fs::rename(&source, &destination)
            .await
            .with_context(|| format!("Failed to archive {}", source.display()))?;

        info!("📦 Archived feedback for {} to {}", key, destination.display());
        Ok(Some(destination))
    }

    /// Tenant pairs with active or pending feedback on disk.
    pub async fn list_keys(&self) -> Result<Vec<TenantPairKey>> {
        let mut keys = BTreeSet::new();
        let mut dir = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let stem = name
                .strip_suffix(PENDING_SUFFIX)
                .or_else(|| name.strip_suffix(ACTIVE_SUFFIX));
            if let Some(stem) = stem {
                match TenantPairKey::parse(stem) {
                    Ok(key) => {
                        keys.insert(key);
                    }
                    Err(e) => debug!("Skipping unrecognized feedback file {}: {}", name, e),
                }
            }
        }
        Ok(keys.into_iter().collect())
    }
}

async fn exists(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ResolutionError::Storage(format!(
            "Failed to stat {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ResolutionError::Storage(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn count_lines(path: &Path) -> Result<usize> {
    Ok(read_optional(path)
        .await?
        .map(|content| content.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0))
}

async fn read_entries(path: &Path) -> Result<Vec<FeedbackEntry>> {
    let Some(content) = read_optional(path).await? else {
        return Ok(Vec::new());
    };
    let mut entries = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FeedbackEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(
                "Skipping malformed feedback line {} in {}: {}",
                line_no + 1,
                path.display(),
                e
            ),
        }
    }
    Ok(entries)
}
