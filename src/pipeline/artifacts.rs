//! # Artifact Store
//!
//! Uploaded audio lives on disk between submission and transcription. Each
//! artifact gets a random file name, a content hash and an expiry time.
//!
//! ## Key Features:
//! - **Size limit**: enforced before anything touches the disk
//! - **Idempotent delete**: deleting a missing artifact is not an error
//! - **Expiry**: the sweeper removes artifacts past their TTL, even if no job
//!   ever finished with them
//! - **Lease renewal**: `touch` pushes the expiry out when a worker picks a job up
//! - **Orphan purge**: files left behind by a previous process are removed at startup

use crate::pipeline::error::PipelineError;
use crate::pipeline::lock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle to a stored artifact: its file name inside the upload directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata kept for every stored artifact.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub reference: ArtifactRef,
    #[serde(skip)]
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub expires_at: Instant,
}

pub struct ArtifactStore {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Duration,
    index: Mutex<HashMap<ArtifactRef, Artifact>>,
}

impl ArtifactStore {
    /// Open (and create if needed) the upload directory.
    pub async fn open_dir(
        dir: impl AsRef<Path>,
        max_bytes: u64,
        ttl: Duration,
    ) -> Result<Self, PipelineError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            max_bytes,
            ttl,
            index: Mutex::new(HashMap::new()),
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Persist an upload. `extension` is the original file extension including the dot.
    pub async fn save(&self, bytes: &[u8], extension: &str) -> Result<Artifact, PipelineError> {
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(PipelineError::ArtifactTooLarge {
                size,
                max: self.max_bytes,
            });
        }

        let reference = ArtifactRef::new(format!("{}{}", Uuid::new_v4(), sanitize_extension(extension)));
        let path = self.dir.join(reference.as_str());
        tokio::fs::write(&path, bytes).await?;

        let artifact = Artifact {
            reference: reference.clone(),
            path,
            size_bytes: size,
            sha256: format!("{:x}", Sha256::digest(bytes)),
            created_at: Utc::now(),
            expires_at: Instant::now() + self.ttl,
        };
        debug!(
            artifact = %reference,
            size_bytes = size,
            sha256 = %artifact.sha256,
            "Stored artifact"
        );
        lock(&self.index).insert(reference, artifact.clone());
        Ok(artifact)
    }

    /// Open an artifact for reading. Blocking; call from `spawn_blocking`.
    pub fn open(&self, reference: &ArtifactRef) -> Result<std::fs::File, PipelineError> {
        let path = lock(&self.index)
            .get(reference)
            .map(|a| a.path.clone())
            .ok_or_else(|| PipelineError::ArtifactNotFound(reference.to_string()))?;
        std::fs::File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => PipelineError::ArtifactNotFound(reference.to_string()),
            _ => PipelineError::Io(err),
        })
    }

    pub fn get(&self, reference: &ArtifactRef) -> Option<Artifact> {
        lock(&self.index).get(reference).cloned()
    }

    /// Extend an artifact's expiry to a full TTL from now.
    pub fn touch(&self, reference: &ArtifactRef) -> bool {
        match lock(&self.index).get_mut(reference) {
            Some(artifact) => {
                artifact.expires_at = Instant::now() + self.ttl;
                true
            }
            None => false,
        }
    }

    /// Remove an artifact. Returns whether anything was removed.
    pub async fn delete(&self, reference: &ArtifactRef) -> Result<bool, PipelineError> {
        let path = match lock(&self.index).get(reference) {
            Some(artifact) => artifact.path.clone(),
            None => return Ok(false),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            // Keep the index entry so the sweeper retries.
            Err(err) => return Err(err.into()),
        }
        lock(&self.index).remove(reference);
        debug!(artifact = %reference, "Deleted artifact");
        Ok(true)
    }

    /// Delete every artifact whose expiry is at or before `now`.
    pub async fn expire(&self, now: Instant) -> usize {
        let expired: Vec<ArtifactRef> = lock(&self.index)
            .values()
            .filter(|a| a.expires_at <= now)
            .map(|a| a.reference.clone())
            .collect();

        let mut deleted = 0;
        for reference in expired {
            match self.delete(&reference).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => warn!(artifact = %reference, error = %err, "Failed to delete expired artifact"),
            }
        }
        deleted
    }

    /// Remove files in the upload directory that this process does not know
    /// about and that are older than the TTL.
    pub async fn purge_orphans(&self) -> Result<usize, PipelineError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut purged = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if lock(&self.index).contains_key(&ArtifactRef::new(name.clone())) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .unwrap_or_default();
            if age < self.ttl {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => purged += 1,
                Err(err) => warn!(file = %name, error = %err, "Failed to purge orphaned upload"),
            }
        }
        if purged > 0 {
            info!(purged, dir = %self.dir.display(), "Purged orphaned uploads");
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        lock(&self.index).len()
    }

    pub fn total_bytes(&self) -> u64 {
        lock(&self.index).values().map(|a| a.size_bytes).sum()
    }
}

/// Keep only `.` plus ASCII alphanumerics so the extension cannot escape the directory.
fn sanitize_extension(extension: &str) -> String {
    let cleaned: String = extension
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_lowercase();
    if cleaned.is_empty() {
        String::new()
    } else {
        format!(".{}", cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    async fn store(ttl: Duration) -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open_dir(dir.path(), 1024, ttl).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_open_delete() {
        let (_dir, store) = store(Duration::from_secs(60)).await;
        let artifact = store.save(b"hello", ".wav").await.unwrap();
        assert!(artifact.reference.as_str().ends_with(".wav"));
        assert_eq!(artifact.size_bytes, 5);
        assert_eq!(
            artifact.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let mut contents = String::new();
        store
            .open(&artifact.reference)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello");

        assert!(store.delete(&artifact.reference).await.unwrap());
        assert!(!artifact.path.exists());
        // Second delete is a no-op, not an error.
        assert!(!store.delete(&artifact.reference).await.unwrap());
        assert!(matches!(
            store.open(&artifact.reference),
            Err(PipelineError::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_oversized_upload() {
        let (dir, store) = store(Duration::from_secs(60)).await;
        let err = store.save(&[0u8; 2048], ".wav").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ArtifactTooLarge { size: 2048, max: 1024 }
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_expire_and_touch() {
        let (_dir, store) = store(Duration::from_secs(10)).await;
        let kept = store.save(b"a", ".wav").await.unwrap();
        let dropped = store.save(b"b", ".wav").await.unwrap();

        let now = Instant::now();
        assert_eq!(store.expire(now).await, 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.touch(&kept.reference));
        // Past the original expiry but inside the renewed one for `kept`.
        let later = dropped.expires_at + Duration::from_millis(1);
        assert_eq!(store.expire(later).await, 1);
        assert!(store.get(&kept.reference).is_some());
        assert!(store.get(&dropped.reference).is_none());
        assert!(!dropped.path.exists());
    }

    #[tokio::test]
    async fn test_purge_orphans_ignores_known_and_fresh_files() {
        let (dir, store) = store(Duration::ZERO).await;
        let known = store.save(b"a", ".wav").await.unwrap();
        std::fs::write(dir.path().join("leftover.wav"), b"old").unwrap();

        assert_eq!(store.purge_orphans().await.unwrap(), 1);
        assert!(known.path.exists());
        assert!(!dir.path().join("leftover.wav").exists());
    }

    #[test]
    fn test_sanitize_extension() {
        assert_eq!(sanitize_extension(".WAV"), ".wav");
        assert_eq!(sanitize_extension("../../etc"), ".etc");
        assert_eq!(sanitize_extension(""), "");
    }
}
