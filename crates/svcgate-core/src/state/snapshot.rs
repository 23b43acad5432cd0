// # Snapshot Store
//
// Persists the entry table so a restarted core resumes where it stopped.
//
// ## Crash Recovery
//
// - Atomic writes: write to `<path>.tmp`, then rename over the main file
// - Backup: the previous main file is copied to `<path>.backup` first
// - Recovery: a missing, corrupt or unknown-version main file falls back to
//   the backup, and a bad backup falls back to an empty table
//
// ## File Format
//
// ```json
// {
//   "version": 1,
//   "entries": {
//     "svc1": {
//       "name": "svc1",
//       "step": "provisioner.dns",
//       "expected": "deployed",
//       "in_flight": true,
//       ...
//     }
//   }
// }
// ```

use crate::Error;
use crate::engine::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotFile {
    version: u32,
    entries: BTreeMap<String, Entry>,
}

/// File-backed snapshot of the entry table
///
/// # Example
///
/// ```rust,no_run
/// use svcgate_core::state::SnapshotStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = SnapshotStore::new("/var/lib/svcgate/entries.json");
///     let entries = store.load().await;
///     store.save(&entries).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Create a store for `path`; nothing is read or written yet
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Main snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load entries, falling back to the backup and then to nothing
    ///
    /// Never fails: every problem is logged and the next source is tried.
    pub async fn load(&self) -> Vec<Entry> {
        if !self.path.exists() && !self.backup_path().exists() {
            tracing::debug!("No snapshot at {}, starting empty", self.path.display());
            return Vec::new();
        }

        match Self::read(&self.path).await {
            Ok(entries) => {
                tracing::info!("Loaded snapshot: {} entries", entries.len());
                return entries;
            }
            Err(e) => {
                tracing::warn!("Snapshot unreadable: {}. Trying backup.", e);
            }
        }

        let backup = self.backup_path();
        match Self::read(&backup).await {
            Ok(entries) => {
                tracing::info!("Recovered snapshot from backup: {} entries", entries.len());
                entries
            }
            Err(e) => {
                tracing::error!("Backup unreadable: {}. Starting with an empty table.", e);
                Vec::new()
            }
        }
    }

    async fn read(path: &Path) -> Result<Vec<Entry>, Error> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::snapshot(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let file: SnapshotFile = serde_json::from_str(&content).map_err(|e| {
            Error::snapshot(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        if file.version != SNAPSHOT_VERSION {
            return Err(Error::snapshot(format!(
                "{} has version {}, expected {}",
                path.display(),
                file.version,
                SNAPSHOT_VERSION
            )));
        }

        Ok(file
            .entries
            .into_iter()
            .map(|(name, mut entry)| {
                entry.name = name;
                if entry.announced.name.is_empty() {
                    entry.announced = entry.service.clone();
                }
                entry
            })
            .collect())
    }

    /// Write entries atomically, keeping the previous file as backup
    pub async fn save(&self, entries: &[Entry]) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::snapshot(format!(
                        "Failed to create snapshot directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            entries: entries
                .iter()
                .map(|entry| (entry.name.clone(), entry.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let temp_path = self.temp_path();
        {
            let mut out = fs::File::create(&temp_path).await.map_err(|e| {
                Error::snapshot(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            out.write_all(json.as_bytes()).await?;
            out.flush().await?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, self.backup_path()).await {
                tracing::warn!("Failed to create snapshot backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::snapshot(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("Snapshot written: {} ({} entries)", self.path.display(), entries.len());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    /// Backup file kept next to the main file
    pub fn backup_path(&self) -> PathBuf {
        let mut backup = self.path.clone();
        backup.set_extension("backup");
        backup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Service;
    use chrono::Utc;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    fn entry(name: &str, step: &str) -> Entry {
        let mut entry = Entry::new(Service::new(name), Utc::now());
        entry.step = step.to_string();
        entry
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("entries.json"));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_keeps_entries() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested/entries.json"));

        let mut svc1 = entry("svc1", "provisioner.ipam");
        svc1.in_flight = true;
        assert_ok!(store.save(&[svc1.clone(), entry("svc2", "deployed")]).await);

        let mut loaded = store.load().await;
        loaded.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], svc1);
        assert_eq!(loaded[1].step, "deployed");
    }

    #[tokio::test]
    async fn corrupt_file_recovers_previous_state_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.json");
        let store = SnapshotStore::new(&path);

        store.save(&[entry("svc1", "provisioner.ipam")]).await.unwrap();
        store.save(&[entry("svc1", "provisioner.dns")]).await.unwrap();
        assert!(store.backup_path().exists());

        fs::write(&path, b"{ not json").await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].step, "provisioner.ipam");
    }

    #[tokio::test]
    async fn missing_announced_descriptor_falls_back_to_service() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.json");
        let mut value = serde_json::to_value(SnapshotFile {
            version: SNAPSHOT_VERSION,
            entries: BTreeMap::from([(
                "svc1".to_string(),
                Entry::new(Service::new("svc1").with_tls(true), Utc::now()),
            )]),
        })
        .unwrap();
        value["entries"]["svc1"]
            .as_object_mut()
            .unwrap()
            .remove("announced");
        fs::write(&path, value.to_string()).await.unwrap();

        let loaded = SnapshotStore::new(&path).load().await;
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].announced.tls);
        assert_eq!(loaded[0].announced, loaded[0].service);
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.json");
        fs::write(&path, br#"{"version": 7, "entries": {}}"#).await.unwrap();

        let store = SnapshotStore::new(&path);
        assert!(store.load().await.is_empty());
        assert_err!(SnapshotStore::read(&path).await);
    }
}
