// Watch-List Store
//
// Persisted set of VMIDs the monitor sweeps. The file is a JSON array of
// integers, rewritten through a temp file and rename on every change.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};

pub struct WatchListStore {
    path: PathBuf,
    /// Last persisted contents. Readers clone from here without waiting on I/O.
    entries: RwLock<Vec<u32>>,
    /// Serializes read-modify-persist cycles.
    write_lock: Mutex<()>,
}

impl WatchListStore {
    /// Open the store at `path`. When the file is absent it is created from
    /// `seed` right away, so the seed is applied at most once per file.
    pub async fn open(path: impl Into<PathBuf>, seed: &[u32]) -> Result<Self> {
        let path = path.into();

        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let stored: Vec<u32> = serde_json::from_str(&content)?;
                let entries = dedup(stored.iter().copied());
                if entries.len() != stored.len() {
                    warn!("Dropped duplicate entries from {}", path.display());
                }
                info!("Loaded {} watched resources from {}", entries.len(), path.display());
                entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let entries = dedup(seed.iter().copied());
                persist(&path, &entries).await?;
                info!("Seeded watch-list {} with {} resources", path.display(), entries.len());
                entries
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current members in insertion order
    pub fn list(&self) -> Vec<u32> {
        self.read().clone()
    }

    pub fn contains(&self, vmid: u32) -> bool {
        self.read().contains(&vmid)
    }

    /// Returns false when `vmid` is already watched.
    pub async fn add(&self, vmid: u32) -> Result<bool> {
        self.mutate(|entries| {
            if entries.contains(&vmid) {
                return false;
            }
            entries.push(vmid);
            true
        })
        .await
    }

    /// Returns false when `vmid` was not watched.
    pub async fn remove(&self, vmid: u32) -> Result<bool> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|v| *v != vmid);
            entries.len() != before
        })
        .await
    }

    async fn mutate<F>(&self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut Vec<u32>) -> bool,
    {
        let _guard = self.write_lock.lock().await;

        let mut next = self.list();
        if !change(&mut next) {
            return Ok(false);
        }

        // Memory only follows the file once the rename has landed
        persist(&self.path, &next).await?;
        *self.entries.write().unwrap_or_else(|p| p.into_inner()) = next;
        Ok(true)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<u32>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }
}

fn dedup(ids: impl Iterator<Item = u32>) -> Vec<u32> {
    let mut out: Vec<u32> = Vec::new();
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// Write `entries` next to `path` and rename over it.
async fn persist(path: &Path, entries: &[u32]) -> Result<()> {
    let content = serde_json::to_string_pretty(entries)?;

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| {
            OrchestratorError::Storage(format!("invalid watch-list path: {}", path.display()))
        })?;
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let dir = parent_dir(path);
    tokio::fs::create_dir_all(dir).await?;

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(content.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    // The rename is only durable once the directory entry is flushed
    sync_dir(dir).await
}

/// Directory holding `path`; a bare file name lives in the working directory.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

// Directories cannot be opened as files here
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn read_file(path: &Path) -> Vec<u32> {
        let content = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn test_seeds_once_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor_list.json");

        let store = WatchListStore::open(&path, &[100, 101, 100]).await.unwrap();
        assert_eq!(store.list(), vec![100, 101]);
        assert_eq!(read_file(&path), vec![100, 101]);

        store.remove(100).await.unwrap();
        drop(store);

        // The seed must not come back once the file exists
        let reopened = WatchListStore::open(&path, &[100, 101]).await.unwrap();
        assert_eq!(reopened.list(), vec![101]);
    }

    #[tokio::test]
    async fn test_empty_list_is_not_reseeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor_list.json");

        let store = WatchListStore::open(&path, &[100]).await.unwrap();
        store.remove(100).await.unwrap();
        drop(store);

        let reopened = WatchListStore::open(&path, &[100]).await.unwrap();
        assert!(reopened.list().is_empty());
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = WatchListStore::open(dir.path().join("w.json"), &[]).await.unwrap();

        assert!(store.add(100).await.unwrap());
        assert!(!store.add(100).await.unwrap());
        assert_eq!(store.list(), vec![100]);
        assert_eq!(read_file(store.path()), vec![100]);
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = WatchListStore::open(dir.path().join("w.json"), &[100, 101]).await.unwrap();
        let before = store.list();

        assert!(store.add(205).await.unwrap());
        assert!(store.contains(205));
        assert!(store.remove(205).await.unwrap());

        assert_eq!(store.list(), before);
        assert_eq!(read_file(store.path()), before);
        assert!(!store.remove(205).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_adds_never_lose_or_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WatchListStore::open(dir.path().join("w.json"), &[]).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20u32 {
            let store = store.clone();
            // Every id is requested twice
            handles.push(tokio::spawn(async move { store.add(100 + i % 10).await.unwrap() }));
        }
        let added = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(added, 10);
        let mut on_disk = read_file(store.path());
        on_disk.sort_unstable();
        assert_eq!(on_disk, (100..110).collect::<Vec<u32>>());
        assert_eq!(store.list().len(), 10);
    }

    #[tokio::test]
    async fn test_persist_targets_containing_directory() {
        assert_eq!(parent_dir(Path::new("monitor_list.json")), Path::new("."));
        assert_eq!(
            parent_dir(Path::new("/var/lib/proxguard/monitor_list.json")),
            Path::new("/var/lib/proxguard")
        );

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state").join("monitor_list.json");
        persist(&nested, &[100]).await.unwrap();
        assert_eq!(read_file(&nested), vec![100]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_directory_sync_reports_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sync_dir(dir.path()).await.is_ok());
        let missing = sync_dir(&dir.path().join("gone")).await;
        assert!(matches!(missing, Err(OrchestratorError::Storage(_))));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = WatchListStore::open(dir.path().join("w.json"), &[1]).await.unwrap();
        store.add(2).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["w.json".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.json");
        std::fs::write(&path, "[100, 10").unwrap();

        let result = WatchListStore::open(&path, &[100]).await;
        assert!(matches!(result, Err(OrchestratorError::Storage(_))));
        // Seed must not overwrite what the operator has on disk
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[100, 10");
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.json");
        let store = WatchListStore::open(&path, &[100]).await.unwrap();

        // A directory squatting on the temp name makes the write fail
        std::fs::create_dir(dir.path().join("w.json.tmp")).unwrap();

        assert!(store.add(101).await.is_err());
        assert_eq!(store.list(), vec![100]);
        assert_eq!(read_file(&path), vec![100]);
    }
}
