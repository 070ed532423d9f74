pub mod memory;

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;

use crate::core::{Candidate, EvoError, Result};

pub use memory::MemoryStore;

/// Persistence collaborator for population snapshots and derived artifacts
///
/// File-format details are the implementation's concern; the coordination
/// core only decides when snapshots are written, loaded, and deleted.
#[async_trait]
pub trait PopulationStore: Send + Sync {
    /// Write the current population snapshot for a user.
    async fn save_population(&self, user_name: &str, population: &[Candidate]) -> Result<()>;

    /// Load the last persisted snapshot, if one exists.
    async fn load_population(&self, user_name: &str) -> Result<Option<Vec<Candidate>>>;

    /// Delete the snapshot and all derived artifacts of a user's run.
    async fn delete_local_files(&self, user_name: &str) -> Result<()>;

    /// Delete the derived artifact bound to a vacated slot label.
    async fn delete_artifact(&self, label: &str, user_name: &str) -> Result<()>;

    /// Export one candidate's artifact into a named folder.
    async fn export_candidate(&self, user_name: &str, label: &str, folder: &str) -> Result<()>;

    /// Location of the user's population snapshot.
    fn population_path(&self, user_name: &str) -> PathBuf;
}

/// Filesystem-backed store writing JSON snapshots
///
/// Snapshots are written to a temp file in the target directory and renamed
/// into place, so readers never observe a partial write.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn user_dir(&self, user_name: &str) -> PathBuf {
        self.root.join(user_name)
    }

    fn artifact_path(&self, user_name: &str, label: &str) -> PathBuf {
        self.user_dir(user_name).join(format!("{}.json", label))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| EvoError::Persistence(format!("no parent dir for {:?}", path)))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(path)
            .map_err(|err| EvoError::Persistence(format!("snapshot rename: {}", err)))?;
        Ok(())
    }
}

#[async_trait]
impl PopulationStore for FileStore {
    async fn save_population(&self, user_name: &str, population: &[Candidate]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(population)?;
        self.write_atomic(&self.population_path(user_name), &bytes)?;
        debug!(
            "Saved population snapshot for '{}' ({} candidates)",
            user_name,
            population.len()
        );
        Ok(())
    }

    async fn load_population(&self, user_name: &str) -> Result<Option<Vec<Candidate>>> {
        let path = self.population_path(user_name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let population = serde_json::from_slice(&bytes)?;
        Ok(Some(population))
    }

    async fn delete_local_files(&self, user_name: &str) -> Result<()> {
        let dir = self.user_dir(user_name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    async fn delete_artifact(&self, label: &str, user_name: &str) -> Result<()> {
        let path = self.artifact_path(user_name, label);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        debug!("Deleted artifact '{}' for '{}'", label, user_name);
        Ok(())
    }

    async fn export_candidate(&self, user_name: &str, label: &str, folder: &str) -> Result<()> {
        let source = self.artifact_path(user_name, label);
        let target_dir = self.root.join(folder);
        std::fs::create_dir_all(&target_dir)?;
        let target = target_dir.join(format!("{}.json", label));
        if source.exists() {
            std::fs::copy(&source, &target)?;
        } else {
            // No rendered artifact yet; export an empty marker so the save
            // request is still visible to the user.
            self.write_atomic(&target, b"{}")?;
        }
        Ok(())
    }

    fn population_path(&self, user_name: &str) -> PathBuf {
        self.user_dir(user_name).join("population.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u64) -> Candidate {
        Candidate::new(id, serde_json::json!({ "genes": [id] }))
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let population = vec![candidate(1), candidate(2)];
        store.save_population("alice", &population).await.unwrap();

        let loaded = store.load_population("alice").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, 1);
        assert_eq!(loaded[1].id, 2);
    }

    #[tokio::test]
    async fn test_load_missing_population() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.load_population("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_local_files_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.save_population("bob", &[candidate(7)]).await.unwrap();
        assert!(store.population_path("bob").exists());

        store.delete_local_files("bob").await.unwrap();
        assert!(!store.population_path("bob").exists());
        assert!(store.load_population("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_export_candidate_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store
            .export_candidate("carol", "Candidate3", "favorites")
            .await
            .unwrap();

        assert!(dir.path().join("favorites").join("Candidate3.json").exists());
    }
}
