use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use log::debug;

use crate::core::{Candidate, Result};
use crate::persist::PopulationStore;

/// In-memory store
///
/// Keeps snapshots and artifact bookkeeping in maps instead of on disk.
/// Useful for testing so runs don't interfere with a real artifact tree; it
/// also counts writes and deletions so tests can assert persistence effects.
#[derive(Default)]
pub struct MemoryStore {
    populations: Mutex<HashMap<String, Vec<Candidate>>>,
    deleted_artifacts: Mutex<Vec<(String, String)>>,
    exported: Mutex<Vec<(String, String, String)>>,
    save_count: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshot writes observed so far.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Labels whose artifacts were requested for deletion, for a user.
    pub fn deleted_labels(&self, user_name: &str) -> Vec<String> {
        self.deleted_artifacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, user)| user == user_name)
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Whether any deletion was requested more than once for the same label.
    pub fn has_duplicate_deletions(&self, user_name: &str) -> bool {
        let labels = self.deleted_labels(user_name);
        let unique: HashSet<_> = labels.iter().collect();
        unique.len() != labels.len()
    }

    /// Candidates exported via `export_candidate`, as (user, label, folder).
    pub fn exports(&self) -> Vec<(String, String, String)> {
        self.exported.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PopulationStore for MemoryStore {
    async fn save_population(&self, user_name: &str, population: &[Candidate]) -> Result<()> {
        self.populations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_name.to_string(), population.to_vec());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Stored in-memory snapshot for '{}' ({} candidates)",
            user_name,
            population.len()
        );
        Ok(())
    }

    async fn load_population(&self, user_name: &str) -> Result<Option<Vec<Candidate>>> {
        Ok(self
            .populations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_name)
            .cloned())
    }

    async fn delete_local_files(&self, user_name: &str) -> Result<()> {
        self.populations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_name);
        Ok(())
    }

    async fn delete_artifact(&self, label: &str, user_name: &str) -> Result<()> {
        self.deleted_artifacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((label.to_string(), user_name.to_string()));
        Ok(())
    }

    async fn export_candidate(&self, user_name: &str, label: &str, folder: &str) -> Result<()> {
        self.exported.lock().unwrap_or_else(|e| e.into_inner()).push((
            user_name.to_string(),
            label.to_string(),
            folder.to_string(),
        ));
        Ok(())
    }

    fn population_path(&self, user_name: &str) -> PathBuf {
        PathBuf::from(format!("memory://{}/population.json", user_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_counts_saves() {
        let store = MemoryStore::new();
        let population = vec![Candidate::new(1, serde_json::json!(null))];

        store.save_population("alice", &population).await.unwrap();
        store.save_population("alice", &population).await.unwrap();

        assert_eq!(store.save_count(), 2);
        assert!(store.load_population("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_store_tracks_deletions() {
        let store = MemoryStore::new();

        store.delete_artifact("Candidate1", "bob").await.unwrap();
        store.delete_artifact("Candidate3", "bob").await.unwrap();

        assert_eq!(store.deleted_labels("bob"), vec!["Candidate1", "Candidate3"]);
        assert!(!store.has_duplicate_deletions("bob"));
    }
}
