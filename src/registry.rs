use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::sync::RwLock;

use crate::core::{EvoError, Result};

/// Registry record for one user's run.
pub struct RunEntry {
    user_name: String,
    running: AtomicBool,
    parent: Option<String>,
    last_contact: std::sync::RwLock<DateTime<Utc>>,
}

impl RunEntry {
    fn new(user_name: &str, parent: Option<String>) -> Self {
        Self {
            user_name: user_name.to_string(),
            running: AtomicBool::new(false),
            parent,
            last_contact: std::sync::RwLock::new(Utc::now()),
        }
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Parent run this entry was branched from, if any.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn last_contact(&self) -> DateTime<Utc> {
        *self.last_contact.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn touch(&self) {
        let mut guard = self.last_contact.write().unwrap_or_else(|e| e.into_inner());
        *guard = Utc::now();
    }

    fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_contact())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Per-user run registry
///
/// Tracks run existence, the running flag, parentage, and last-contact time.
/// Structural mutations (register/remove) take the write lock and exclude
/// each other; per-user lookups share the read lock and never contend with
/// one another. The per-entry flags are atomics, so status updates for one
/// run don't serialize lookups of another.
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunEntry>>>,
    max_users: usize,
}

impl RunRegistry {
    pub fn new(max_users: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            max_users,
        }
    }

    /// Register a run for a user. Idempotent; rejects above capacity without
    /// disturbing existing entries.
    pub async fn register(&self, user_name: &str) -> Result<Arc<RunEntry>> {
        self.register_with_parent(user_name, None).await
    }

    /// Register a branched run carrying parentage metadata.
    pub async fn register_with_parent(
        &self,
        user_name: &str,
        parent: Option<String>,
    ) -> Result<Arc<RunEntry>> {
        let mut runs = self.runs.write().await;

        if let Some(existing) = runs.get(user_name) {
            return Ok(Arc::clone(existing));
        }

        if runs.len() >= self.max_users {
            return Err(EvoError::CapacityExhausted {
                max_users: self.max_users,
            });
        }

        let entry = Arc::new(RunEntry::new(user_name, parent));
        runs.insert(user_name.to_string(), Arc::clone(&entry));
        info!("Registered run for '{}' ({}/{})", user_name, runs.len(), self.max_users);
        Ok(entry)
    }

    pub async fn exists(&self, user_name: &str) -> bool {
        self.runs.read().await.contains_key(user_name)
    }

    pub async fn is_running(&self, user_name: &str) -> bool {
        match self.runs.read().await.get(user_name) {
            Some(entry) => entry.is_running(),
            None => false,
        }
    }

    /// Set the running flag, auto-registering the user if absent.
    pub async fn set_running(&self, user_name: &str, running: bool) -> Result<()> {
        if let Some(entry) = self.get(user_name).await {
            entry.set_running(running);
            return Ok(());
        }
        let entry = self.register(user_name).await?;
        entry.set_running(running);
        Ok(())
    }

    pub async fn get(&self, user_name: &str) -> Option<Arc<RunEntry>> {
        self.runs.read().await.get(user_name).cloned()
    }

    /// Refresh a user's last-contact time. Unknown users are ignored.
    pub async fn touch(&self, user_name: &str) {
        if let Some(entry) = self.runs.read().await.get(user_name) {
            entry.touch();
        }
    }

    /// Users whose last contact is older than the threshold.
    pub async fn stale_runs(&self, threshold: Duration) -> Vec<String> {
        self.runs
            .read()
            .await
            .values()
            .filter(|entry| entry.idle_for() >= threshold)
            .map(|entry| entry.user_name.clone())
            .collect()
    }

    /// Remove a run from the registry, returning its entry.
    ///
    /// Callers release the run's resources (worker, execution-slot budget,
    /// subscriptions) before removal; see `Coordinator::evict_stale_runs`.
    pub async fn remove(&self, user_name: &str) -> Option<Arc<RunEntry>> {
        let removed = self.runs.write().await.remove(user_name);
        if removed.is_some() {
            debug!("Removed run entry for '{}'", user_name);
        }
        removed
    }

    /// Remove every stale run and return the evicted entries.
    pub async fn evict_stale(&self, threshold: Duration) -> Vec<Arc<RunEntry>> {
        let mut runs = self.runs.write().await;
        let stale: Vec<String> = runs
            .values()
            .filter(|entry| entry.idle_for() >= threshold)
            .map(|entry| entry.user_name.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for user in stale {
            if let Some(entry) = runs.remove(&user) {
                info!("Evicted stale run '{}'", user);
                evicted.push(entry);
            }
        }
        evicted
    }

    pub async fn stats(&self) -> RegistryStats {
        let runs = self.runs.read().await;
        let running = runs.values().filter(|entry| entry.is_running()).count();

        RegistryStats {
            total_runs: runs.len(),
            running_runs: running,
            max_users: self.max_users,
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_runs: usize,
    pub running_runs: usize,
    pub max_users: usize,
}

impl std::fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Registry Stats: {}/{} runs, {} running",
            self.total_runs, self.max_users, self.running_runs
        )
    }
}
