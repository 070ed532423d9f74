use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::EvolveConfig;
use crate::core::{EvoError, Result, RunEvent, RunObserver};
use crate::engine::{FitnessEvaluator, Reproducer};
use crate::lifecycle::RunLifecycle;
use crate::persist::PopulationStore;
use crate::registry::RunRegistry;

/// Command-to-lifecycle coordinator
///
/// Resolves external commands against the registry and the per-run
/// lifecycles, and owns the per-run notification wiring. One instance serves
/// every user; failures in one user's command handling never affect another.
pub struct Coordinator {
    config: EvolveConfig,
    registry: Arc<RunRegistry>,
    store: Arc<dyn PopulationStore>,
    reproducer: Arc<dyn Reproducer>,
    evaluator: Arc<dyn FitnessEvaluator>,
    lifecycles: RwLock<HashMap<String, RunLifecycle>>,
    subscribed: RwLock<HashSet<String>>,
    /// Per-user command serialization; commands for distinct users never
    /// contend with each other. Entries live only while held or contended.
    command_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Coordinator {
    pub fn new(
        config: EvolveConfig,
        store: Arc<dyn PopulationStore>,
        reproducer: Arc<dyn Reproducer>,
        evaluator: Arc<dyn FitnessEvaluator>,
    ) -> Result<Self> {
        config.validate().map_err(EvoError::Configuration)?;
        let registry = Arc::new(RunRegistry::new(config.max_users));
        Ok(Self {
            config,
            registry,
            store,
            reproducer,
            evaluator,
            lifecycles: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(HashSet::new()),
            command_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Start (or resume) evolution for a user.
    ///
    /// Absent run: admit, build, initialize with a fresh population, start.
    /// Present but stopped: re-initialize from the last persisted snapshot,
    /// then start. Present and running: no-op. Returns an error when no
    /// run-capacity slot is free even after evicting stale runs.
    pub async fn start_evolution(&self, user_name: &str) -> Result<()> {
        let lock = self.user_lock(user_name).await;
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(user_name).await
        };
        drop(lock);
        self.release_user_lock(user_name).await;
        result
    }

    async fn start_locked(&self, user_name: &str) -> Result<()> {
        self.registry.touch(user_name).await;

        if self.registry.is_running(user_name).await {
            info!("Start for '{}' ignored: already running", user_name);
            return Ok(());
        }

        if !self.registry.exists(user_name).await {
            self.admit(user_name, None).await?;
        }

        let lifecycle = self.lifecycle_for(user_name).await;
        let lifecycle = match lifecycle {
            Some(existing) => {
                // Stopped run: rebuild state from the persisted snapshot by
                // replacing the lifecycle wholesale, so a terminated or
                // faulted worker can't leak into the restart.
                self.teardown_lifecycle(user_name, &existing).await;
                self.build_lifecycle(user_name, true).await?
            }
            None => self.build_lifecycle(user_name, true).await?,
        };

        lifecycle.start().await?;
        self.ensure_subscribed(user_name, &lifecycle).await;
        self.persist_if_running(user_name, &lifecycle).await;
        Ok(())
    }

    /// Stop a user's run cooperatively.
    ///
    /// The snapshot is written while the run is still marked running, then
    /// the running flag is cleared immediately so a subsequent Start is not
    /// blocked by an unparked worker, then the pause request is posted. Does
    /// not block on the worker parking.
    pub async fn stop_evolution(&self, user_name: &str) {
        let lock = self.user_lock(user_name).await;
        {
            let _guard = lock.lock().await;
            self.stop_locked(user_name).await;
        }
        drop(lock);
        self.release_user_lock(user_name).await;
    }

    async fn stop_locked(&self, user_name: &str) {
        self.registry.touch(user_name).await;

        let Some(lifecycle) = self.lifecycle_for(user_name).await else {
            info!("Stop for unknown run '{}' ignored", user_name);
            return;
        };

        if !self.registry.is_running(user_name).await {
            info!("Stop for '{}' ignored: not running", user_name);
            return;
        }

        self.persist_if_running(user_name, &lifecycle).await;
        let _ = self.registry.set_running(user_name, false).await;
        lifecycle.request_pause();
    }

    /// Stop, delete the persisted snapshot and derived artifacts, then start
    /// over with a fresh population.
    pub async fn reset_evolution(&self, user_name: &str) -> Result<()> {
        let lock = self.user_lock(user_name).await;
        let result = {
            let _guard = lock.lock().await;
            self.reset_locked(user_name).await
        };
        drop(lock);
        self.release_user_lock(user_name).await;
        result
    }

    async fn reset_locked(&self, user_name: &str) -> Result<()> {
        self.registry.touch(user_name).await;
        info!("Resetting run for '{}'", user_name);

        if let Some(lifecycle) = self.lifecycle_for(user_name).await {
            self.registry.set_running(user_name, false).await?;
            lifecycle.request_pause_and_wait().await;
        }

        self.store.delete_local_files(user_name).await?;

        if !self.registry.exists(user_name).await {
            self.admit(user_name, None).await?;
        }
        if let Some(existing) = self.lifecycle_for(user_name).await {
            self.teardown_lifecycle(user_name, &existing).await;
        }
        let lifecycle = self.build_lifecycle(user_name, false).await?;
        lifecycle.start().await?;
        self.ensure_subscribed(user_name, &lifecycle).await;
        self.persist_if_running(user_name, &lifecycle).await;
        Ok(())
    }

    /// Branch a run: stop the parent, wait out a short grace delay, then
    /// start a new run under a derived userName carrying parentage metadata
    /// and the parent's last persisted population.
    pub async fn branch(&self, user_name: &str) -> Result<String> {
        let lock = self.user_lock(user_name).await;
        let result = {
            let _guard = lock.lock().await;
            self.branch_locked(user_name).await
        };
        drop(lock);
        self.release_user_lock(user_name).await;
        result
    }

    async fn branch_locked(&self, user_name: &str) -> Result<String> {
        self.registry.touch(user_name).await;

        if !self.registry.exists(user_name).await {
            info!("Branch for unknown run '{}' ignored", user_name);
            return Err(EvoError::Configuration(format!(
                "no run to branch for '{}'",
                user_name
            )));
        }

        self.stop_locked(user_name).await;
        tokio::time::sleep(self.config.branch_grace).await;

        let branch_name = format!(
            "{}_branch_{}",
            user_name,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        self.admit(&branch_name, Some(user_name.to_string())).await?;

        let population = match self.store.load_population(user_name).await? {
            Some(snapshot) => snapshot,
            None => {
                self.reproducer
                    .create_population(self.config.population_size)
                    .await?
            }
        };
        self.store.save_population(&branch_name, &population).await?;

        let lifecycle = self.build_lifecycle(&branch_name, true).await?;
        lifecycle.start().await?;
        self.ensure_subscribed(&branch_name, &lifecycle).await;

        info!("Branched '{}' into '{}'", user_name, branch_name);
        Ok(branch_name)
    }

    /// Record a user's candidate pick for the next generation. Deliverable
    /// only once the run's lifecycle handle exists; otherwise a logged no-op.
    pub async fn request_next_generation(
        &self,
        user_name: &str,
        candidate_index: usize,
        is_normal_mutations: bool,
    ) {
        self.registry.touch(user_name).await;

        let Some(lifecycle) = self.lifecycle_for(user_name).await else {
            info!("Next-generation request for unknown run '{}' ignored", user_name);
            return;
        };
        self.ensure_subscribed(user_name, &lifecycle).await;
        lifecycle
            .request_next_generation(candidate_index, is_normal_mutations)
            .await;
    }

    /// Export one candidate's artifact into a folder. Logged no-op for an
    /// unknown run.
    pub async fn save_candidate(&self, user_name: &str, candidate_index: usize, folder: &str) {
        self.registry.touch(user_name).await;

        let Some(lifecycle) = self.lifecycle_for(user_name).await else {
            info!("Save request for unknown run '{}' ignored", user_name);
            return;
        };
        self.ensure_subscribed(user_name, &lifecycle).await;
        if let Err(err) = lifecycle.save_candidate(candidate_index, folder).await {
            warn!("Saving candidate for '{}' failed: {}", user_name, err);
        }
    }

    /// Release every resource of a run, then drop its registry entry.
    /// Ordering matters: budget and subscriptions go before removal, so
    /// nothing fires for an evicted run.
    pub async fn evict_run(&self, user_name: &str) {
        if let Some(lifecycle) = self.lifecycles.write().await.remove(user_name) {
            lifecycle.unsubscribe_all();
            lifecycle.request_terminate_and_wait().await;
        }
        self.subscribed.write().await.remove(user_name);
        self.registry.remove(user_name).await;
        self.release_user_lock(user_name).await;
        info!("Evicted run '{}'", user_name);
    }

    /// Number of per-user command locks currently allocated. Locks exist
    /// only while a command is in flight or contended, so this tracks
    /// activity rather than the set of userNames ever seen.
    pub async fn command_lock_count(&self) -> usize {
        self.command_locks.lock().await.len()
    }

    pub async fn lifecycle_for(&self, user_name: &str) -> Option<RunLifecycle> {
        self.lifecycles.read().await.get(user_name).cloned()
    }

    async fn user_lock(&self, user_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.command_locks.lock().await;
        Arc::clone(
            locks
                .entry(user_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop a user's command lock once no task holds a handle to it. The
    /// map mutex covers both the clone in `user_lock` and this removal, so
    /// an entry is only dropped when the map holds the last handle; a
    /// contended lock stays until its holders finish.
    async fn release_user_lock(&self, user_name: &str) {
        let mut locks = self.command_locks.lock().await;
        if let Some(lock) = locks.get(user_name) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(user_name);
            }
        }
    }

    /// Admit a new run, evicting stale runs on demand when at capacity.
    async fn admit(&self, user_name: &str, parent: Option<String>) -> Result<()> {
        match self
            .registry
            .register_with_parent(user_name, parent.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(EvoError::CapacityExhausted { .. }) => {
                let stale = self.registry.stale_runs(self.config.contact_timeout).await;
                for user in stale {
                    self.evict_run(&user).await;
                }
                self.registry
                    .register_with_parent(user_name, parent)
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    /// Build and register a lifecycle, initialized from the persisted
    /// snapshot when allowed and present, otherwise from a fresh population.
    async fn build_lifecycle(&self, user_name: &str, allow_snapshot: bool) -> Result<RunLifecycle> {
        let lifecycle = RunLifecycle::new(
            user_name,
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
        );

        let snapshot = if allow_snapshot {
            self.store.load_population(user_name).await?
        } else {
            None
        };
        let population = match snapshot {
            Some(population) if !population.is_empty() => {
                debug!(
                    "Restoring '{}' from snapshot ({} candidates)",
                    user_name,
                    population.len()
                );
                population
            }
            _ => {
                self.reproducer
                    .create_population(self.config.population_size)
                    .await?
            }
        };

        lifecycle
            .initialize(
                Arc::clone(&self.reproducer),
                Arc::clone(&self.evaluator),
                population,
            )
            .await?;

        self.lifecycles
            .write()
            .await
            .insert(user_name.to_string(), lifecycle.clone());
        Ok(lifecycle)
    }

    async fn teardown_lifecycle(&self, user_name: &str, lifecycle: &RunLifecycle) {
        lifecycle.unsubscribe_all();
        lifecycle.request_terminate_and_wait().await;
        self.lifecycles.write().await.remove(user_name);
        self.subscribed.write().await.remove(user_name);
    }

    /// Attach the coordinator's per-run listener the first time this run is
    /// observed; never duplicated for the same userName.
    async fn ensure_subscribed(&self, user_name: &str, lifecycle: &RunLifecycle) {
        {
            let subscribed = self.subscribed.read().await;
            if subscribed.contains(user_name) {
                return;
            }
        }
        let mut subscribed = self.subscribed.write().await;
        if subscribed.insert(user_name.to_string()) {
            lifecycle.subscribe(Arc::new(UpdateLogger));
            debug!("Subscribed coordinator listener for '{}'", user_name);
        }
    }

    /// Post-command snapshot write, gated on the running flag at the moment
    /// of the write. Check-then-write by design; an extra write racing a
    /// concurrent Stop is tolerated.
    async fn persist_if_running(&self, user_name: &str, lifecycle: &RunLifecycle) {
        if !self.registry.is_running(user_name).await {
            return;
        }
        let population = lifecycle.population_snapshot().await;
        if let Err(err) = self.store.save_population(user_name, &population).await {
            warn!("Post-command snapshot for '{}' failed: {}", user_name, err);
        }
    }
}

/// Coordinator-attached listener logging run progress.
struct UpdateLogger;

impl RunObserver for UpdateLogger {
    fn on_event(&self, user_name: &str, event: &RunEvent) -> Result<()> {
        match event {
            RunEvent::Updated {
                generation,
                best_fitness,
            } => {
                info!(
                    "Run '{}' reached generation {} (best fitness {:.3})",
                    user_name, generation, best_fitness
                );
            }
            RunEvent::Paused => {
                info!("Run '{}' paused", user_name);
            }
        }
        Ok(())
    }
}
