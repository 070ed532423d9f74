use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;

use crate::config::EvolveConfig;
use crate::core::{
    Candidate, EvoError, Result, RunEvent, RunObserver, RunState, SelectionRequest, UpdatePolicy,
};
use crate::engine::{FitnessEvaluator, Reproducer};
use crate::evaluator::BoundedEvaluator;
use crate::persist::PopulationStore;
use crate::registry::RunRegistry;
use crate::slots::{SlotAssigner, SlotAssignment, SlotTable};

/// State machine and worker for one user's run
///
/// Exactly one worker task exists per run. Pause is cooperative: the flags
/// are observed only between generation steps, never mid-batch. Termination
/// is absorbing and suppresses the `Paused` notification.
#[derive(Clone)]
pub struct RunLifecycle {
    inner: Arc<RunInner>,
}

struct RunInner {
    user_name: String,
    config: EvolveConfig,
    registry: Arc<RunRegistry>,
    store: Arc<dyn PopulationStore>,

    state: StdMutex<RunState>,
    generation: AtomicU64,
    pause_requested: AtomicBool,
    terminate_requested: AtomicBool,
    resume_notify: Notify,
    /// Single-slot acknowledgement raised when the worker actually parks.
    pause_ack: StdMutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    observers: StdRwLock<Vec<Arc<dyn RunObserver>>>,

    bounded: BoundedEvaluator,
    shared: Mutex<RunShared>,
    last_update: StdMutex<Instant>,
}

/// Mutable per-run search state, locked once per generation step.
#[derive(Default)]
struct RunShared {
    reproducer: Option<Arc<dyn Reproducer>>,
    evaluator: Option<Arc<dyn FitnessEvaluator>>,
    population: Vec<Candidate>,
    slot_table: SlotTable,
    champion: Option<(u64, f64)>,
    selection: Option<SelectionRequest>,
}

impl RunLifecycle {
    pub fn new(
        user_name: &str,
        config: EvolveConfig,
        registry: Arc<RunRegistry>,
        store: Arc<dyn PopulationStore>,
    ) -> Self {
        let bounded = BoundedEvaluator::new(config.slots_per_run, config.decode_cache_size);
        Self {
            inner: Arc::new(RunInner {
                user_name: user_name.to_string(),
                config,
                registry,
                store,
                state: StdMutex::new(RunState::NotReady),
                generation: AtomicU64::new(0),
                pause_requested: AtomicBool::new(false),
                terminate_requested: AtomicBool::new(false),
                resume_notify: Notify::new(),
                pause_ack: StdMutex::new(None),
                worker: Mutex::new(None),
                observers: StdRwLock::new(Vec::new()),
                bounded,
                shared: Mutex::new(RunShared::default()),
                last_update: StdMutex::new(Instant::now()),
            }),
        }
    }

    pub fn user_name(&self) -> &str {
        &self.inner.user_name
    }

    pub fn state(&self) -> RunState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Wire in the collaborators and the starting population: NotReady -> Ready.
    ///
    /// A population restored from a snapshot keeps its slots and labels; a
    /// fresh population gets its initial slot assignment here.
    pub async fn initialize(
        &self,
        reproducer: Arc<dyn Reproducer>,
        evaluator: Arc<dyn FitnessEvaluator>,
        mut population: Vec<Candidate>,
    ) -> Result<()> {
        if population.is_empty() {
            return Err(EvoError::Configuration(format!(
                "empty population for '{}'",
                self.inner.user_name
            )));
        }

        self.inner.transition(RunState::Ready)?;

        let mut shared = self.inner.shared.lock().await;
        if population.iter().all(|c| c.slot.is_some()) {
            shared.slot_table = SlotTable::from_population(&population);
        } else {
            let assignment = SlotAssigner::assign(&SlotTable::new(), &mut population);
            shared.slot_table = assignment.table;
        }
        shared.reproducer = Some(reproducer);
        shared.evaluator = Some(evaluator);
        shared.population = population;
        shared.champion = None;
        shared.selection = None;

        info!(
            "Initialized run '{}' with {} candidates",
            self.inner.user_name,
            shared.population.len()
        );
        Ok(())
    }

    /// Ready/Paused -> Running. Spawns the worker on first start, or wakes a
    /// parked one. Starting an already-Running run is a logged no-op.
    pub async fn start(&self) -> Result<()> {
        // Holding the worker handle lock across the whole decision keeps a
        // second concurrent start from spawning a duplicate worker.
        let mut worker = self.inner.worker.lock().await;

        match self.state() {
            RunState::Running => {
                info!("Run '{}' already running, start ignored", self.inner.user_name);
                return Ok(());
            }
            RunState::Ready => {
                self.inner.transition(RunState::Running)?;
            }
            RunState::Paused => {
                self.inner.pause_requested.store(false, Ordering::SeqCst);
                self.inner.transition(RunState::Running)?;
            }
            RunState::NotReady => {
                return Err(EvoError::Configuration(format!(
                    "run '{}' is not initialized",
                    self.inner.user_name
                )));
            }
            RunState::Terminated => {
                return Err(EvoError::InvalidTransition {
                    from: RunState::Terminated,
                    to: RunState::Running,
                });
            }
        }

        self.inner.registry.set_running(&self.inner.user_name, true).await?;

        if worker.is_some() {
            self.inner.resume_notify.notify_one();
        } else {
            let inner = Arc::clone(&self.inner);
            *worker = Some(tokio::spawn(async move {
                worker_loop(inner).await;
            }));
            info!("Spawned worker for run '{}'", self.inner.user_name);
        }
        Ok(())
    }

    /// Request a cooperative pause, observed at the next step boundary.
    /// Does not block. A no-op (logged) unless the run is Running.
    pub fn request_pause(&self) {
        if self.state() != RunState::Running {
            info!(
                "Pause requested for '{}' but run is not running, ignored",
                self.inner.user_name
            );
            return;
        }
        self.inner.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Request a pause and block until the worker has actually parked.
    pub async fn request_pause_and_wait(&self) {
        if self.state() != RunState::Running {
            info!(
                "Pause-and-wait for '{}' but run is not running, ignored",
                self.inner.user_name
            );
            return;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut ack = self.inner.pause_ack.lock().unwrap_or_else(|e| e.into_inner());
            *ack = Some(tx);
        }
        self.inner.pause_requested.store(true, Ordering::SeqCst);

        // The worker may have parked on its own (stop condition) between the
        // state check and the flag store; settle the acknowledgement instead
        // of waiting on a worker that is no longer stepping.
        if self.state() != RunState::Running {
            self.inner.send_pause_ack();
        }
        let _ = rx.await;
    }

    /// Terminate the run and wait for the worker to exit. The worker leaves
    /// without raising a `Paused` notification and never rearms.
    pub async fn request_terminate_and_wait(&self) {
        self.inner.terminate_requested.store(true, Ordering::SeqCst);
        self.inner.pause_requested.store(true, Ordering::SeqCst);
        self.inner.resume_notify.notify_one();

        let handle = self.inner.worker.lock().await.take();
        match handle {
            Some(handle) => {
                if let Err(err) = handle.await {
                    warn!("Worker join for '{}' failed: {}", self.inner.user_name, err);
                }
            }
            None => {
                // Never started; settle the state machine directly.
                let _ = self.inner.transition(RunState::Terminated);
            }
        }
        let _ = self.inner.registry.set_running(&self.inner.user_name, false).await;
    }

    /// Subscribe an observer to this run's notifications.
    pub fn subscribe(&self, observer: Arc<dyn RunObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Drop all observers; nothing fires after this returns.
    pub fn unsubscribe_all(&self) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Record the user's candidate pick for the next reproduction cycle.
    pub async fn request_next_generation(&self, candidate_index: usize, normal_mutations: bool) {
        let mut shared = self.inner.shared.lock().await;
        if candidate_index >= shared.population.len() {
            warn!(
                "Next-generation request for '{}' names candidate index {} out of {}, ignored",
                self.inner.user_name,
                candidate_index,
                shared.population.len()
            );
            return;
        }
        shared.selection = Some(SelectionRequest {
            candidate_index,
            normal_mutations,
        });
        debug!(
            "Recorded selection {} (normal={}) for '{}'",
            candidate_index, normal_mutations, self.inner.user_name
        );
    }

    /// Export one candidate's artifact into the named folder.
    pub async fn save_candidate(&self, candidate_index: usize, folder: &str) -> Result<()> {
        let label = {
            let shared = self.inner.shared.lock().await;
            match shared.population.get(candidate_index) {
                Some(candidate) => candidate.label.clone(),
                None => {
                    warn!(
                        "Save request for '{}' names candidate index {} out of {}, ignored",
                        self.inner.user_name,
                        candidate_index,
                        shared.population.len()
                    );
                    return Ok(());
                }
            }
        };
        self.inner
            .store
            .export_candidate(&self.inner.user_name, &label, folder)
            .await
    }

    /// Clone of the current population.
    pub async fn population_snapshot(&self) -> Vec<Candidate> {
        self.inner.shared.lock().await.population.clone()
    }

    /// Best (id, fitness) seen so far.
    pub async fn champion(&self) -> Option<(u64, f64)> {
        self.inner.shared.lock().await.champion
    }
}

impl RunInner {
    fn transition(&self, to: RunState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition(to) {
            return Err(EvoError::InvalidTransition { from: *state, to });
        }
        debug!("Run '{}': {} -> {}", self.user_name, *state, to);
        *state = to;
        Ok(())
    }

    fn send_pause_ack(&self) {
        let sender = self.pause_ack.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    /// Fan an event out to every subscriber. A failing subscriber is logged
    /// and isolated; it never aborts the run or the remaining subscribers.
    fn emit(&self, event: &RunEvent) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner()).clone();
        for observer in observers {
            if let Err(err) = observer.on_event(&self.user_name, event) {
                warn!("Observer for '{}' failed on {:?}: {}", self.user_name, event, err);
            }
        }
    }

    fn update_due(&self, generation: u64) -> bool {
        match self.config.update_policy {
            UpdatePolicy::EveryGenerations(n) => generation % n as u64 == 0,
            UpdatePolicy::Interval(interval) => {
                let last = self.last_update.lock().unwrap_or_else(|e| e.into_inner());
                last.elapsed() >= interval
            }
        }
    }

    fn mark_updated(&self) {
        let mut last = self.last_update.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    /// One reproduction + evaluation cycle. Returns the best fitness of the
    /// new generation.
    ///
    /// The shared lock is held only to read the inputs and to commit the
    /// results, never across the evaluation itself, so snapshot reads and
    /// commands keep flowing while a batch is in flight.
    async fn generation_step(&self) -> Result<f64> {
        let (reproducer, evaluator, population, slot_table, selection) = {
            let mut shared = self.shared.lock().await;
            let reproducer = shared
                .reproducer
                .clone()
                .ok_or_else(|| EvoError::Configuration("no reproducer".into()))?;
            let evaluator = shared
                .evaluator
                .clone()
                .ok_or_else(|| EvoError::Configuration("no evaluator".into()))?;
            (
                reproducer,
                evaluator,
                shared.population.clone(),
                shared.slot_table.clone(),
                shared.selection.take(),
            )
        };

        let mut offspring = reproducer.create_offspring(&population, selection).await?;

        let SlotAssignment {
            table,
            vacated_labels,
        } = SlotAssigner::assign(&slot_table, &mut offspring);

        self.bounded
            .evaluate_generation(&self.user_name, &reproducer, &evaluator, &mut offspring)
            .await;

        let mut best = 0.0f64;
        for candidate in &offspring {
            best = best.max(candidate.fitness);
        }

        {
            let mut shared = self.shared.lock().await;
            if best > 0.0 && shared.champion.map_or(true, |(_, f)| best > f) {
                if let Some(candidate) = offspring.iter().find(|c| c.fitness == best) {
                    shared.champion = Some((candidate.id, candidate.fitness));
                }
            }
            shared.slot_table = table;
            shared.population = offspring;
        }

        // Vacated slots release their derived artifacts exactly once.
        for label in &vacated_labels {
            if let Err(err) = self.store.delete_artifact(label, &self.user_name).await {
                warn!(
                    "Artifact deletion of '{}' for '{}' failed: {}",
                    label, self.user_name, err
                );
            }
        }

        Ok(best)
    }

    /// Persist the snapshot only if the run is still marked running at the
    /// moment of the write. Check-then-write: a write racing a concurrent
    /// stop may still land, which is tolerated.
    async fn persist_if_running(&self) {
        if !self.registry.is_running(&self.user_name).await {
            return;
        }
        let population = self.shared.lock().await.population.clone();
        if let Err(err) = self.store.save_population(&self.user_name, &population).await {
            error!("Snapshot write for '{}' failed: {}", self.user_name, err);
        }
    }
}

async fn worker_loop(inner: Arc<RunInner>) {
    debug!("Worker for '{}' entering loop", inner.user_name);

    loop {
        if inner.terminate_requested.load(Ordering::SeqCst) {
            break;
        }

        if inner.pause_requested.load(Ordering::SeqCst) {
            if inner.transition(RunState::Paused).is_ok() {
                let _ = inner.registry.set_running(&inner.user_name, false).await;
                inner.send_pause_ack();
                if !inner.terminate_requested.load(Ordering::SeqCst) {
                    inner.emit(&RunEvent::Paused);
                }
                info!("Worker for '{}' parked", inner.user_name);
                inner.resume_notify.notified().await;
            } else {
                // Not Running anymore (terminate racing in); re-check flags.
                inner.send_pause_ack();
            }
            continue;
        }

        match inner.generation_step().await {
            Ok(best_fitness) => {
                let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

                if inner.update_due(generation) {
                    inner.mark_updated();
                    inner.emit(&RunEvent::Updated {
                        generation,
                        best_fitness,
                    });
                    inner.persist_if_running().await;
                }
            }
            Err(err) => {
                error!(
                    "Generation step for '{}' failed, parking run: {}",
                    inner.user_name, err
                );
                inner.pause_requested.store(true, Ordering::SeqCst);
                continue;
            }
        }

        let search_complete = {
            let shared = inner.shared.lock().await;
            shared
                .evaluator
                .as_ref()
                .map(|e| e.search_complete())
                .unwrap_or(false)
        };
        if search_complete {
            info!("Search for '{}' reached its stop condition", inner.user_name);
            inner.pause_requested.store(true, Ordering::SeqCst);
        }
    }

    let _ = inner.transition(RunState::Terminated);
    let _ = inner.registry.set_running(&inner.user_name, false).await;
    inner.send_pause_ack();
    info!("Worker for '{}' exited", inner.user_name);
}
