use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Result;

/// Lifecycle state of a single run.
///
/// Transitions are monotonic along
/// `NotReady -> Ready -> (Running <-> Paused) -> Terminated`;
/// `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    NotReady,
    Ready,
    Running,
    Paused,
    Terminated,
}

impl RunState {
    /// Whether a transition from `self` to `to` is allowed.
    pub fn can_transition(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (NotReady, Ready) => true,
            (Ready, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Ready, Terminated) | (Running, Terminated) | (Paused, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::NotReady => "NotReady",
            RunState::Ready => "Ready",
            RunState::Running => "Running",
            RunState::Paused => "Paused",
            RunState::Terminated => "Terminated",
        };
        write!(f, "{}", name)
    }
}

/// One individual within a run's population.
///
/// The genome is opaque to the coordination core; the reproduction engine
/// owns its encoding. A fitness of `0.0` marks a non-viable candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Process-wide unique id minted by the reproduction engine.
    pub id: u64,
    /// Display label, rewritten by slot assignment each generation.
    pub label: String,
    /// Stable artifact-keying slot index, assigned per generation.
    pub slot: Option<usize>,
    pub fitness: f64,
    pub genome: serde_json::Value,
}

impl Candidate {
    pub fn new(id: u64, genome: serde_json::Value) -> Self {
        Self {
            id,
            label: String::new(),
            slot: None,
            fitness: 0.0,
            genome,
        }
    }
}

/// Evaluable form of a candidate, produced by decoding its genome.
///
/// Opaque to this core; only the external evaluator interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedCandidate(pub serde_json::Value);

/// Per-dispatch context handed to the external evaluator.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub label: String,
    pub user_name: String,
    /// Batch-relative execution slot, `0..slots_per_run`.
    pub slot_number: usize,
}

/// A user's pick driving the next reproduction cycle.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest {
    pub candidate_index: usize,
    pub normal_mutations: bool,
}

/// Notification raised by a run's worker to its subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The update predicate fired after a generation step.
    Updated { generation: u64, best_fitness: f64 },
    /// The worker parked on a cooperative pause request.
    Paused,
}

/// When a run raises `RunEvent::Updated` and persists its snapshot.
#[derive(Debug, Clone, Copy)]
pub enum UpdatePolicy {
    /// Every N generations.
    EveryGenerations(u32),
    /// Whenever at least this much wall-clock time passed since the last update.
    Interval(Duration),
}

/// Subscriber to one run's notifications.
///
/// A failing observer is logged and isolated; it never affects the run or
/// the other observers.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, user_name: &str, event: &RunEvent) -> Result<()>;
}
