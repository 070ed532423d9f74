// ============================================================================
// Evorun Library
// ============================================================================

pub mod config;
pub mod coordinator;
pub mod core;
pub mod engine;
pub mod evaluator;
pub mod lifecycle;
pub mod persist;
pub mod registry;
pub mod slots;

// Re-export main types for convenience
pub use config::EvolveConfig;
pub use coordinator::Coordinator;
pub use core::{
    Candidate, DecodedCandidate, EvalContext, EvoError, Result, RunEvent, RunObserver, RunState,
    SelectionRequest, UpdatePolicy,
};
pub use engine::{FitnessEvaluator, Reproducer};
pub use evaluator::BoundedEvaluator;
pub use lifecycle::RunLifecycle;
pub use persist::{FileStore, MemoryStore, PopulationStore};
pub use registry::{RegistryStats, RunEntry, RunRegistry};
pub use slots::{SlotAssigner, SlotAssignment, SlotTable};
