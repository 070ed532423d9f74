use async_trait::async_trait;

use crate::core::{Candidate, DecodedCandidate, EvalContext, Result, SelectionRequest};

/// Reproduction engine collaborator
///
/// Owns the genome encoding, candidate id minting, and the
/// mutation/crossover/speciation operators. The coordination core only moves
/// populations through it.
#[async_trait]
pub trait Reproducer: Send + Sync {
    /// Create a fresh population of the given size.
    async fn create_population(&self, size: usize) -> Result<Vec<Candidate>>;

    /// Produce the next generation from the current population.
    ///
    /// `selection` carries the user's pick from a pending
    /// RequestNextGeneration command, if any.
    async fn create_offspring(
        &self,
        population: &[Candidate],
        selection: Option<SelectionRequest>,
    ) -> Result<Vec<Candidate>>;

    /// Decode a candidate into its evaluable form.
    ///
    /// `None` means the genome has no valid decoding; such a candidate is
    /// scored non-viable without an evaluator call.
    fn decode(&self, candidate: &Candidate) -> Option<DecodedCandidate>;
}

/// External evaluation environment collaborator
#[async_trait]
pub trait FitnessEvaluator: Send + Sync {
    /// Evaluate one decoded candidate on one execution slot.
    async fn evaluate(&self, decoded: &DecodedCandidate, ctx: &EvalContext) -> Result<f64>;

    /// The evaluator's own stop condition, checked at step boundaries.
    fn search_complete(&self) -> bool {
        false
    }
}
