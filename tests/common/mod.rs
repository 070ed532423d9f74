#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use evorun::{
    Candidate, DecodedCandidate, EvalContext, EvoError, FitnessEvaluator, Reproducer, Result,
    RunEvent, RunObserver, SelectionRequest,
};
use tokio::time::sleep;

/// Deterministic reproduction engine for tests.
///
/// Ids are minted from a shared counter. With `churn` enabled, each
/// generation replaces the last candidate with a fresh one; otherwise
/// offspring are an identity copy, which keeps candidate ids stable across
/// snapshot round trips.
pub struct StubReproducer {
    next_id: AtomicU64,
    churn: bool,
    pub population_calls: AtomicUsize,
    pub offspring_calls: AtomicUsize,
    pub fail_offspring: AtomicBool,
    pub selections: Mutex<Vec<SelectionRequest>>,
}

impl StubReproducer {
    pub fn new(churn: bool) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            churn,
            population_calls: AtomicUsize::new(0),
            offspring_calls: AtomicUsize::new(0),
            fail_offspring: AtomicBool::new(false),
            selections: Mutex::new(Vec::new()),
        }
    }

    fn mint(&self) -> Candidate {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Candidate::new(id, serde_json::json!({ "seed": id }))
    }
}

#[async_trait]
impl Reproducer for StubReproducer {
    async fn create_population(&self, size: usize) -> Result<Vec<Candidate>> {
        self.population_calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..size).map(|_| self.mint()).collect())
    }

    async fn create_offspring(
        &self,
        population: &[Candidate],
        selection: Option<SelectionRequest>,
    ) -> Result<Vec<Candidate>> {
        self.offspring_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_offspring.load(Ordering::SeqCst) {
            return Err(EvoError::Reproduction("stub reproduction failure".into()));
        }
        if let Some(selection) = selection {
            self.selections.lock().unwrap().push(selection);
        }

        let mut offspring = population.to_vec();
        if self.churn && !offspring.is_empty() {
            offspring.pop();
            offspring.push(self.mint());
        }
        Ok(offspring)
    }

    fn decode(&self, candidate: &Candidate) -> Option<DecodedCandidate> {
        if candidate.genome.is_null() {
            None
        } else {
            Some(DecodedCandidate(candidate.genome.clone()))
        }
    }
}

/// Paced evaluator recording in-flight counts, so tests can assert that
/// pauses land between batches rather than inside them.
pub struct StubEvaluator {
    step_delay: Duration,
    pub in_flight: AtomicUsize,
    pub eval_calls: AtomicUsize,
    pub complete: AtomicBool,
}

impl StubEvaluator {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            in_flight: AtomicUsize::new(0),
            eval_calls: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FitnessEvaluator for StubEvaluator {
    async fn evaluate(&self, decoded: &DecodedCandidate, _ctx: &EvalContext) -> Result<f64> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.eval_calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.step_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let seed = decoded.0.get("seed").and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(seed as f64)
    }

    fn search_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}

/// Observer capturing every event it sees, optionally failing on each call.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<RunEvent>>,
    pub fail: AtomicBool,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updated_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, RunEvent::Updated { .. }))
            .count()
    }

    pub fn paused_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, RunEvent::Paused))
            .count()
    }
}

impl RunObserver for RecordingObserver {
    fn on_event(&self, _user_name: &str, event: &RunEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(EvoError::Listener("recording observer told to fail".into()));
        }
        Ok(())
    }
}
