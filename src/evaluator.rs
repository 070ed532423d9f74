use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use log::{debug, warn};
use lru::LruCache;

use crate::core::{Candidate, DecodedCandidate, EvalContext};
use crate::engine::{FitnessEvaluator, Reproducer};

/// Bounded-concurrency generation evaluator
///
/// Partitions a generation's population into sequential batches of at most
/// `slots` candidates and dispatches each batch concurrently, so one run
/// never has more than its execution-slot budget of evaluations in flight.
/// A slot number is handed to the next batch only after the whole previous
/// batch has joined.
///
/// Decoding results are memoized per candidate id, so a candidate surviving
/// into the next generation skips re-decoding.
pub struct BoundedEvaluator {
    slots: usize,
    decode_cache: Mutex<LruCache<u64, Option<Arc<DecodedCandidate>>>>,
}

impl BoundedEvaluator {
    pub fn new(slots: usize, decode_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(decode_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: slots.max(1),
            decode_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Evaluate the whole population in place, writing each candidate's
    /// fitness. A candidate whose evaluation fails (or that has no valid
    /// decoding) is scored 0.0 and the rest of the batch proceeds.
    pub async fn evaluate_generation(
        &self,
        user_name: &str,
        reproducer: &Arc<dyn Reproducer>,
        evaluator: &Arc<dyn FitnessEvaluator>,
        population: &mut [Candidate],
    ) {
        let total = population.len();
        let batches = total.div_ceil(self.slots);
        debug!(
            "Evaluating generation for '{}': {} candidates in {} batch(es) of <= {}",
            user_name, total, batches, self.slots
        );

        for batch in population.chunks_mut(self.slots) {
            let futures: Vec<_> = batch
                .iter()
                .enumerate()
                .map(|(slot_number, candidate)| {
                    let decoded = self.decoded_for(reproducer, candidate);
                    let evaluator = Arc::clone(evaluator);
                    let ctx = EvalContext {
                        label: candidate.label.clone(),
                        user_name: user_name.to_string(),
                        slot_number,
                    };
                    let candidate_id = candidate.id;

                    async move {
                        let Some(decoded) = decoded else {
                            debug!(
                                "Candidate {} has no valid decoding, scoring non-viable",
                                candidate_id
                            );
                            return 0.0;
                        };

                        match evaluator.evaluate(&decoded, &ctx).await {
                            Ok(fitness) => fitness,
                            Err(err) => {
                                warn!(
                                    "Evaluation of candidate {} (slot {}) for '{}' failed: {}",
                                    candidate_id, ctx.slot_number, ctx.user_name, err
                                );
                                0.0
                            }
                        }
                    }
                })
                .collect();

            let scores = join_all(futures).await;
            for (candidate, score) in batch.iter_mut().zip(scores) {
                candidate.fitness = score;
            }
        }
    }

    /// Cached decode lookup. Misses (including genomes with no valid
    /// decoding) are remembered so a bad genome is not re-decoded either.
    fn decoded_for(
        &self,
        reproducer: &Arc<dyn Reproducer>,
        candidate: &Candidate,
    ) -> Option<Arc<DecodedCandidate>> {
        let mut cache = self.decode_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(&candidate.id) {
            return cached.clone();
        }

        let decoded = reproducer.decode(candidate).map(Arc::new);
        cache.put(candidate.id, decoded.clone());
        decoded
    }
}
