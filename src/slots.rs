use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::Candidate;

/// Per-run slot table for one generation
///
/// Bijection from in-use slot indices to labels, with a reverse map from
/// candidate id to slot index. Slot indices in use are always the smallest
/// available non-negative integers; labels are minted monotonically and
/// never reused.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotTable {
    by_candidate: HashMap<u64, SlotBinding>,
    next_label: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SlotBinding {
    slot: usize,
    label: String,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_of(&self, candidate_id: u64) -> Option<usize> {
        self.by_candidate.get(&candidate_id).map(|b| b.slot)
    }

    pub fn label_of(&self, candidate_id: u64) -> Option<&str> {
        self.by_candidate.get(&candidate_id).map(|b| b.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_candidate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_candidate.is_empty()
    }

    /// Rebuild a table from a persisted population whose candidates already
    /// carry slots and labels. The label counter resumes past the highest
    /// persisted label number, so restored runs keep minting fresh labels.
    pub fn from_population(population: &[Candidate]) -> Self {
        let mut table = SlotTable::new();
        for candidate in population {
            let Some(slot) = candidate.slot else { continue };
            table.by_candidate.insert(
                candidate.id,
                SlotBinding {
                    slot,
                    label: candidate.label.clone(),
                },
            );
            if let Some(n) = candidate
                .label
                .strip_prefix("Candidate")
                .and_then(|n| n.parse::<u64>().ok())
            {
                table.next_label = table.next_label.max(n + 1);
            }
        }
        table
    }

    fn label_at_slot(&self, slot: usize) -> Option<&str> {
        self.by_candidate
            .values()
            .find(|b| b.slot == slot)
            .map(|b| b.label.as_str())
    }
}

/// Result of one generation's slot assignment.
#[derive(Debug)]
pub struct SlotAssignment {
    pub table: SlotTable,
    /// Labels vacated this generation whose derived artifacts should be
    /// deleted, each reported exactly once.
    pub vacated_labels: Vec<String>,
}

/// Recomputes the stable candidate-to-slot mapping each generation.
pub struct SlotAssigner;

impl SlotAssigner {
    /// Assign slots and labels for the current generation, rewriting each
    /// candidate's `slot` and `label` in place.
    ///
    /// Carried-forward candidates keep their previous slot and label. Any
    /// index in `[0, population.len())` not claimed by a carry-forward is
    /// vacant; a label previously bound there is reported for artifact
    /// deletion. New candidates take the smallest free index and a freshly
    /// minted label.
    ///
    /// Known limitation, kept as observed behavior: the vacancy scan stops
    /// at the current population size, so when the population shrinks, a
    /// label bound at or beyond the new size is never revisited for
    /// deletion.
    pub fn assign(previous: &SlotTable, population: &mut [Candidate]) -> SlotAssignment {
        let mut table = SlotTable {
            by_candidate: HashMap::with_capacity(population.len()),
            next_label: previous.next_label,
        };

        // Carry-forward: survivors keep slot and label.
        let mut claimed: HashSet<usize> = HashSet::new();
        for candidate in population.iter_mut() {
            if let Some(binding) = previous.by_candidate.get(&candidate.id) {
                candidate.slot = Some(binding.slot);
                candidate.label = binding.label.clone();
                claimed.insert(binding.slot);
                table.by_candidate.insert(candidate.id, binding.clone());
            }
        }

        // Vacancy detection, bounded by the current population size.
        let mut vacated_labels = Vec::new();
        for slot in 0..population.len() {
            if !claimed.contains(&slot) {
                if let Some(label) = previous.label_at_slot(slot) {
                    vacated_labels.push(label.to_string());
                }
            }
        }

        // Allocation: smallest free index, never-reused label.
        for candidate in population.iter_mut() {
            if table.by_candidate.contains_key(&candidate.id) {
                continue;
            }

            let slot = (0..).find(|s| !claimed.contains(s)).unwrap_or(0);
            claimed.insert(slot);

            let label = format!("Candidate{}", table.next_label);
            table.next_label += 1;

            candidate.slot = Some(slot);
            candidate.label = label.clone();
            table
                .by_candidate
                .insert(candidate.id, SlotBinding { slot, label });
        }

        SlotAssignment {
            table,
            vacated_labels,
        }
    }
}
