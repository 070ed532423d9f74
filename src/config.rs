use std::time::Duration;

use crate::core::UpdatePolicy;

/// Runtime configuration for the evolution coordinator
///
/// Owned externally and injected; there is no global configuration source.
#[derive(Debug, Clone)]
pub struct EvolveConfig {
    /// Maximum number of concurrently registered runs
    pub max_users: usize,

    /// Concurrent evaluation channels per run (execution-slot budget)
    pub slots_per_run: usize,

    /// Population size for freshly created runs
    pub population_size: usize,

    /// A run with no contact for this long is eligible for eviction
    pub contact_timeout: Duration,

    /// Delay between stopping a parent run and starting its branch
    pub branch_grace: Duration,

    /// When a run raises update notifications and persists its snapshot
    pub update_policy: UpdatePolicy,

    /// Capacity of the per-run decoded-candidate cache
    pub decode_cache_size: usize,
}

impl EvolveConfig {
    /// Create a configuration with the given capacity limits
    pub fn new(max_users: usize, slots_per_run: usize, population_size: usize) -> Self {
        Self {
            max_users,
            slots_per_run,
            population_size,
            contact_timeout: Duration::from_secs(180), // 3 minutes
            branch_grace: Duration::from_millis(250),
            update_policy: UpdatePolicy::EveryGenerations(1),
            decode_cache_size: 256,
        }
    }

    /// Set the contact timeout used for stale-run eviction
    pub fn contact_timeout(mut self, timeout: Duration) -> Self {
        self.contact_timeout = timeout;
        self
    }

    /// Set the grace delay applied when branching
    pub fn branch_grace(mut self, grace: Duration) -> Self {
        self.branch_grace = grace;
        self
    }

    /// Set the update policy
    pub fn update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    /// Set the decoded-candidate cache capacity
    pub fn decode_cache_size(mut self, size: usize) -> Self {
        self.decode_cache_size = size;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_users == 0 {
            return Err("max_users must be > 0".to_string());
        }

        if self.slots_per_run == 0 {
            return Err("slots_per_run must be > 0".to_string());
        }

        if self.population_size == 0 {
            return Err("population_size must be > 0".to_string());
        }

        if self.decode_cache_size == 0 {
            return Err("decode_cache_size must be > 0".to_string());
        }

        if let UpdatePolicy::EveryGenerations(0) = self.update_policy {
            return Err("update_policy generation count must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for EvolveConfig {
    fn default() -> Self {
        Self::new(10, 4, 15)
    }
}
