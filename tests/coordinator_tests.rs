/// Coordinator tests
///
/// Tests for command resolution, persistence ordering around Stop, branch
/// parentage, capacity admission, and stale-run eviction.
/// Run with: cargo test --test coordinator_tests
mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{StubEvaluator, StubReproducer};
use evorun::{
    Coordinator, EvolveConfig, FitnessEvaluator, MemoryStore, PopulationStore, Reproducer,
    RunState, UpdatePolicy,
};
use tokio::time::sleep;

struct Fixture {
    coordinator: Coordinator,
    store: Arc<MemoryStore>,
    reproducer: Arc<StubReproducer>,
}

fn fixture_with_config(config: EvolveConfig, churn: bool) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let reproducer = Arc::new(StubReproducer::new(churn));
    let evaluator = Arc::new(StubEvaluator::new(Duration::from_millis(5)));

    let coordinator = Coordinator::new(
        config,
        Arc::clone(&store) as Arc<dyn PopulationStore>,
        Arc::clone(&reproducer) as Arc<dyn Reproducer>,
        Arc::clone(&evaluator) as Arc<dyn FitnessEvaluator>,
    )
    .unwrap();

    Fixture {
        coordinator,
        store,
        reproducer,
    }
}

fn fixture(churn: bool) -> Fixture {
    let config = EvolveConfig::new(4, 3, 5)
        .update_policy(UpdatePolicy::EveryGenerations(1))
        .branch_grace(Duration::from_millis(10));
    fixture_with_config(config, churn)
}

#[tokio::test]
async fn test_start_stop_start_restores_persisted_population() {
    let fx = fixture(false);

    fx.coordinator.start_evolution("alice").await.unwrap();
    sleep(Duration::from_millis(50)).await;

    fx.coordinator.stop_evolution("alice").await;
    sleep(Duration::from_millis(40)).await; // let the worker park

    let persisted: Vec<u64> = fx
        .store
        .load_population("alice")
        .await
        .unwrap()
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();

    fx.coordinator.start_evolution("alice").await.unwrap();
    let lifecycle = fx.coordinator.lifecycle_for("alice").await.unwrap();
    let restored: Vec<u64> = lifecycle
        .population_snapshot()
        .await
        .iter()
        .map(|c| c.id)
        .collect();

    // Identity offspring keep ids stable, so a fresh population (new ids)
    // would be visible here.
    assert_eq!(restored, persisted);
}

#[tokio::test]
async fn test_second_start_is_noop() {
    let fx = fixture(false);

    fx.coordinator.start_evolution("alice").await.unwrap();
    fx.coordinator.start_evolution("alice").await.unwrap();
    fx.coordinator.start_evolution("alice").await.unwrap();

    // The population was built once; later Starts found the run running.
    assert_eq!(fx.reproducer.population_calls.load(Ordering::SeqCst), 1);

    let lifecycle = fx.coordinator.lifecycle_for("alice").await.unwrap();
    assert_eq!(lifecycle.state(), RunState::Running);
}

#[tokio::test]
async fn test_concurrent_starts_leave_one_worker() {
    let fx = Arc::new(fixture(false));

    let mut handles = vec![];
    for _ in 0..8 {
        let fx = Arc::clone(&fx);
        handles.push(tokio::spawn(async move {
            fx.coordinator.start_evolution("alice").await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(fx.reproducer.population_calls.load(Ordering::SeqCst), 1);
    let lifecycle = fx.coordinator.lifecycle_for("alice").await.unwrap();
    assert_eq!(lifecycle.state(), RunState::Running);
}

#[tokio::test]
async fn test_stop_twice_causes_no_duplicate_persist() {
    let fx = fixture(false);

    fx.coordinator.start_evolution("alice").await.unwrap();
    sleep(Duration::from_millis(40)).await;

    fx.coordinator.stop_evolution("alice").await;
    sleep(Duration::from_millis(40)).await; // worker parks, no further writes

    let saves_after_stop = fx.store.save_count();
    fx.coordinator.stop_evolution("alice").await;
    sleep(Duration::from_millis(20)).await;

    assert_eq!(fx.store.save_count(), saves_after_stop);
}

#[tokio::test]
async fn test_stop_persists_before_clearing_running_flag() {
    let fx = fixture(false);

    fx.coordinator.start_evolution("alice").await.unwrap();
    sleep(Duration::from_millis(30)).await;
    fx.coordinator.stop_evolution("alice").await;

    // The stop-time write happened even though the flag is already down.
    assert!(fx.store.load_population("alice").await.unwrap().is_some());
    assert!(!fx.coordinator.registry().is_running("alice").await);
}

#[tokio::test]
async fn test_reset_discards_old_population() {
    let fx = fixture(false);

    fx.coordinator.start_evolution("alice").await.unwrap();
    sleep(Duration::from_millis(30)).await;

    let lifecycle = fx.coordinator.lifecycle_for("alice").await.unwrap();
    let old_ids: Vec<u64> = lifecycle
        .population_snapshot()
        .await
        .iter()
        .map(|c| c.id)
        .collect();

    fx.coordinator.reset_evolution("alice").await.unwrap();

    let lifecycle = fx.coordinator.lifecycle_for("alice").await.unwrap();
    let new_ids: Vec<u64> = lifecycle
        .population_snapshot()
        .await
        .iter()
        .map(|c| c.id)
        .collect();

    assert_eq!(lifecycle.state(), RunState::Running);
    assert_ne!(old_ids, new_ids);
}

#[tokio::test]
async fn test_branch_carries_parentage_and_population() {
    let fx = fixture(false);

    fx.coordinator.start_evolution("alice").await.unwrap();
    sleep(Duration::from_millis(40)).await;

    let branch_name = fx.coordinator.branch("alice").await.unwrap();
    assert!(branch_name.starts_with("alice_branch_"));

    let entry = fx.coordinator.registry().get(&branch_name).await.unwrap();
    assert_eq!(entry.parent(), Some("alice"));

    // The parent was stopped, the branch is running its inherited population.
    assert!(!fx.coordinator.registry().is_running("alice").await);
    assert!(fx.coordinator.registry().is_running(&branch_name).await);

    let parent_ids: Vec<u64> = fx
        .store
        .load_population("alice")
        .await
        .unwrap()
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    let branch_lifecycle = fx.coordinator.lifecycle_for(&branch_name).await.unwrap();
    let branch_ids: Vec<u64> = branch_lifecycle
        .population_snapshot()
        .await
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(branch_ids, parent_ids);
}

#[tokio::test]
async fn test_commands_for_unknown_users_are_noops() {
    let fx = fixture(false);

    fx.coordinator.stop_evolution("ghost").await;
    fx.coordinator.request_next_generation("ghost", 0, true).await;
    fx.coordinator.save_candidate("ghost", 0, "folder").await;
    assert!(fx.coordinator.branch("ghost").await.is_err());

    assert!(!fx.coordinator.registry().exists("ghost").await);
    assert_eq!(fx.store.save_count(), 0);
}

#[tokio::test]
async fn test_start_rejected_at_capacity_with_active_runs() {
    let config = EvolveConfig::new(2, 2, 4).contact_timeout(Duration::from_secs(3600));
    let fx = fixture_with_config(config, false);

    fx.coordinator.start_evolution("a").await.unwrap();
    fx.coordinator.start_evolution("b").await.unwrap();

    let rejected = fx.coordinator.start_evolution("c").await;
    assert!(rejected.is_err());
    assert!(!fx.coordinator.registry().exists("c").await);
}

#[tokio::test]
async fn test_capacity_check_evicts_stale_runs() {
    // Zero contact timeout: every idle run is immediately stale.
    let config = EvolveConfig::new(1, 2, 4).contact_timeout(Duration::ZERO);
    let fx = fixture_with_config(config, false);

    fx.coordinator.start_evolution("old").await.unwrap();
    sleep(Duration::from_millis(30)).await;

    fx.coordinator.start_evolution("new").await.unwrap();

    // The stale run was torn down before removal: its lifecycle handle is
    // gone and nothing fires for it afterwards.
    assert!(!fx.coordinator.registry().exists("old").await);
    assert!(fx.coordinator.lifecycle_for("old").await.is_none());
    assert!(fx.coordinator.registry().is_running("new").await);

    // The evicted run's snapshot no longer changes.
    let ids = |p: Option<Vec<evorun::Candidate>>| {
        p.map(|p| p.iter().map(|c| c.id).collect::<Vec<_>>())
    };
    let old_population = ids(fx.store.load_population("old").await.unwrap());
    sleep(Duration::from_millis(60)).await;
    let old_population_later = ids(fx.store.load_population("old").await.unwrap());
    assert_eq!(old_population, old_population_later);
}

#[tokio::test]
async fn test_command_locks_do_not_accumulate() {
    let fx = fixture(false);

    // Commands for unknown users must not leave per-user state behind.
    for i in 0..20 {
        fx.coordinator.stop_evolution(&format!("ghost{}", i)).await;
        assert!(fx.coordinator.branch(&format!("ghost{}", i)).await.is_err());
    }
    assert_eq!(fx.coordinator.command_lock_count().await, 0);

    // Nor must commands for real runs, once they finish.
    fx.coordinator.start_evolution("alice").await.unwrap();
    fx.coordinator.stop_evolution("alice").await;
    assert_eq!(fx.coordinator.command_lock_count().await, 0);
}

#[tokio::test]
async fn test_next_generation_selection_is_delivered() {
    let fx = fixture(false);

    fx.coordinator.start_evolution("alice").await.unwrap();
    fx.coordinator.request_next_generation("alice", 1, false).await;
    sleep(Duration::from_millis(50)).await;
    fx.coordinator.stop_evolution("alice").await;

    let selections = fx.reproducer.selections.lock().unwrap().clone();
    assert_eq!(selections.len(), 1);
    assert_eq!(selections[0].candidate_index, 1);
    assert!(!selections[0].normal_mutations);
}

#[tokio::test]
async fn test_save_candidate_round_trip() {
    let fx = fixture(false);

    fx.coordinator.start_evolution("alice").await.unwrap();
    sleep(Duration::from_millis(20)).await;
    fx.coordinator.save_candidate("alice", 0, "keepers").await;

    let exports = fx.store.exports();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].0, "alice");
    assert_eq!(exports[0].2, "keepers");
}

#[tokio::test]
async fn test_stop_does_not_block_on_inflight_batch() {
    // Long evaluations: stop must return while the batch is still running.
    let store = Arc::new(MemoryStore::new());
    let reproducer = Arc::new(StubReproducer::new(false));
    let evaluator = Arc::new(StubEvaluator::new(Duration::from_millis(200)));
    let config = EvolveConfig::new(4, 2, 4).branch_grace(Duration::from_millis(10));
    let coordinator = Coordinator::new(
        config,
        Arc::clone(&store) as Arc<dyn PopulationStore>,
        Arc::clone(&reproducer) as Arc<dyn Reproducer>,
        Arc::clone(&evaluator) as Arc<dyn FitnessEvaluator>,
    )
    .unwrap();

    coordinator.start_evolution("alice").await.unwrap();
    sleep(Duration::from_millis(20)).await;

    let before = std::time::Instant::now();
    coordinator.stop_evolution("alice").await;
    assert!(before.elapsed() < Duration::from_millis(150));

    // The running flag dropped immediately, before the worker parked.
    assert!(!coordinator.registry().is_running("alice").await);
    let lifecycle = coordinator.lifecycle_for("alice").await.unwrap();
    assert_eq!(lifecycle.state(), RunState::Running);

    // A restart right away is not blocked by the unparked worker.
    coordinator.start_evolution("alice").await.unwrap();
    assert!(coordinator.registry().is_running("alice").await);
}
