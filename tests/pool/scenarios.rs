//! BDD scenarios for the worker pool.

use rstest_bdd_macros::scenario;

use super::test_helpers::{PoolContext, pool_context};

#[scenario(
    path = "tests/features/pool.feature",
    name = "Outcomes line up with registration order"
)]
fn scenario_outcomes_in_order(pool_context: PoolContext) {
    let _ = pool_context;
}

#[scenario(
    path = "tests/features/pool.feature",
    name = "A refused host does not disturb the others"
)]
fn scenario_failure_isolation(pool_context: PoolContext) {
    let _ = pool_context;
}

#[scenario(
    path = "tests/features/pool.feature",
    name = "Concurrency stays within the configured limit"
)]
fn scenario_bounded_concurrency(pool_context: PoolContext) {
    let _ = pool_context;
}

#[scenario(
    path = "tests/features/pool.feature",
    name = "Interrupting a run reports unfinished jobs as absent"
)]
fn scenario_interrupted_run(pool_context: PoolContext) {
    let _ = pool_context;
}
