//! Shared fixtures for worker pool scenarios.

use std::num::NonZeroUsize;
use std::time::Duration;

use multissh::test_support::ScriptedConnector;
use multissh::{JobOutcome, PoolSettings};
use rstest::fixture;

#[derive(Clone, Debug)]
pub struct PoolContext {
    pub connector: ScriptedConnector,
    pub hosts: Vec<String>,
    pub command: String,
    pub settings: PoolSettings,
    pub outcomes: Option<Vec<JobOutcome<()>>>,
    pub elapsed: Option<Duration>,
}

impl PoolContext {
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.settings.concurrency = NonZeroUsize::new(limit)
            .unwrap_or_else(|| panic!("concurrency limit must be non-zero, got {limit}"));
        self
    }
}

#[fixture]
pub fn pool_context() -> PoolContext {
    PoolContext {
        connector: ScriptedConnector::new(),
        hosts: Vec::new(),
        command: String::from("true"),
        settings: PoolSettings::default(),
        outcomes: None,
        elapsed: None,
    }
}
