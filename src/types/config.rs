//! Configuration types
//!
//! Runner configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What `unload` does while generations are still streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadPolicy {
    /// Reject with `Busy`; the caller cancels or retries
    #[default]
    Reject,
    /// Wait (bounded by `unload_wait`) for in-flight requests to finish
    Wait,
}

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Capacity of each request's token stream channel
    pub channel_capacity: usize,
    /// Upper bound for a single engine `load` or `unload`
    pub load_timeout: Duration,
    /// Deadline applied to requests that don't carry their own
    pub generation_timeout: Option<Duration>,
    pub unload_policy: UnloadPolicy,
    /// How long `unload` waits under [`UnloadPolicy::Wait`]
    pub unload_wait: Duration,
    /// Engine tried first when a load doesn't name one
    pub preferred_engine: Option<String>,
    /// Finished request ids remembered so a late `cancel` stays a no-op
    pub cancel_history: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            load_timeout: Duration::from_secs(120),
            generation_timeout: None,
            unload_policy: UnloadPolicy::Reject,
            unload_wait: Duration::from_secs(30),
            preferred_engine: None,
            cancel_history: 1024,
        }
    }
}
