use serde::Deserialize;

/// Engine tunables. All fields have working defaults so a partial JSON
/// config (or none at all) is enough to bring the engine up.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of independently lockable hash buckets.
    pub bucket_count: usize,
    /// Capacity of the delayed-close grace list for zero-ref nodes.
    pub delayed_close_size: usize,
    /// Child counts at or below this get a full hint set cached on the parent.
    pub small_hint_threshold: usize,
    /// Synthesize negative child nodes for misses under large parents.
    /// Turning this off only loses the short-circuit, never correctness.
    pub cache_fake_nodes: bool,
    /// Max symlink redirections `resolve_follow` will chase.
    pub symlink_hop_budget: u32,
    /// Max restarts of a single resolution on concurrent staleness.
    pub retry_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_count: 1024,
            delayed_close_size: 128,
            small_hint_threshold: 200,
            cache_fake_nodes: true,
            symlink_hop_budget: 32,
            retry_budget: 16,
        }
    }
}
