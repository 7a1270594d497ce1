use serde::Deserialize;
use std::path::PathBuf;

/// Scheduler configuration. Every field has a default so a host can start
/// from an empty config table.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedConfig {
    /// Path of the embedded state file. `None` disables persistence.
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Minimum number of states sharing a tag pair (or alert name) before
    /// the display grouping collapses them into one group.
    #[serde(default = "default_min_group_size")]
    pub min_group_size: usize,

    /// Seconds between periodic state saves while running.
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,

    /// Whether to run the background host reachability prober.
    #[serde(default)]
    pub ping_hosts: bool,

    /// Seconds between probe rounds.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// TCP port used by the reachability probe.
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Opaque timezone offsets passed through to UI clients.
    #[serde(default)]
    pub time_and_date: Vec<i64>,
}

fn default_min_group_size() -> usize {
    5
}

fn default_save_interval_secs() -> u64 {
    60
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_probe_port() -> u16 {
    22
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            state_file: None,
            min_group_size: default_min_group_size(),
            save_interval_secs: default_save_interval_secs(),
            ping_hosts: false,
            ping_interval_secs: default_ping_interval_secs(),
            probe_port: default_probe_port(),
            time_and_date: Vec::new(),
        }
    }
}
