use serde::{Deserialize, Serialize};

/// Scheduler behavior/configuration knobs.
///
/// All knobs map to recognized request options; unknown options are ignored
/// by the loader so older clients keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketizerConfig {
    /// Cap on remote workers concurrently assigned files on one host.
    ///
    /// Local workers on their home node are never capped.
    pub max_workers_per_node: u32,
    /// Whether network transfer is assumed faster than local disk.
    ///
    /// Selects the node-ordering mode: `true` prefers nodes with fewer
    /// running workers, `false` prefers nodes whose resident workers are
    /// busy elsewhere.
    pub network_faster_than_hd: bool,
    /// Dimensionless weight > 1 biasing assignment toward locality.
    pub base_local_preference: f32,
    /// Packet size as a fraction of one worker's estimated remaining share.
    ///
    /// A value of 4 targets packets of ~1/4 of what one worker can still do.
    #[serde(default = "default_packet_as_fraction")]
    pub packet_as_fraction: u32,
    /// Lower bound on the targeted per-packet processing time in seconds.
    #[serde(default = "default_min_packet_time_secs")]
    pub min_packet_time_secs: f32,
    /// Progress notification step during validation, in percent of files.
    #[serde(default = "default_progress_step_percent")]
    pub progress_step_percent: u32,
}

fn default_packet_as_fraction() -> u32 {
    4
}

fn default_min_packet_time_secs() -> f32 {
    2.0
}

fn default_progress_step_percent() -> u32 {
    2
}

fn default_max_workers_per_node() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2)
        .max(2)
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            max_workers_per_node: default_max_workers_per_node(),
            network_faster_than_hd: true,
            base_local_preference: 1.2,
            packet_as_fraction: default_packet_as_fraction(),
            min_packet_time_secs: default_min_packet_time_secs(),
            progress_step_percent: default_progress_step_percent(),
        }
    }
}
